//! HTTP处理器

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, NaiveDate, Utc};
use ris_core::{OrderLevel, RisError, User};
use ris_database::{EntityStore, NewTeam, OrderFilter};
use ris_workflow::{ImageService, OrderForm, PatientForm, PendingUpload};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "RIS Web API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "login": "/auth/login",
            "api": "/api/v1",
            "public": "/public/order"
        }
    }))
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ========== 患者 ==========

#[derive(Debug, Deserialize)]
pub struct PatientLookupParams {
    pub birth_date: NaiveDate,
}

/// 按出生日期查找患者
pub async fn lookup_patients(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(params): Query<PatientLookupParams>,
) -> ApiResult<impl IntoResponse> {
    debug!("Patient lookup by {} for {}", user.username, params.birth_date);

    let patients = state
        .engine
        .intake()
        .lookup_patients(&user, params.birth_date, Utc::now().date_naive())
        .await?;

    Ok(Json(json!({
        "total": patients.len(),
        "patients": patients,
    })))
}

/// 登记新患者
pub async fn create_patient(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(form): Json<PatientForm>,
) -> ApiResult<impl IntoResponse> {
    let patient = state
        .engine
        .intake()
        .create_patient(&user, form, Utc::now().date_naive())
        .await?;

    let next = format!("/api/v1/patients/{}/orders", patient.id);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "patient": patient, "next": next })),
    ))
}

/// 患者详情及其订单
pub async fn get_patient(
    State(state): State<AppState>,
    Path(patient_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let store = state.engine.store();
    let patient = store.get_patient(patient_id).await?;
    let orders = store
        .list_orders(&OrderFilter {
            patient_id: Some(patient_id),
            level: None,
        })
        .await?;

    Ok(Json(json!({ "patient": patient, "orders": orders })))
}

/// 删除患者（管理员）
pub async fn delete_patient(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(patient_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.engine.delete_patient(&user, patient_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 为患者开新订单
pub async fn create_order(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(patient_id): Path<Uuid>,
    Json(form): Json<OrderForm>,
) -> ApiResult<impl IntoResponse> {
    let order = state
        .engine
        .intake()
        .create_order(&user, patient_id, form)
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

// ========== 订单 ==========

#[derive(Debug, Deserialize)]
pub struct OrderQueryParams {
    pub level: Option<i32>,
    pub patient_id: Option<Uuid>,
}

/// 订单列表，可按级别和患者过滤
pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<OrderQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = OrderFilter {
        patient_id: params.patient_id,
        level: params.level.map(OrderLevel::try_from).transpose()?,
    };
    let orders = state.engine.list_orders(&filter).await?;

    Ok(Json(json!({
        "total": orders.len(),
        "orders": orders,
    })))
}

/// 订单详情及当前用户可用的表单
pub async fn get_order(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let view = state.engine.view_order(order_id, &user).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct AssignTeamRequest {
    pub team_id: Uuid,
}

/// 签到并分配团队（1 → 2）
pub async fn assign_team(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<AssignTeamRequest>,
) -> ApiResult<impl IntoResponse> {
    let order = state
        .engine
        .assign_team(order_id, &user, request.team_id)
        .await?;
    Ok(Json(order))
}

/// 完成影像检查（2 → 3）
pub async fn complete_imaging(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let order = state.engine.complete_imaging(order_id, &user).await?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    pub report: String,
}

/// 提交诊断报告（3 → 4）
pub async fn submit_report(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ReportRequest>,
) -> ApiResult<impl IntoResponse> {
    let order = state
        .engine
        .submit_report(order_id, &user, &request.report)
        .await?;
    Ok(Json(order))
}

/// 归档（4 → 5，管理员）
pub async fn archive_order(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let order = state.engine.archive(order_id, &user).await?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct AppointmentRequest {
    /// 为空时清除预约
    pub appointment: Option<DateTime<Utc>>,
}

/// 设置或清除预约
pub async fn schedule_appointment(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<AppointmentRequest>,
) -> ApiResult<impl IntoResponse> {
    let order = state
        .engine
        .scheduler()
        .schedule(order_id, &user, request.appointment, Utc::now())
        .await?;
    Ok(Json(order))
}

/// 生成公开访问密钥并发邮件给患者
pub async fn email_patient(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let issued = state.engine.order_keys().issue(order_id, &user).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "ok",
            "message": "Email sent!",
            "order_key": issued.order_key,
            "link": issued.link,
        })),
    ))
}

// ========== 影像 ==========

/// 上传影像，表单字段为 `label` 和 `image`
///
/// 文件内容按块写入存储，累计超过上限时立即返回 413，不在内存中缓存整个文件。
pub async fn upload_image(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(order_id): Path<Uuid>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let images = state.engine.images();
    let mut label = String::new();
    let mut pending: Option<PendingUpload> = None;

    let form = read_upload_form(images, &user, order_id, &mut multipart, &mut label, &mut pending);
    if let Err(e) = form.await {
        if let Some(upload) = pending.take() {
            images.abort_upload(upload).await;
        }
        return Err(e);
    }

    let upload = pending.ok_or_else(|| RisError::validation("image", "请选择要上传的文件"))?;
    let image = images.finish_upload(upload, &label).await?;

    Ok((StatusCode::CREATED, Json(image)))
}

async fn read_upload_form(
    images: &ImageService,
    user: &User,
    order_id: Uuid,
    multipart: &mut Multipart,
    label: &mut String,
    pending: &mut Option<PendingUpload>,
) -> ApiResult<()> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("label") => *label = field.text().await.map_err(multipart_error)?,
            Some("image") => {
                if pending.is_some() {
                    return Err(RisError::validation("image", "一次只能上传一个文件").into());
                }
                let filename = field.file_name().unwrap_or_default().to_string();
                let upload = pending.insert(images.begin_upload(order_id, user, &filename).await?);
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    upload.write_chunk(&chunk).await?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::Rejected {
        status: err.status(),
        message: err.body_text(),
    }
}

fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "dcm" => "application/dicom",
        _ => "application/octet-stream",
    }
}

/// 下载影像文件
pub async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let (image, data) = state.engine.images().download(image_id).await?;
    let filename = image
        .file_path
        .rsplit('/')
        .next()
        .unwrap_or("image")
        .replace('"', "");

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&image.file_path).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", filename),
            ),
        ],
        data,
    ))
}

/// 删除影像
pub async fn delete_image(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(image_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let image = state.engine.images().delete(image_id, &user).await?;
    info!("Image {} removed via API", image.id);
    Ok(Json(json!({ "deleted": image.id, "order_id": image.order_id })))
}

// ========== 团队 ==========

pub async fn list_teams(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let teams = state.engine.store().list_teams().await?;
    Ok(Json(json!({ "total": teams.len(), "teams": teams })))
}

pub async fn create_team(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(team): Json<NewTeam>,
) -> ApiResult<impl IntoResponse> {
    let team = state.engine.create_team(&user, team).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

// ========== 公开访问 ==========

#[derive(Debug, Deserialize)]
pub struct PublicOrderParams {
    pub key: String,
}

/// 患者凭密钥查看报告，无需登录
pub async fn public_order(
    State(state): State<AppState>,
    Query(params): Query<PublicOrderParams>,
) -> ApiResult<impl IntoResponse> {
    let view = state.engine.order_keys().resolve(&params.key).await?;
    Ok(Json(view))
}
