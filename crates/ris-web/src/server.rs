//! Web服务器

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware,
    routing::{get, post, put},
    Router,
};
use ris_storage::MAX_UPLOAD_BYTES;
use ris_workflow::WorkflowEngine;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::auth::{auth_middleware, get_current_user, login_handler, logout_handler, AuthService};
use crate::handlers::{
    api_root, archive_order, assign_team, complete_imaging, create_order, create_patient,
    create_team, delete_image, delete_patient, email_patient, get_image, get_order, get_patient,
    health, list_orders, list_teams, lookup_patients, public_order, schedule_appointment,
    submit_report, upload_image,
};

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub auth: AuthService,
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// 服务器选项
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// 请求体上限，需要容纳最大影像加上表单开销
    pub body_limit: usize,
    pub request_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            body_limit: MAX_UPLOAD_BYTES as usize + 1024 * 1024,
            request_timeout: Duration::from_secs(300),
        }
    }
}

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState, options: ServerOptions) -> Self {
        let app = Self::create_app(state, &options);
        Self { addr, app }
    }

    pub fn create_app(state: AppState, options: &ServerOptions) -> Router {
        // 需要认证的路由
        let protected = Router::new()
            .route("/auth/me", get(get_current_user))
            .route("/auth/logout", post(logout_handler))
            .nest("/api/v1", api_routes())
            .route_layer(middleware::from_fn_with_state(
                state.auth.clone(),
                auth_middleware,
            ));

        Router::new()
            .route("/", get(api_root))
            .route("/health", get(health))
            .route("/auth/login", post(login_handler))
            .route("/public/order", get(public_order))
            .merge(protected)
            .layer(DefaultBodyLimit::max(options.body_limit))
            // 全局中间件
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(options.request_timeout))
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    ),
            )
            .with_state(state)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start web server: {}", e))?;

        info!("Web server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// API v1 路由
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/patients", get(lookup_patients).post(create_patient))
        .route("/patients/:id", get(get_patient).delete(delete_patient))
        .route("/patients/:id/orders", post(create_order))
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/team", post(assign_team))
        .route("/orders/:id/imaging", post(complete_imaging))
        .route("/orders/:id/report", post(submit_report))
        .route("/orders/:id/archive", post(archive_order))
        .route("/orders/:id/appointment", put(schedule_appointment))
        .route("/orders/:id/images", post(upload_image))
        .route("/orders/:id/email", post(email_patient))
        .route("/images/:id", get(get_image).delete(delete_image))
        .route("/teams", get(list_teams).post(create_team))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use ris_core::utils::digest_secret;
    use ris_core::{
        AppSettings, MailMessage, MemoryDirectory, NotificationSender, Role, Team, User,
    };
    use ris_database::{EntityStore, MemoryStore, NewTeam};
    use ris_storage::FileStorage;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct NullSender;

    #[async_trait]
    impl NotificationSender for NullSender {
        async fn send(&self, _message: &MailMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct TestApp {
        app: Router,
        team: Team,
        storage: TempDir,
    }

    fn user(username: &str, role: Role) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: format!("{}@ris.local", username),
            name: username.to_string(),
            roles: vec![role],
            is_active: true,
        }
    }

    async fn test_app() -> TestApp {
        test_app_with_upload_limit(MAX_UPLOAD_BYTES).await
    }

    async fn test_app_with_upload_limit(max_upload_bytes: u64) -> TestApp {
        let directory = Arc::new(MemoryDirectory::new());
        let auth = AuthService::new(directory.clone(), 24);

        let technician = user("tech", Role::Technician);
        let radiologist = user("rad", Role::Radiologist);
        for account in [
            user("admin", Role::Administrator),
            user("physician", Role::Physician),
            user("frontdesk", Role::Receptionist),
            technician.clone(),
            radiologist.clone(),
        ] {
            let password = format!("pw-{}", account.username);
            auth.register(account, &digest_secret(&password)).await;
        }

        let store = Arc::new(MemoryStore::new());
        let team = store
            .create_team(NewTeam {
                name: "MRI".to_string(),
                technicians: vec![technician.id],
                radiologists: vec![radiologist.id],
            })
            .await
            .unwrap();

        let storage = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(
            store,
            directory,
            Arc::new(NullSender),
            FileStorage::new(storage.path()).with_max_upload_bytes(max_upload_bytes),
            AppSettings {
                show_prototype: true,
                email_enabled: false,
            },
            "http://ris.test",
        );

        let app = WebServer::create_app(AppState { engine, auth }, &ServerOptions::default());
        TestApp {
            app,
            team,
            storage,
        }
    }

    impl TestApp {
        async fn call(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, bytes.to_vec())
        }

        async fn json(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let (status, bytes) = self.call(request).await;
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }

        async fn login(&self, username: &str) -> String {
            let (status, body) = self
                .json(
                    Method::POST,
                    "/auth/login",
                    None,
                    Some(json!({ "username": username, "password": format!("pw-{}", username) })),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            body["token"].as_str().unwrap().to_string()
        }
    }

    fn multipart_upload(uri: &str, token: &str, label: &str, filename: &str, data: &str) -> Request<Body> {
        let boundary = "ris-test-boundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"label\"\r\n\r\n{label}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n{data}\r\n--{b}--\r\n",
            b = boundary,
        );
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_public_routes() {
        let app = test_app().await;

        let (status, body) = app.json(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = app.json(Method::GET, "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "RIS Web API");
    }

    #[tokio::test]
    async fn test_authentication_required() {
        let app = test_app().await;

        let (status, body) = app.json(Method::GET, "/api/v1/orders", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], true);

        let (status, _) = app
            .json(Method::GET, "/api/v1/orders", Some("forged"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app
            .json(
                Method::POST,
                "/auth/login",
                None,
                Some(json!({ "username": "admin", "password": "wrong" })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = app.login("frontdesk").await;
        let (status, body) = app.json(Method::GET, "/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "frontdesk");
        assert_eq!(body["roles"][0], "receptionist");
    }

    #[tokio::test]
    async fn test_order_lifecycle_over_http() {
        let app = test_app().await;
        let physician = app.login("physician").await;
        let frontdesk = app.login("frontdesk").await;
        let tech = app.login("tech").await;
        let rad = app.login("rad").await;
        let admin = app.login("admin").await;

        // 登记患者并开单
        let (status, body) = app
            .json(
                Method::POST,
                "/api/v1/patients",
                Some(&physician),
                Some(json!({
                    "first_name": "Ada",
                    "last_name": "Lovelace",
                    "email": "ada@example.com",
                    "phone_number": "(513) 555-0199",
                    "birth_date": "1990-05-01",
                    "allergy_latex": true
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let patient_id = body["patient"]["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .json(
                Method::GET,
                "/api/v1/patients?birth_date=1990-05-01",
                Some(&physician),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        let (status, order) = app
            .json(
                Method::POST,
                &format!("/api/v1/patients/{}/orders", patient_id),
                Some(&physician),
                Some(json!({ "visit_reason": "Knee pain", "modality": "MRI" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["level"], 1);
        let order_uri = format!("/api/v1/orders/{}", order["id"].as_str().unwrap());

        // 预约与签到
        let (status, _) = app
            .json(
                Method::PUT,
                &format!("{}/appointment", order_uri),
                Some(&frontdesk),
                Some(json!({ "appointment": "2099-01-01T10:00:00Z" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let assign = json!({ "team_id": app.team.id });
        let (status, body) = app
            .json(Method::POST, &format!("{}/team", order_uri), Some(&frontdesk), Some(assign.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], 2);

        let (status, _) = app
            .json(Method::POST, &format!("{}/team", order_uri), Some(&frontdesk), Some(assign))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // 技师上传影像并完成检查
        let (status, bytes) = app
            .call(multipart_upload(
                &format!("{}/images", order_uri),
                &tech,
                "Sagittal",
                "knee.png",
                "png-bytes",
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let image: Value = serde_json::from_slice(&bytes).unwrap();

        let image_uri = format!("/api/v1/images/{}", image["id"].as_str().unwrap());
        let request = Request::builder()
            .uri(&image_uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", rad))
            .body(Body::empty())
            .unwrap();
        let (status, bytes) = app.call(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"png-bytes".to_vec());

        let (status, view) = app.json(Method::GET, &order_uri, Some(&tech), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["form"], "complete_imaging");

        let (status, body) = app
            .json(Method::POST, &format!("{}/imaging", order_uri), Some(&tech), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], 3);

        // 报告
        let (status, body) = app
            .json(
                Method::POST,
                &format!("{}/report", order_uri),
                Some(&rad),
                Some(json!({ "report": "   " })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["report"].is_array());

        let (status, body) = app
            .json(
                Method::POST,
                &format!("{}/report", order_uri),
                Some(&rad),
                Some(json!({ "report": "Meniscal tear." })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], 4);

        // 公开链接
        let (status, body) = app
            .json(Method::POST, &format!("{}/email", order_uri), Some(&physician), None)
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let link = body["link"].as_str().unwrap();
        let public_uri = link.trim_start_matches("http://ris.test");

        let (status, body) = app.json(Method::GET, public_uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"], "Meniscal tear.");
        assert_eq!(body["patient_name"], "Ada Lovelace");
        assert_eq!(body["thumbnails"].as_array().map(Vec::len), Some(1));

        let (status, _) = app
            .json(Method::GET, "/public/order?key=nope", None, None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // 归档
        let (status, _) = app
            .json(Method::POST, &format!("{}/archive", order_uri), Some(&physician), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .json(Method::POST, &format!("{}/archive", order_uri), Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], 5);

        let (status, body) = app
            .json(Method::GET, "/api/v1/orders?level=5", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
    }

    #[tokio::test]
    async fn test_error_mapping_over_http() {
        let app = test_app().await;
        let tech = app.login("tech").await;
        let admin = app.login("admin").await;

        let (status, _) = app
            .json(
                Method::GET,
                "/api/v1/patients?birth_date=1990-05-01",
                Some(&tech),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .json(Method::GET, "/api/v1/orders?level=9", Some(&tech), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["level"].is_array());

        let (status, _) = app
            .json(
                Method::GET,
                &format!("/api/v1/orders/{}", Uuid::new_v4()),
                Some(&tech),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app
            .json(Method::GET, "/api/v1/teams", Some(&tech), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        let (status, body) = app
            .json(
                Method::POST,
                "/api/v1/teams",
                Some(&admin),
                Some(json!({ "name": "CT", "technicians": [Uuid::new_v4()] })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["technicians"].is_array());
    }

    #[tokio::test]
    async fn test_appointment_conflict_over_http() {
        let app = test_app().await;
        let physician = app.login("physician").await;
        let frontdesk = app.login("frontdesk").await;

        let (_, body) = app
            .json(
                Method::POST,
                "/api/v1/patients",
                Some(&physician),
                Some(json!({
                    "first_name": "Alan",
                    "last_name": "Turing",
                    "email": "alan@example.com",
                    "phone_number": "5135550142",
                    "birth_date": "1954-06-07"
                })),
            )
            .await;
        let orders_uri = format!("/api/v1/patients/{}/orders", body["patient"]["id"].as_str().unwrap());

        let mut order_uris = Vec::new();
        for _ in 0..2 {
            let (status, order) = app
                .json(Method::POST, &orders_uri, Some(&physician), Some(json!({})))
                .await;
            assert_eq!(status, StatusCode::CREATED);
            order_uris.push(format!("/api/v1/orders/{}/appointment", order["id"].as_str().unwrap()));
        }

        let (status, _) = app
            .json(
                Method::PUT,
                &order_uris[0],
                Some(&frontdesk),
                Some(json!({ "appointment": "2099-03-04T10:00:00Z" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app
            .json(
                Method::PUT,
                &order_uris[1],
                Some(&frontdesk),
                Some(json!({ "appointment": "2099-03-04T11:00:00Z" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);

        let (status, body) = app
            .json(
                Method::PUT,
                &order_uris[1],
                Some(&frontdesk),
                Some(json!({ "appointment": "2099-03-04T12:00:00Z" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["appointment"], "2099-03-04T12:00:00Z");

        let (status, body) = app
            .json(
                Method::PUT,
                &order_uris[1],
                Some(&frontdesk),
                Some(json!({ "appointment": "+262142-12-31T23:00:00Z" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["appointment"].is_array());
    }

    /// 登记患者、开单并签到，返回订单地址
    async fn checked_in_order(app: &TestApp) -> String {
        let physician = app.login("physician").await;
        let frontdesk = app.login("frontdesk").await;

        let (_, body) = app
            .json(
                Method::POST,
                "/api/v1/patients",
                Some(&physician),
                Some(json!({
                    "first_name": "Rosalind",
                    "last_name": "Franklin",
                    "email": "rosalind@example.com",
                    "phone_number": "5135550177",
                    "birth_date": "1958-04-16"
                })),
            )
            .await;
        let (_, order) = app
            .json(
                Method::POST,
                &format!("/api/v1/patients/{}/orders", body["patient"]["id"].as_str().unwrap()),
                Some(&physician),
                Some(json!({})),
            )
            .await;
        let order_uri = format!("/api/v1/orders/{}", order["id"].as_str().unwrap());
        let (status, _) = app
            .json(
                Method::POST,
                &format!("{}/team", order_uri),
                Some(&frontdesk),
                Some(json!({ "team_id": app.team.id })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        order_uri
    }

    fn stored_files(app: &TestApp) -> usize {
        fn count(dir: &std::path::Path) -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|entry| entry.ok())
                        .map(|entry| {
                            let path = entry.path();
                            if path.is_dir() { count(&path) } else { 1 }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        count(app.storage.path())
    }

    #[tokio::test]
    async fn test_upload_over_limit_is_rejected_while_streaming() {
        let app = test_app_with_upload_limit(16).await;
        let order_uri = checked_in_order(&app).await;
        let tech = app.login("tech").await;

        let (status, bytes) = app
            .call(multipart_upload(
                &format!("{}/images", order_uri),
                &tech,
                "Axial",
                "head.dcm",
                "0123456789abcdefXYZ",
            ))
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], 413);
        assert_eq!(stored_files(&app), 0);

        let (_, view) = app.json(Method::GET, &order_uri, Some(&tech), None).await;
        assert_eq!(view["images"].as_array().map(Vec::len), Some(0));

        let (status, _) = app
            .call(multipart_upload(
                &format!("{}/images", order_uri),
                &tech,
                "Axial",
                "head.dcm",
                "0123456789abcdef",
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(stored_files(&app), 1);
    }

    #[tokio::test]
    async fn test_upload_accepts_label_after_file() {
        let app = test_app().await;
        let order_uri = checked_in_order(&app).await;
        let tech = app.login("tech").await;

        let boundary = "ris-label-last";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"wrist.png\"\r\n\
             Content-Type: image/png\r\n\r\nwrist-bytes\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"label\"\r\n\r\nPA\r\n--{b}--\r\n",
            b = boundary,
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/images", order_uri))
            .header(header::AUTHORIZATION, format!("Bearer {}", tech))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, bytes) = app.call(request).await;
        assert_eq!(status, StatusCode::CREATED);
        let image: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(image["label"], "PA");
        assert_eq!(image["size_bytes"], 11);
    }
}
