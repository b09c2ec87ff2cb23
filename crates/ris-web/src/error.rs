//! HTTP 错误响应
//!
//! 领域错误统一转换为 `{"error": true, "message", "status"}` 结构，
//! 验证错误额外携带 `fields`。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ris_core::RisError;
use serde_json::json;
use tracing::error;

/// Web 层错误
#[derive(Debug)]
pub enum ApiError {
    /// 领域错误
    Domain(RisError),
    /// 缺少或无效的登录凭据
    Unauthorized(String),
    /// 请求本身无法解析
    Rejected { status: StatusCode, message: String },
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Rejected {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Domain(err) => status_for(err),
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Rejected { status, .. } => *status,
        }
    }
}

impl From<RisError> for ApiError {
    fn from(err: RisError) -> Self {
        ApiError::Domain(err)
    }
}

fn status_for(err: &RisError) -> StatusCode {
    match err {
        RisError::NotFound(_) => StatusCode::NOT_FOUND,
        RisError::Validation(_) => StatusCode::BAD_REQUEST,
        RisError::Permission(_) => StatusCode::FORBIDDEN,
        RisError::AlreadyComplete(_)
        | RisError::InvalidStateTransition { .. }
        | RisError::Conflict(_) => StatusCode::CONFLICT,
        RisError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match self {
            ApiError::Domain(RisError::Validation(fields)) => json!({
                "error": true,
                "message": "表单验证失败",
                "status": status.as_u16(),
                "fields": fields,
            }),
            ApiError::Domain(err) => {
                if status.is_server_error() {
                    error!("Request failed: {}", err);
                }
                json!({
                    "error": true,
                    "message": err.to_string(),
                    "status": status.as_u16(),
                })
            }
            ApiError::Unauthorized(message) | ApiError::Rejected { message, .. } => json!({
                "error": true,
                "message": message,
                "status": status.as_u16(),
            }),
        };

        (status, Json(body)).into_response()
    }
}
