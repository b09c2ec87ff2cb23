//! # RIS Web
//!
//! 放射科信息系统的 HTTP 接口：登录认证、患者登记、订单流转、预约、影像和公开报告访问。

pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;

pub use auth::{AuthService, LoginRequest, LoginResponse, UserInfo};
pub use error::{ApiError, ApiResult};
pub use server::{AppState, ServerOptions, WebServer};
