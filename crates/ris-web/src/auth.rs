//! 用户认证
//!
//! 登录后签发随机 Bearer 令牌，有效期默认 24 小时。
//! 角色查询仍然走 `MemoryDirectory`，这里只保存口令摘要和会话。

use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use ris_core::utils::{digest_secret, generate_secret_key};
use ris_core::{Directory, MemoryDirectory, Role, User};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TOKEN_LENGTH: usize = 48;

/// 登录请求
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// 登录响应
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserInfo,
    pub expires_at: DateTime<Utc>,
}

/// 用户信息（不包含敏感数据）
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub name: String,
    pub roles: Vec<Role>,
    pub is_active: bool,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            name: user.name,
            roles: user.roles,
            is_active: user.is_active,
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// 认证服务
#[derive(Clone)]
pub struct AuthService {
    directory: Arc<MemoryDirectory>,
    // 用户名 -> 口令 SHA-256 摘要
    credentials: Arc<RwLock<HashMap<String, String>>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    token_expiry_hours: i64,
}

impl AuthService {
    pub fn new(directory: Arc<MemoryDirectory>, token_expiry_hours: i64) -> Self {
        Self {
            directory,
            credentials: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            token_expiry_hours,
        }
    }

    pub fn directory(&self) -> &Arc<MemoryDirectory> {
        &self.directory
    }

    /// 注册用户及其口令摘要
    pub async fn register(&self, user: User, password_sha256: &str) {
        self.credentials
            .write()
            .await
            .insert(user.username.clone(), password_sha256.trim().to_ascii_lowercase());
        debug!("Registered login for {}", user.username);
        self.directory.insert(user).await;
    }

    /// 用户登录
    pub async fn login(&self, request: LoginRequest) -> ApiResult<LoginResponse> {
        let user = self
            .directory
            .find_by_username(&request.username)
            .await
            .ok_or_else(|| ApiError::unauthorized("Invalid username or password"))?;

        let expected = self.credentials.read().await.get(&user.username).cloned();
        if expected.as_deref() != Some(digest_secret(&request.password).as_str()) {
            return Err(ApiError::unauthorized("Invalid username or password"));
        }
        if !user.is_active {
            return Err(ApiError::unauthorized("Account is disabled"));
        }

        let now = Utc::now();
        let token = generate_secret_key(TOKEN_LENGTH);
        let expires_at = now + Duration::hours(self.token_expiry_hours);

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, session| session.expires_at > now);
        sessions.insert(
            token.clone(),
            Session {
                user_id: user.id,
                expires_at,
            },
        );

        Ok(LoginResponse {
            token,
            user: user.into(),
            expires_at,
        })
    }

    /// 验证令牌并返回当前用户
    pub async fn verify_token(&self, token: &str) -> ApiResult<User> {
        let session = self
            .sessions
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Invalid token"))?;

        if session.expires_at <= Utc::now() {
            self.sessions.write().await.remove(token);
            return Err(ApiError::unauthorized("Token has expired"));
        }

        let user = self
            .directory
            .get_user(session.user_id)
            .await
            .map_err(|_| ApiError::unauthorized("User not found"))?;
        if !user.is_active {
            return Err(ApiError::unauthorized("Account is disabled"));
        }
        Ok(user)
    }

    /// 注销令牌
    pub async fn logout(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// 认证中间件
pub async fn auth_middleware(
    State(auth_service): State<AuthService>,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let token = bearer_token(&request).ok_or_else(|| ApiError::unauthorized("Missing token"))?;
    let user = auth_service.verify_token(token).await?;

    // 将用户信息添加到请求扩展中
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// 登录处理器
pub async fn login_handler(
    State(auth_service): State<AuthService>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    info!("Login attempt for user: {}", request.username);

    match auth_service.login(request).await {
        Ok(response) => {
            info!("User logged in successfully: {}", response.user.username);
            Ok(Json(response))
        }
        Err(e) => {
            warn!("Login failed: {:?}", e);
            Err(e)
        }
    }
}

/// 注销处理器
pub async fn logout_handler(
    State(auth_service): State<AuthService>,
    request: Request,
) -> ApiResult<impl IntoResponse> {
    if let Some(token) = bearer_token(&request) {
        auth_service.logout(token).await;
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// 获取当前用户信息
pub async fn get_current_user(Extension(user): Extension<User>) -> Json<UserInfo> {
    Json(user.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(username: &str, active: bool) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: format!("{}@ris.local", username),
            name: username.to_string(),
            roles: vec![Role::Receptionist],
            is_active: active,
        }
    }

    async fn service() -> AuthService {
        let service = AuthService::new(Arc::new(MemoryDirectory::new()), 24);
        service.register(user("frontdesk", true), &digest_secret("s3cret")).await;
        service.register(user("retired", false), &digest_secret("s3cret")).await;
        service
    }

    fn login(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_and_verify() {
        let service = service().await;

        let response = service.login(login("frontdesk", "s3cret")).await.unwrap();
        assert_eq!(response.token.len(), TOKEN_LENGTH);
        assert!(response.expires_at > Utc::now() + Duration::hours(23));

        let user = service.verify_token(&response.token).await.unwrap();
        assert_eq!(user.username, "frontdesk");

        service.logout(&response.token).await;
        assert!(service.verify_token(&response.token).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_logins() {
        let service = service().await;

        assert!(service.login(login("frontdesk", "wrong")).await.is_err());
        assert!(service.login(login("nobody", "s3cret")).await.is_err());
        assert!(service.login(login("retired", "s3cret")).await.is_err());
        assert!(service.verify_token("forged").await.is_err());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let service = AuthService::new(Arc::new(MemoryDirectory::new()), 0);
        service.register(user("frontdesk", true), &digest_secret("pw")).await;

        let response = service.login(login("frontdesk", "pw")).await.unwrap();
        assert!(matches!(
            service.verify_token(&response.token).await,
            Err(ApiError::Unauthorized(_))
        ));
    }
}
