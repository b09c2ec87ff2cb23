//! 用户、角色与授权查询

use crate::error::{RisError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// 管理员
    Administrator,
    /// 开单医生
    Physician,
    /// 前台接待
    Receptionist,
    /// 技师
    Technician,
    /// 放射科医生
    Radiologist,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Administrator,
        Role::Physician,
        Role::Receptionist,
        Role::Technician,
        Role::Radiologist,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Administrator => "administrator",
            Role::Physician => "physician",
            Role::Receptionist => "receptionist",
            Role::Technician => "technician",
            Role::Radiologist => "radiologist",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RisError;

    fn from_str(value: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| RisError::validation("role", format!("未知角色: {}", value)))
    }
}

/// 用户信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub name: String,
    pub roles: Vec<Role>,
    pub is_active: bool,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.iter().any(|role| self.has_role(*role))
    }
}

/// 授权查询接口
///
/// 认证来源在外部，这里只回答"某用户是否属于某些角色"以及按角色列出用户。
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<User>;

    async fn users_with_role(&self, role: Role) -> Result<Vec<User>>;

    /// 已停用或不存在的用户视为没有任何角色
    async fn has_any_role(&self, user_id: Uuid, roles: &[Role]) -> bool {
        match self.get_user(user_id).await {
            Ok(user) => user.is_active && user.has_any_role(roles),
            Err(_) => false,
        }
    }
}

/// 内存用户目录
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let users = users.into_iter().map(|user| (user.id, user)).collect();
        Self {
            users: RwLock::new(users),
        }
    }

    pub async fn insert(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn find_by_username(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|user| user.username == username)
            .cloned()
    }

    pub async fn all_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get_user(&self, id: Uuid) -> Result<User> {
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| RisError::NotFound(format!("User {} not found", id)))
    }

    async fn users_with_role(&self, role: Role) -> Result<Vec<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|user| user.is_active && user.has_role(role))
            .cloned()
            .collect())
    }
}
