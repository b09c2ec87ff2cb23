//! # RIS Core
//!
//! 放射科信息系统的核心模块，提供基础数据结构、角色与授权查询、错误定义和通用工具。

pub mod access;
pub mod error;
pub mod models;
pub mod notify;
pub mod settings;
pub mod utils;

pub use access::{Directory, MemoryDirectory, Role, User};
pub use error::{FieldErrors, Result, RisError};
pub use models::*;
pub use notify::{MailMessage, NotificationSender};
pub use settings::AppSettings;
