//! 运行时功能开关
//!
//! 进程启动时从配置加载一次，之后显式传递给需要的组件。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// 原型模式：在响应中暴露公开访问链接等调试信息
    #[serde(default)]
    pub show_prototype: bool,
    /// 是否发送邮件通知
    #[serde(default = "default_email_enabled")]
    pub email_enabled: bool,
}

fn default_email_enabled() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            show_prototype: false,
            email_enabled: default_email_enabled(),
        }
    }
}
