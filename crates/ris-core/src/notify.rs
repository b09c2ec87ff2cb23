//! 邮件通知接口

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::strip_tags;

/// 待发送的邮件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

impl MailMessage {
    pub fn new(recipients: Vec<String>, subject: impl Into<String>, html_body: impl Into<String>) -> Self {
        Self {
            recipients,
            subject: subject.into(),
            html_body: html_body.into(),
        }
    }

    /// 纯文本版本
    pub fn text_body(&self) -> String {
        strip_tags(&self.html_body)
    }
}

/// 通知发送器特征
///
/// 发送是尽力而为的，调用方只记录失败，不回滚业务状态。
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, message: &MailMessage) -> anyhow::Result<()>;
}
