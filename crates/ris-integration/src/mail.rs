//! 邮件投递
//!
//! `HttpMailSender` 把邮件以 JSON 形式投递到 HTTP 邮件网关，
//! 配置了密钥时附带 Bearer 认证和请求体签名；
//! `LogMailSender` 只把邮件写入日志。

use anyhow::{Context, Result};
use async_trait::async_trait;
use ris_core::{MailMessage, NotificationSender};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// 发往邮件网关的请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailPayload {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl MailPayload {
    pub fn new(from: &str, message: &MailMessage) -> Self {
        Self {
            from: from.to_string(),
            to: message.recipients.clone(),
            subject: message.subject.clone(),
            html: message.html_body.clone(),
            text: message.text_body(),
        }
    }
}

/// 请求体签名：`sha256=` 加上请求体与密钥拼接后的摘要
pub fn sign_payload(payload: &str, secret: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(secret);
    format!("sha256={:x}", hasher.finalize())
}

/// HTTP 邮件网关发送器
#[derive(Debug, Clone)]
pub struct HttpMailSender {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    from_address: String,
}

impl HttpMailSender {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        from_address: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("RIS-Mail/1.0")
            .build()
            .context("failed to build mail HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
            from_address: from_address.into(),
        })
    }
}

#[async_trait]
impl NotificationSender for HttpMailSender {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        let payload = serde_json::to_string(&MailPayload::new(&self.from_address, message))?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");
        if let Some(api_key) = &self.api_key {
            request = request
                .bearer_auth(api_key)
                .header("X-RIS-Signature", sign_payload(&payload, api_key));
        }

        let response = request
            .body(payload)
            .send()
            .await
            .with_context(|| format!("failed to reach mail gateway {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            error!("Mail gateway {} rejected '{}': {}", self.endpoint, message.subject, status);
            anyhow::bail!("mail gateway returned status {}", status);
        }

        info!(
            "Delivered '{}' to {} recipient(s) via {}",
            message.subject,
            message.recipients.len(),
            self.endpoint
        );
        Ok(())
    }
}

/// 只记录日志的发送器
#[derive(Debug, Clone, Default)]
pub struct LogMailSender;

#[async_trait]
impl NotificationSender for LogMailSender {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        info!(
            to = %message.recipients.join(", "),
            subject = %message.subject,
            "Mail (log only): {}",
            message.text_body()
        );
        Ok(())
    }
}
