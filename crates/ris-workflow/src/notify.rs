//! 级别通知分发
//!
//! 订单进入新级别后按级别选择收件人并异步发送邮件。
//! 发送在独立任务中进行，失败只记录日志，不影响已提交的状态。

use ris_core::{
    AppSettings, Directory, MailMessage, NotificationSender, OrderLevel, Result, Role,
};
use ris_database::EntityStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 通知分发器
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn Directory>,
    sender: Arc<dyn NotificationSender>,
    settings: AppSettings,
    base_url: String,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn Directory>,
        sender: Arc<dyn NotificationSender>,
        settings: AppSettings,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            store,
            directory,
            sender,
            settings,
            base_url,
        }
    }

    pub fn settings(&self) -> AppSettings {
        self.settings
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn order_url(&self, order_id: Uuid) -> String {
        format!("{}/orders/{}", self.base_url, order_id)
    }

    /// 按订单刚进入的级别组装通知，无收件人或级别无需通知时返回 `None`
    ///
    /// 收件人由 `level` 决定，不看订单此刻的级别，连续两次迁移各自发出自己的邮件。
    pub async fn compose(&self, order_id: Uuid, level: OrderLevel) -> Result<Option<MailMessage>> {
        let order = self.store.get_order(order_id).await?;
        let patient = self.store.get_patient(order.patient_id).await?;
        let name = patient.full_name();

        let (subject, body, recipients) = match level {
            OrderLevel::ReferralPlaced => {
                let doctor = match self.directory.get_user(patient.doctor_id).await {
                    Ok(user) => user.name,
                    Err(_) => "an unknown physician".to_string(),
                };
                let receptionists = self.directory.users_with_role(Role::Receptionist).await?;
                (
                    format!("New Patient Referral: {}", name),
                    format!("The office of {} has referred {}.", doctor, name),
                    receptionists.into_iter().map(|user| user.email).collect::<Vec<_>>(),
                )
            }
            OrderLevel::CheckedIn => (
                format!("Patient Checked In: {}", name),
                "Patient checked in for their appointment.".to_string(),
                self.team_emails(order.team_id, Role::Technician).await?,
            ),
            OrderLevel::ImagingComplete => (
                format!("Imaging Complete: {}", name),
                "Patient imaging has been completed and is ready for analysis.".to_string(),
                self.team_emails(order.team_id, Role::Radiologist).await?,
            ),
            OrderLevel::AnalysisComplete => (
                format!("Order Complete: {}", name),
                "Patient imaging and analysis has been completed and is ready for review."
                    .to_string(),
                self.active_emails(&[patient.doctor_id]).await,
            ),
            OrderLevel::Archived => return Ok(None),
        };

        let recipients: Vec<String> = recipients
            .into_iter()
            .filter(|email: &String| !email.trim().is_empty())
            .collect();
        if recipients.is_empty() {
            debug!("No recipients for order {} at level {}", order.id, level);
            return Ok(None);
        }

        let body = format!(
            "{}<br><br><a href='{}' target='_blank'>Click Here to View</a>",
            body,
            self.order_url(order.id)
        );
        Ok(Some(MailMessage::new(recipients, subject, body)))
    }

    async fn team_emails(&self, team_id: Option<Uuid>, role: Role) -> Result<Vec<String>> {
        let Some(team_id) = team_id else {
            return Ok(Vec::new());
        };
        let team = self.store.get_team(team_id).await?;
        let members = match role {
            Role::Technician => &team.technicians,
            _ => &team.radiologists,
        };
        Ok(self.active_emails(members).await)
    }

    async fn active_emails(&self, user_ids: &[Uuid]) -> Vec<String> {
        let mut emails = Vec::new();
        for user_id in user_ids {
            match self.directory.get_user(*user_id).await {
                Ok(user) if user.is_active => emails.push(user.email),
                Ok(_) => debug!("Skipping inactive user {}", user_id),
                Err(e) => debug!("Skipping unknown user {}: {}", user_id, e),
            }
        }
        emails
    }

    /// 异步发送订单进入 `level` 后的通知；邮件关闭时不启动任务
    pub fn notify_level(&self, order_id: Uuid, level: OrderLevel) -> Option<JoinHandle<()>> {
        if !self.settings.email_enabled {
            debug!("Email disabled, skipping notification for order {}", order_id);
            return None;
        }

        let dispatcher = self.clone();
        Some(tokio::spawn(async move {
            match dispatcher.compose(order_id, level).await {
                Ok(Some(message)) => dispatcher.deliver(message).await,
                Ok(None) => {}
                Err(e) => warn!("Failed to compose notification for order {}: {}", order_id, e),
            }
        }))
    }

    /// 异步发送任意邮件
    pub fn dispatch(&self, message: MailMessage) -> Option<JoinHandle<()>> {
        if !self.settings.email_enabled {
            debug!("Email disabled, dropping message '{}'", message.subject);
            return None;
        }

        let dispatcher = self.clone();
        Some(tokio::spawn(async move {
            dispatcher.deliver(message).await;
        }))
    }

    async fn deliver(&self, message: MailMessage) {
        match self.sender.send(&message).await {
            Ok(()) => info!(
                "Sent '{}' to {} recipient(s)",
                message.subject,
                message.recipients.len()
            ),
            Err(e) => warn!("Failed to send '{}': {:#}", message.subject, e),
        }
    }
}
