//! 患者公开访问密钥
//!
//! 每个订单一条密钥，重新签发会覆盖旧摘要，旧链接随之失效。
//! 明文密钥只出现在发给患者的邮件里（原型模式下也返回给调用方）。

use crate::guard::require_any_role;
use crate::images::ImageService;
use crate::notify::NotificationDispatcher;
use chrono::{DateTime, Utc};
use ris_core::utils::{digest_secret, generate_secret_key, SECRET_KEY_LENGTH};
use ris_core::{
    Directory, Image, MailMessage, OrderKey, OrderLevel, RisError, Result, Role, User,
};
use ris_database::EntityStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// 可以发送公开链接的角色
pub const KEY_ISSUER_ROLES: &[Role] = &[Role::Physician, Role::Administrator];

/// 签发结果
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub order_key: OrderKey,
    /// 仅原型模式下返回
    pub link: Option<String>,
}

/// 公开访问时看到的订单内容
#[derive(Debug, Clone, Serialize)]
pub struct PublicOrderView {
    pub order_id: Uuid,
    pub patient_name: String,
    pub level: OrderLevel,
    pub visit_reason: Option<String>,
    pub imaging_needed: Option<String>,
    pub modality: Option<String>,
    pub appointment: Option<DateTime<Utc>>,
    pub report: Option<String>,
    pub completed_time: Option<DateTime<Utc>>,
    pub thumbnails: Vec<Image>,
}

#[derive(Clone)]
pub struct OrderKeyService {
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn Directory>,
    images: ImageService,
    notifier: NotificationDispatcher,
}

impl OrderKeyService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn Directory>,
        images: ImageService,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            directory,
            images,
            notifier,
        }
    }

    pub fn public_link(&self, secret: &str) -> String {
        format!("{}/public/order?key={}", self.notifier.base_url(), secret)
    }

    /// 生成新密钥并把公开链接发给患者
    pub async fn issue(&self, order_id: Uuid, actor: &User) -> Result<IssuedKey> {
        require_any_role(self.directory.as_ref(), actor, KEY_ISSUER_ROLES, "email_patient").await?;

        let order = self.store.get_order(order_id).await?;
        if !order.level.is_complete() {
            return Err(RisError::InvalidStateTransition {
                from: order.level.to_string(),
                action: "email_patient".to_string(),
            });
        }
        let patient = self.store.get_patient(order.patient_id).await?;

        let secret = generate_secret_key(SECRET_KEY_LENGTH);
        let order_key = self
            .store
            .upsert_order_key(order.id, digest_secret(&secret), patient.email.clone())
            .await?;

        let link = self.public_link(&secret);
        self.notifier.dispatch(MailMessage::new(
            vec![patient.email],
            "RIS Report is Ready",
            format!("Imaging report has been emailed to you: <br><br>{}", link),
        ));
        info!("Public key issued for order {} by {}", order.id, actor.username);

        Ok(IssuedKey {
            order_key,
            link: self.notifier.settings().show_prototype.then_some(link),
        })
    }

    /// 用明文密钥解析公开订单视图，无需登录
    pub async fn resolve(&self, secret: &str) -> Result<PublicOrderView> {
        let key = self
            .store
            .find_order_key(&digest_secret(secret.trim()))
            .await?
            .ok_or_else(|| RisError::NotFound("访问密钥无效或已失效".to_string()))?;

        let order = self.store.get_order(key.order_id).await?;
        let patient = self.store.get_patient(order.patient_id).await?;
        let thumbnails = self.images.thumbnails(order.id).await?;

        Ok(PublicOrderView {
            order_id: order.id,
            patient_name: patient.full_name(),
            level: order.level,
            visit_reason: order.visit_reason,
            imaging_needed: order.imaging_needed,
            modality: order.modality,
            appointment: order.appointment,
            report: order.report,
            completed_time: order.completed_time,
            thumbnails,
        })
    }
}
