//! 实体存储接口

use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ris_core::{Image, Order, OrderKey, OrderLevel, Patient, Result, Team};
use uuid::Uuid;

/// 实体存储
///
/// 按ID读取时实体不存在返回 `RisError::NotFound`。
/// `advance_order` 与 `reserve_appointment` 必须是原子操作：
/// 前者是按期望级别的比较并递增，后者在同一临界区内完成冲突检查和写入。
#[async_trait]
pub trait EntityStore: Send + Sync {
    // ========== 患者 ==========

    async fn create_patient(&self, patient: NewPatient) -> Result<Patient>;

    async fn get_patient(&self, id: Uuid) -> Result<Patient>;

    /// 出生日期精确匹配
    async fn find_patients_by_birth_date(&self, birth_date: NaiveDate) -> Result<Vec<Patient>>;

    /// 级联删除订单、影像记录和密钥，返回被删除影像的文件路径
    async fn delete_patient(&self, id: Uuid) -> Result<Vec<String>>;

    // ========== 团队 ==========

    async fn create_team(&self, team: NewTeam) -> Result<Team>;

    async fn get_team(&self, id: Uuid) -> Result<Team>;

    async fn list_teams(&self) -> Result<Vec<Team>>;

    /// 删除团队，引用它的订单 `team_id` 置空
    async fn delete_team(&self, id: Uuid) -> Result<()>;

    // ========== 订单 ==========

    /// 新订单级别为 `OrderLevel::ReferralPlaced`
    async fn create_order(&self, order: NewOrder) -> Result<Order>;

    async fn get_order(&self, id: Uuid) -> Result<Order>;

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>>;

    /// 仅当持久化级别等于 `expected` 时写入字段并把级别加一；
    /// 级别不符时返回 `RisError::InvalidStateTransition` 且不做任何修改
    async fn advance_order(
        &self,
        id: Uuid,
        expected: OrderLevel,
        update: WorkflowUpdate,
    ) -> Result<Order>;

    /// 设置或清除预约；与其他订单的两小时窗口重叠时返回 `RisError::Conflict`
    async fn reserve_appointment(
        &self,
        id: Uuid,
        appointment: Option<DateTime<Utc>>,
    ) -> Result<Order>;

    // ========== 影像 ==========

    async fn add_image(&self, image: NewImage) -> Result<Image>;

    async fn get_image(&self, id: Uuid) -> Result<Image>;

    async fn list_images(&self, order_id: Uuid) -> Result<Vec<Image>>;

    /// 删除影像记录并返回它，文件由调用方删除
    async fn delete_image(&self, id: Uuid) -> Result<Image>;

    // ========== 访问密钥 ==========

    /// 每个订单一条密钥，已存在时覆盖摘要和邮箱
    async fn upsert_order_key(
        &self,
        order_id: Uuid,
        secret_digest: String,
        email: String,
    ) -> Result<OrderKey>;

    async fn find_order_key(&self, secret_digest: &str) -> Result<Option<OrderKey>>;
}
