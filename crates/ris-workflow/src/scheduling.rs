//! 预约调度
//!
//! 每个预约占用两小时的半开区间。日期早于今天（UTC）的预约直接拒绝；
//! 与其他订单的重叠检查和写入由存储层在同一临界区内完成。

use crate::guard::require_any_role;
use chrono::{DateTime, Utc};
use ris_core::{AppointmentWindow, Directory, Order, OrderLevel, RisError, Result, Role, User};
use ris_database::EntityStore;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// 可以安排预约的角色
pub const SCHEDULING_ROLES: &[Role] = &[Role::Receptionist, Role::Administrator];

/// 预约日期不得早于当前日期；同一天内已过去的时刻仍然允许
///
/// 两小时窗口必须落在可表示的时间范围内。
pub fn check_appointment_date(candidate: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if candidate.date_naive() < now.date_naive() {
        return Err(RisError::validation(
            "appointment",
            format!("预约日期 {} 早于今天", candidate.date_naive()),
        ));
    }
    AppointmentWindow::starting_at(candidate)?;
    Ok(())
}

/// 预约调度器
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn Directory>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn EntityStore>, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// 设置或清除订单预约
    ///
    /// 只允许在订单处于已转诊或已签到时修改。
    pub async fn schedule(
        &self,
        order_id: Uuid,
        actor: &User,
        candidate: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        require_any_role(self.directory.as_ref(), actor, SCHEDULING_ROLES, "schedule").await?;

        let order = self.store.get_order(order_id).await?;
        match order.level {
            OrderLevel::ReferralPlaced | OrderLevel::CheckedIn => {}
            level if level.is_complete() => return Err(RisError::AlreadyComplete(order.id)),
            level => {
                return Err(RisError::InvalidStateTransition {
                    from: level.to_string(),
                    action: "schedule".to_string(),
                })
            }
        }

        if let Some(candidate) = candidate {
            check_appointment_date(candidate, now)?;
        }

        let order = self.store.reserve_appointment(order_id, candidate).await?;
        match order.appointment {
            Some(at) => info!("Order {} scheduled at {}", order.id, at.to_rfc3339()),
            None => info!("Order {} appointment cleared", order.id),
        }
        Ok(order)
    }
}
