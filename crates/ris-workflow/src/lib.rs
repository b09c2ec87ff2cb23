//! # RIS工作流模块
//!
//! 提供影像检查订单的完整工作流功能，包括：
//! - 订单状态机：级别转换表及表单可见性
//! - 工作流引擎：带角色和团队检查的级别推进、管理员归档
//! - 预约调度：两小时时间窗的冲突检测
//! - 患者登记：按出生日期查找、新患者和新订单
//! - 影像附件与患者公开访问密钥
//! - 按级别的邮件通知分发

pub mod engine;
mod guard;
pub mod images;
pub mod intake;
pub mod notify;
pub mod order_key;
pub mod scheduling;
pub mod state_machine;

#[cfg(test)]
mod testing;

// 重新导出主要类型
pub use engine::{OrderView, WorkflowEngine};
pub use images::{ImageService, PendingUpload};
pub use intake::{Intake, OrderForm, PatientForm};
pub use notify::NotificationDispatcher;
pub use order_key::{IssuedKey, OrderKeyService, PublicOrderView};
pub use scheduling::Scheduler;
pub use state_machine::{exposed_form, TeamScope, Transition, WorkflowAction, TRANSITIONS};
