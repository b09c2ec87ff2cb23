//! 工作流引擎
//!
//! 协调状态机、预约、登记、影像和公开访问密钥的核心引擎。
//! 级别推进统一走 `authorize` → 字段校验 → `commit`：
//! 任何一步失败都不会写入，写入通过存储层按期望级别的比较并递增完成。

use crate::guard::{require_any_role, team_membership};
use crate::images::ImageService;
use crate::intake::Intake;
use crate::notify::NotificationDispatcher;
use crate::order_key::OrderKeyService;
use crate::scheduling::Scheduler;
use crate::state_machine::{exposed_form, transition_for, TeamScope, Transition, WorkflowAction};
use chrono::Utc;
use ris_core::{
    AppSettings, Directory, FieldErrors, Image, NotificationSender, Order, OrderLevel, Patient,
    RisError, Result, Role, Team, User,
};
use ris_database::{EntityStore, NewTeam, OrderFilter, WorkflowUpdate};
use ris_storage::FileStorage;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// 订单详情及当前用户可用的表单
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub patient: Patient,
    pub team: Option<Team>,
    pub images: Vec<Image>,
    pub form: Option<WorkflowAction>,
}

/// 工作流引擎
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn Directory>,
    notifier: NotificationDispatcher,
    scheduler: Scheduler,
    intake: Intake,
    images: ImageService,
    order_keys: OrderKeyService,
}

impl WorkflowEngine {
    /// 创建新的工作流引擎
    pub fn new(
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn Directory>,
        sender: Arc<dyn NotificationSender>,
        storage: FileStorage,
        settings: AppSettings,
        base_url: impl Into<String>,
    ) -> Self {
        let notifier = NotificationDispatcher::new(
            store.clone(),
            directory.clone(),
            sender,
            settings,
            base_url,
        );
        let images = ImageService::new(store.clone(), directory.clone(), storage);

        Self {
            scheduler: Scheduler::new(store.clone(), directory.clone()),
            intake: Intake::new(store.clone(), directory.clone(), notifier.clone()),
            order_keys: OrderKeyService::new(
                store.clone(),
                directory.clone(),
                images.clone(),
                notifier.clone(),
            ),
            images,
            notifier,
            store,
            directory,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn intake(&self) -> &Intake {
        &self.intake
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }

    pub fn order_keys(&self) -> &OrderKeyService {
        &self.order_keys
    }

    // ========== 级别推进 ==========

    /// 检查订单级别、角色和团队身份，返回当前订单和要执行的转换
    async fn authorize(
        &self,
        order_id: Uuid,
        actor: &User,
        action: WorkflowAction,
    ) -> Result<(Order, &'static Transition)> {
        let order = self.store.get_order(order_id).await?;
        if order.level.is_complete() {
            return Err(RisError::AlreadyComplete(order.id));
        }

        let transition = transition_for(order.level, action)?;
        require_any_role(self.directory.as_ref(), actor, transition.roles, action.as_str()).await?;

        if transition.scope != TeamScope::Unscoped {
            if order.team_id.is_none() {
                return Err(RisError::Permission(format!("订单 {} 尚未分配团队", order.id)));
            }
            let membership = team_membership(self.store.as_ref(), &order, actor).await?;
            if !transition.scope.admits(membership) {
                return Err(RisError::Permission(format!(
                    "用户 {} 不是订单 {} 团队中有权执行 {} 的成员",
                    actor.username, order.id, action
                )));
            }
        }

        Ok((order, transition))
    }

    /// 按期望级别写入并推进，成功后异步通知新级别的受众
    async fn commit(
        &self,
        order: &Order,
        transition: &Transition,
        actor: &User,
        update: WorkflowUpdate,
    ) -> Result<Order> {
        let updated = self.store.advance_order(order.id, order.level, update).await?;
        info!(
            "Order {} advanced {} -> {} by {} ({})",
            updated.id, order.level, updated.level, actor.username, transition.action
        );
        self.notifier.notify_level(updated.id, updated.level);
        Ok(updated)
    }

    /// 签到并分配检查团队（1 → 2）
    pub async fn assign_team(&self, order_id: Uuid, actor: &User, team_id: Uuid) -> Result<Order> {
        let (order, transition) = self.authorize(order_id, actor, WorkflowAction::AssignTeam).await?;

        match self.store.get_team(team_id).await {
            Ok(_) => {}
            Err(RisError::NotFound(_)) => {
                return Err(RisError::validation("team", "所选团队不存在"))
            }
            Err(e) => return Err(e),
        }

        self.commit(&order, transition, actor, WorkflowUpdate::AssignTeam { team_id })
            .await
    }

    /// 标记影像完成（2 → 3）
    pub async fn complete_imaging(&self, order_id: Uuid, actor: &User) -> Result<Order> {
        let (order, transition) = self
            .authorize(order_id, actor, WorkflowAction::CompleteImaging)
            .await?;

        let update = WorkflowUpdate::Imaged {
            by: actor.id,
            at: Utc::now(),
        };
        self.commit(&order, transition, actor, update).await
    }

    /// 提交诊断报告（3 → 4）
    pub async fn submit_report(&self, order_id: Uuid, actor: &User, report: &str) -> Result<Order> {
        let (order, transition) = self
            .authorize(order_id, actor, WorkflowAction::SubmitReport)
            .await?;

        let report = report.trim();
        if report.is_empty() {
            return Err(RisError::validation("report", "报告内容不能为空"));
        }

        let update = WorkflowUpdate::Reported {
            report: report.to_string(),
            by: actor.id,
            at: Utc::now(),
        };
        self.commit(&order, transition, actor, update).await
    }

    /// 管理员归档已完成的订单（4 → 5），不属于工作流表单
    pub async fn archive(&self, order_id: Uuid, actor: &User) -> Result<Order> {
        require_any_role(self.directory.as_ref(), actor, &[Role::Administrator], "archive").await?;

        let order = self.store.get_order(order_id).await?;
        if order.level != OrderLevel::AnalysisComplete {
            return Err(RisError::InvalidStateTransition {
                from: order.level.to_string(),
                action: "archive".to_string(),
            });
        }

        let updated = self
            .store
            .advance_order(order.id, order.level, WorkflowUpdate::Archived)
            .await?;
        info!("Order {} archived by {}", updated.id, actor.username);
        Ok(updated)
    }

    // ========== 读取 ==========

    /// 订单详情，只读
    pub async fn view_order(&self, order_id: Uuid, actor: &User) -> Result<OrderView> {
        let order = self.store.get_order(order_id).await?;
        let patient = self.store.get_patient(order.patient_id).await?;
        let team = match order.team_id {
            Some(team_id) => match self.store.get_team(team_id).await {
                Ok(team) => Some(team),
                Err(RisError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        let images = self.store.list_images(order.id).await?;

        let roles = match self.directory.get_user(actor.id).await {
            Ok(user) if user.is_active => user.roles,
            _ => Vec::new(),
        };
        let membership = team
            .as_ref()
            .map(|team| team.membership(actor.id))
            .unwrap_or_default();
        let form = exposed_form(order.level, &roles, membership);

        Ok(OrderView {
            order,
            patient,
            team,
            images,
            form,
        })
    }

    pub async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        self.store.list_orders(filter).await
    }

    // ========== 管理 ==========

    /// 创建检查团队，成员必须具备相应角色
    pub async fn create_team(&self, actor: &User, team: NewTeam) -> Result<Team> {
        require_any_role(self.directory.as_ref(), actor, &[Role::Administrator], "create_team")
            .await?;

        let mut errors = FieldErrors::new();
        let name = team.name.trim();
        if name.is_empty() {
            errors.add("name", "此字段为必填项");
        } else if name.chars().count() > 128 {
            errors.add("name", "长度不能超过 128 个字符");
        }
        for (field, members, role) in [
            ("technicians", &team.technicians, Role::Technician),
            ("radiologists", &team.radiologists, Role::Radiologist),
        ] {
            for member in members {
                if !self.directory.has_any_role(*member, &[role]).await {
                    errors.add(field, format!("用户 {} 不具备 {} 角色", member, role));
                }
            }
        }
        errors.into_result()?;

        let team = self
            .store
            .create_team(NewTeam {
                name: name.to_string(),
                ..team
            })
            .await?;
        info!("Team {} '{}' created by {}", team.id, team.name, actor.username);
        Ok(team)
    }

    /// 删除患者及其全部订单，并清理影像文件
    pub async fn delete_patient(&self, actor: &User, patient_id: Uuid) -> Result<()> {
        require_any_role(self.directory.as_ref(), actor, &[Role::Administrator], "delete_patient")
            .await?;

        let paths = self.store.delete_patient(patient_id).await?;
        self.images.remove_files(&paths).await;
        info!(
            "Patient {} deleted by {} ({} files removed)",
            patient_id,
            actor.username,
            paths.len()
        );
        Ok(())
    }
}
