//! 订单状态机
//!
//! 订单级别的流转由一张常量转换表描述：每个可流转的级别恰好对应一个动作，
//! 写入侧（引擎执行转换）和读取侧（决定展示哪个表单）都从这张表推导。

use ris_core::{OrderLevel, RisError, Result, Role, TeamMembership};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 工作流动作，每个动作对应一个表单
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    /// 签到并分配检查团队
    AssignTeam,
    /// 标记影像已完成
    CompleteImaging,
    /// 提交诊断报告
    SubmitReport,
}

impl WorkflowAction {
    pub const ALL: [WorkflowAction; 3] = [
        WorkflowAction::AssignTeam,
        WorkflowAction::CompleteImaging,
        WorkflowAction::SubmitReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowAction::AssignTeam => "assign_team",
            WorkflowAction::CompleteImaging => "complete_imaging",
            WorkflowAction::SubmitReport => "submit_report",
        }
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 团队范围限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamScope {
    /// 不要求团队成员身份
    Unscoped,
    /// 订单团队的技师或放射科医生
    TeamMember,
    /// 订单团队的放射科医生
    TeamRadiologist,
}

impl TeamScope {
    pub fn admits(self, membership: TeamMembership) -> bool {
        match self {
            TeamScope::Unscoped => true,
            TeamScope::TeamMember => membership.technician || membership.radiologist,
            TeamScope::TeamRadiologist => membership.radiologist,
        }
    }
}

/// 一条转换规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OrderLevel,
    pub action: WorkflowAction,
    pub roles: &'static [Role],
    pub scope: TeamScope,
    pub to: OrderLevel,
}

impl Transition {
    /// 用户是否具备执行该转换的角色与团队身份
    pub fn permits(&self, roles: &[Role], membership: TeamMembership) -> bool {
        self.roles.iter().any(|role| roles.contains(role)) && self.scope.admits(membership)
    }
}

/// 订单转换表
pub const TRANSITIONS: [Transition; 3] = [
    Transition {
        from: OrderLevel::ReferralPlaced,
        action: WorkflowAction::AssignTeam,
        roles: &[Role::Receptionist, Role::Administrator],
        scope: TeamScope::Unscoped,
        to: OrderLevel::CheckedIn,
    },
    Transition {
        from: OrderLevel::CheckedIn,
        action: WorkflowAction::CompleteImaging,
        roles: &[Role::Technician, Role::Radiologist],
        scope: TeamScope::TeamMember,
        to: OrderLevel::ImagingComplete,
    },
    Transition {
        from: OrderLevel::ImagingComplete,
        action: WorkflowAction::SubmitReport,
        roles: &[Role::Radiologist],
        scope: TeamScope::TeamRadiologist,
        to: OrderLevel::AnalysisComplete,
    },
];

/// 当前级别唯一可用的转换
pub fn transition_at(level: OrderLevel) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.from == level)
}

/// 查找 `level` 上执行 `action` 的转换
///
/// 已完成的订单返回 `AlreadyComplete` 的判断由调用方先做，这里只区分有无规则。
pub fn transition_for(level: OrderLevel, action: WorkflowAction) -> Result<&'static Transition> {
    transition_at(level)
        .filter(|t| t.action == action)
        .ok_or_else(|| RisError::InvalidStateTransition {
            from: level.to_string(),
            action: action.to_string(),
        })
}

/// 读取侧：查看订单的用户能看到哪个表单
///
/// 只依赖级别、角色和团队身份，与请求方法无关。
pub fn exposed_form(
    level: OrderLevel,
    roles: &[Role],
    membership: TeamMembership,
) -> Option<WorkflowAction> {
    transition_at(level)
        .filter(|t| t.permits(roles, membership))
        .map(|t| t.action)
}
