//! 授权检查辅助函数

use ris_core::{Directory, Order, OrderLevel, RisError, Result, Role, TeamMembership, User};
use ris_database::EntityStore;

/// 要求用户具备任一角色
pub(crate) async fn require_any_role(
    directory: &dyn Directory,
    actor: &User,
    roles: &[Role],
    action: &str,
) -> Result<()> {
    if directory.has_any_role(actor.id, roles).await {
        return Ok(());
    }
    let names: Vec<&str> = roles.iter().map(|role| role.as_str()).collect();
    Err(RisError::Permission(format!(
        "用户 {} 无权执行 {}，需要角色: {}",
        actor.username,
        action,
        names.join(", ")
    )))
}

/// 用户在订单团队中的身份，订单未分配团队时为空
pub(crate) async fn team_membership(
    store: &dyn EntityStore,
    order: &Order,
    actor: &User,
) -> Result<TeamMembership> {
    let Some(team_id) = order.team_id else {
        return Ok(TeamMembership::NONE);
    };
    match store.get_team(team_id).await {
        Ok(team) => Ok(team.membership(actor.id)),
        Err(RisError::NotFound(_)) => Ok(TeamMembership::NONE),
        Err(e) => Err(e),
    }
}

/// 要求订单处于指定级别；已完成的订单优先返回 `AlreadyComplete`
pub(crate) fn require_level(order: &Order, level: OrderLevel, action: &str) -> Result<()> {
    if order.level == level {
        return Ok(());
    }
    if order.level.is_complete() {
        return Err(RisError::AlreadyComplete(order.id));
    }
    Err(RisError::InvalidStateTransition {
        from: order.level.to_string(),
        action: action.to_string(),
    })
}
