use axum::{debug_handler, extract::{Path, State}, Json};
use serde::Serialize;

use crate::{
    db::{GroupId, UserId},
    error::ChatError,
    hub::Hub,
    identity::CurrentUser,
    protocol::MembershipAction,
    AppResult, AppState,
};

use super::owned_group;

#[derive(Debug, Serialize)]
pub(crate) struct Added {
    added: u64,
}

#[debug_handler(state = AppState)]
pub(crate) async fn add_members(
    State(hub): State<Hub>,
    user: CurrentUser,
    Path(group_id): Path<GroupId>,
    Json(names): Json<Vec<String>>,
) -> AppResult<Json<Added>> {
    if names.is_empty() {
        return Err(ChatError::InvalidRequest("no users given").into());
    }

    let store = hub.store();
    let group = owned_group(store, group_id, user.id).await?;

    let users: Vec<_> = store.users_named(&names).await?.into_iter().map(|u| u.id).collect();
    let added = store.add_members(group_id, &users).await?;
    if added > 0 {
        hub.notify_membership(MembershipAction::Added, &group, &store.members(group_id).await?);
    }

    Ok(Json(Added { added }))
}

/// The owner removes anyone but themselves; a member may remove themselves.
#[debug_handler(state = AppState)]
pub(crate) async fn remove_member(
    State(hub): State<Hub>,
    user: CurrentUser,
    Path((group_id, member_id)): Path<(GroupId, UserId)>,
) -> AppResult<Json<bool>> {
    let store = hub.store();
    let Some(group) = store.group(group_id).await? else {
        return Err(ChatError::NotFound("group").into());
    };
    if member_id == group.owner_id {
        return Err(ChatError::Forbidden("the owner cannot leave their own group").into());
    }
    if user.id != group.owner_id && user.id != member_id {
        return Err(ChatError::Forbidden("only the owner can remove other members").into());
    }

    let before = store.members(group_id).await?;
    let removed = store.remove_member(group_id, member_id).await?;
    if removed {
        hub.notify_membership(MembershipAction::Removed, &group, &before);
    }

    Ok(Json(removed))
}
