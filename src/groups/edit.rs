use axum::{debug_handler, extract::{Path, State}, Json};
use serde::Deserialize;

use crate::{
    db::{Group, GroupId},
    error::ChatError,
    hub::Hub,
    identity::CurrentUser,
    protocol::MembershipAction,
    AppResult, AppState,
};

use super::owned_group;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewGroup {
    name: String,
    #[serde(default)]
    members: Vec<String>,
    avatar_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateGroup {
    name: Option<String>,
    avatar_ref: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn my_groups(
    State(hub): State<Hub>,
    user: CurrentUser,
) -> AppResult<Json<Vec<Group>>> {
    Ok(Json(hub.store().groups_of(user.id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_group(
    State(hub): State<Hub>,
    user: CurrentUser,
    Json(NewGroup { name, members, avatar_ref }): Json<NewGroup>,
) -> AppResult<Json<Group>> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::InvalidRequest("a group needs a name").into());
    }

    let store = hub.store();
    let members: Vec<_> = store.users_named(&members).await?.into_iter().map(|u| u.id).collect();
    let group = store.create_group(user.id, name, avatar_ref.as_deref(), &members).await?;

    hub.notify_membership(MembershipAction::Added, &group, &store.members(group.id).await?);
    Ok(Json(group))
}

#[debug_handler(state = AppState)]
pub(crate) async fn update_group(
    State(hub): State<Hub>,
    user: CurrentUser,
    Path(group_id): Path<GroupId>,
    Json(UpdateGroup { name, avatar_ref }): Json<UpdateGroup>,
) -> AppResult<Json<Group>> {
    let store = hub.store();
    owned_group(store, group_id, user.id).await?;

    let Some(group) = store.update_group(group_id, name.as_deref(), avatar_ref.as_deref()).await? else {
        return Err(ChatError::NotFound("group").into());
    };

    hub.notify_membership(MembershipAction::Updated, &group, &store.members(group_id).await?);
    Ok(Json(group))
}

#[debug_handler(state = AppState)]
pub(crate) async fn delete_group(
    State(hub): State<Hub>,
    user: CurrentUser,
    Path(group_id): Path<GroupId>,
) -> AppResult<Json<Group>> {
    let store = hub.store();
    let group = owned_group(store, group_id, user.id).await?;

    let members = store.members(group_id).await?;
    store.delete_group(group_id).await?;

    hub.notify_membership(MembershipAction::Removed, &group, &members);
    Ok(Json(group))
}
