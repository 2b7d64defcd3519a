mod edit;
mod members;

use axum::{routing::{delete, get, post, put}, Router};

use crate::{
    db::{Group, GroupId, UserId},
    error::{ChatError, ChatResult},
    store::MessageStore,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(edit::my_groups).post(edit::new_group))
        .route("/{id}", put(edit::update_group).delete(edit::delete_group))
        .route("/{id}/members", post(members::add_members))
        .route("/{id}/members/{user_id}", delete(members::remove_member))
}

async fn owned_group(store: &MessageStore, group_id: GroupId, user_id: UserId) -> ChatResult<Group> {
    let Some(group) = store.group(group_id).await? else {
        return Err(ChatError::NotFound("group"));
    };
    if group.owner_id != user_id {
        return Err(ChatError::Forbidden("only the owner can change this group"));
    }
    Ok(group)
}
