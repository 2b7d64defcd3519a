use axum::{debug_handler, extract::{Query, State}, Json};
use serde::Deserialize;

use crate::{
    db::{GroupId, Message, UserId},
    hub::Hub,
    identity::CurrentUser,
    store::Scope,
    AppResult, AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryQuery {
    receiver_id: Option<UserId>,
    group_id: Option<GroupId>,
    limit: Option<u32>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn history(
    State(hub): State<Hub>,
    user: CurrentUser,
    Query(HistoryQuery { receiver_id, group_id, limit }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let scope = Scope::from_parts(receiver_id, group_id)?;
    let messages = hub.store().history(user.id, scope, limit).await?;
    Ok(Json(messages))
}
