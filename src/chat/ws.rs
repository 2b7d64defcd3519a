use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    error::ChatError,
    hub::Hub,
    identity::{CurrentUser, Identity},
    presence::{Connection, ConnectionId},
    protocol::{ClientCommand, ServerEvent},
    AppState, PushBuffer,
};

#[debug_handler(state = AppState)]
pub(crate) async fn chat_ws(
    State(hub): State<Hub>,
    State(identity): State<Identity>,
    State(PushBuffer(buffer)): State<PushBuffer>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve(stream, hub, identity, user, buffer))
}

async fn serve(stream: WebSocket, hub: Hub, identity: Identity, user: CurrentUser, buffer: usize) {
    let (conn, mut outbound) = Connection::open(buffer);
    let conn_id = conn.id;
    let (mut sender, receiver) = stream.split();
    hub.connect(user.id, conn);

    // drains until the registry lets go of the connection
    let mut push_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&*event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%conn_id, %err, "unserializable event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut recv_task = tokio::spawn(read_frames(receiver, stop_rx, hub.clone(), identity, user, conn_id));

    let push_ended = tokio::select! {
        _ = &mut push_task => true,
        _ = &mut recv_task => false,
    };

    if push_ended {
        // let a frame in progress finish
        let _ = stop_tx.send(());
        let _ = recv_task.await;
        hub.disconnect(conn_id);
    } else {
        hub.disconnect(conn_id);
        let _ = push_task.await;
    }
}

/// Handles inbound frames until the client goes away or `stop` fires. `stop`
/// is only observed between frames, so a send that has started always runs
/// to completion.
async fn read_frames<S>(
    mut receiver: S,
    mut stop: oneshot::Receiver<()>,
    hub: Hub,
    identity: Identity,
    user: CurrentUser,
    conn_id: ConnectionId,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => break,
            next = receiver.next() => next,
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };
        if !handle_frame(&hub, &identity, &user, conn_id, text.as_str()).await {
            break;
        }
    }
}

/// Returns false when the connection has to be closed.
async fn handle_frame(hub: &Hub, identity: &Identity, user: &CurrentUser, conn_id: ConnectionId, text: &str) -> bool {
    match identity.resolve(&user.credential) {
        Ok(id) if id == user.id => {}
        _ => {
            warn!(user_id = user.id, %conn_id, "credential no longer valid, closing");
            return false;
        }
    }

    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(err) => {
            debug!(%conn_id, %err, "malformed frame");
            hub.reply(conn_id, ServerEvent::system(format!("Error: malformed request ({err})")));
            return true;
        }
    };

    let result = match command {
        ClientCommand::SendMessage(request) => hub.send_message(user.id, request).await.map(|_| ()),
        ClientCommand::JoinGroup { group_name } => hub.join_channel(conn_id, user.id, &group_name).await,
    };
    if let Err(err) = result {
        hub.reply(conn_id, ServerEvent::system(notice_for(&err)));
    }
    true
}

fn notice_for(err: &ChatError) -> String {
    match err {
        ChatError::SenderNotFound(_) => "Error: user not found, please log in again.".to_owned(),
        ChatError::StorageFailure(_) => "Error: the message could not be sent.".to_owned(),
        err => format!("Error: {err}"),
    }
}
