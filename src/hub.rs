use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    db::{Message, UserId},
    error::{ChatError, ChatResult},
    presence::{Connection, ConnectionId, Deregistered, PresenceRegistry, Push},
    protocol::{SendMessage, ServerEvent},
    store::{MessageStore, NewMessage, Scope},
};

#[cfg(test)]
mod tests;

/// Routes messages and presence events to live connections.
///
/// Every send is persisted before it is pushed anywhere. Pushes never wait on
/// a connection: a connection that cannot take an event right away is
/// dropped, and the message store stays the backstop for whatever it missed.
#[derive(Clone)]
pub struct Hub {
    store: MessageStore,
    presence: Arc<PresenceRegistry>,
}

impl Hub {
    pub fn new(store: MessageStore, presence: Arc<PresenceRegistry>) -> Self {
        Self { store, presence }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// The online announcement goes out while the user's presence entry is
    /// still locked, so it cannot overtake the offline one from a concurrent
    /// disconnect.
    pub fn connect(&self, user: UserId, conn: Connection) {
        let conn_id = conn.id;
        let mut failed = Vec::new();
        let first = self.presence.register(user, conn, || {
            let event = Arc::new(ServerEvent::status(user, true));
            failed = self.deliver(self.presence.all_connections(), event);
        });
        if first {
            info!(user_id = user, %conn_id, "user online");
        } else {
            debug!(user_id = user, %conn_id, "additional connection");
        }

        for conn_id in failed {
            self.disconnect(conn_id);
        }
    }

    /// Safe to call more than once for the same connection.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Deregistered {
        let mut pending = Vec::new();
        let outcome = self.deregister(conn_id, &mut pending);

        // offline broadcasts can knock out further dead connections
        while let Some(conn_id) = pending.pop() {
            self.deregister(conn_id, &mut pending);
        }
        outcome
    }

    fn deregister(&self, conn_id: ConnectionId, pending: &mut Vec<ConnectionId>) -> Deregistered {
        let outcome = self.presence.deregister(conn_id, |user| {
            let event = Arc::new(ServerEvent::status(user, false));
            pending.extend(self.deliver(self.presence.all_connections(), event));
        });
        match outcome {
            Deregistered::Last(user) => info!(user_id = user, %conn_id, "user offline"),
            Deregistered::Remaining(user) => debug!(user_id = user, %conn_id, "connection closed"),
            Deregistered::Unknown => {}
        }
        outcome
    }

    pub async fn send_message(&self, sender_id: UserId, request: SendMessage) -> ChatResult<Message> {
        let SendMessage {
            display_name,
            content,
            image_ref,
            receiver_id,
            group_id,
        } = request;

        let image_ref = image_ref.filter(|image| !image.trim().is_empty());
        if content.trim().is_empty() && image_ref.is_none() {
            return Err(ChatError::InvalidMessage("a message needs content or an image"));
        }
        let scope = Scope::from_parts(receiver_id, group_id)?;

        let Some(sender) = self.store.user(sender_id).await? else {
            warn!(user_id = sender_id, "send from unknown user");
            return Err(ChatError::SenderNotFound(sender_id));
        };
        if !display_name.is_empty() && display_name != sender.display_name {
            debug!(user_id = sender_id, claimed = %display_name, "ignoring client display name");
        }

        match scope {
            Scope::Private(receiver) => {
                if self.store.user(receiver).await?.is_none() {
                    return Err(ChatError::InvalidMessage("unknown receiver"));
                }
            }
            Scope::Group(group) => {
                if self.store.group(group).await?.is_none() {
                    return Err(ChatError::InvalidMessage("unknown group"));
                }
            }
            Scope::Global => {}
        }

        let message = self
            .store
            .append(NewMessage {
                sender_id,
                content,
                image_ref,
                scope,
            })
            .await
            .map_err(|err| {
                error!(user_id = sender_id, ?scope, %err, "failed to persist message");
                ChatError::from(err)
            })?;

        let targets = match scope {
            Scope::Global => self.presence.all_connections(),
            Scope::Private(receiver) => {
                let mut targets = self.presence.live_connections_of(sender_id);
                if receiver != sender_id {
                    targets.extend(self.presence.live_connections_of(receiver));
                }
                targets
            }
            Scope::Group(group) => match self.store.members(group).await {
                Ok(members) => self.connections_of(&members),
                Err(err) => {
                    // already durable; members catch up from history
                    error!(group_id = group, message_id = message.id, %err, "failed to read group members");
                    Vec::new()
                }
            },
        };

        debug!(
            message_id = message.id,
            user_id = sender_id,
            ?scope,
            connections = targets.len(),
            "fan-out"
        );
        self.fan_out(targets, Arc::new(ServerEvent::message(&message, &sender)));
        Ok(message)
    }

    /// Adds the connection to a transport-level channel and announces it to
    /// the channel.
    pub async fn join_channel(&self, conn_id: ConnectionId, user: UserId, name: &str) -> ChatResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidMessage("channel name is empty"));
        }
        if !self.presence.join_channel(conn_id, name) {
            return Ok(());
        }

        let display_name = match self.store.user(user).await? {
            Some(user) => user.display_name,
            None => format!("user {user}"),
        };
        let notice = ServerEvent::system(format!("{display_name} joined {name}"));
        self.fan_out(self.presence.channel_connections(name), Arc::new(notice));
        Ok(())
    }

    /// Push to the calling connection only.
    pub fn reply(&self, conn_id: ConnectionId, event: ServerEvent) {
        if let Some(conn) = self.presence.connection(conn_id) {
            self.fan_out(vec![conn], Arc::new(event));
        }
    }

    pub(crate) fn connections_of(&self, users: &[UserId]) -> Vec<Connection> {
        users
            .iter()
            .flat_map(|user| self.presence.live_connections_of(*user))
            .collect()
    }

    pub(crate) fn fan_out(&self, targets: Vec<Connection>, event: Push) {
        for conn_id in self.deliver(targets, event) {
            self.disconnect(conn_id);
        }
    }

    /// Returns the connections that could not take the event.
    fn deliver(&self, targets: Vec<Connection>, event: Push) -> Vec<ConnectionId> {
        let mut failed = Vec::new();
        for conn in targets {
            if let Err(err) = conn.push(event.clone()) {
                warn!(conn_id = %conn.id, %err, "dropping connection");
                failed.push(conn.id);
            }
        }
        failed
    }
}
