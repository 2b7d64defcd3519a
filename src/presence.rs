use std::{collections::HashSet, fmt, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    db::UserId,
    error::{ChatError, ChatResult},
    protocol::ServerEvent,
};

pub type Push = Arc<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One live transport session: an id plus the sending half of its bounded
/// outbound queue. The transport task owns the receiving half.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<Push>,
}

impl Connection {
    pub fn open(buffer: usize) -> (Connection, mpsc::Receiver<Push>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Connection { id: ConnectionId::new(), tx }, rx)
    }

    /// Never waits: a full or closed queue is a delivery failure.
    pub fn push(&self, event: Push) -> ChatResult<()> {
        self.tx
            .try_send(event)
            .map_err(|_| ChatError::DeliveryFailure(self.id))
    }
}

struct Link {
    user: UserId,
    conn: Connection,
    channels: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistered {
    Unknown,
    Remaining(UserId),
    Last(UserId),
}

impl Deregistered {
    pub fn is_last(&self) -> bool {
        matches!(self, Deregistered::Last(_))
    }
}

/// Who is reachable right now.
///
/// `users` is the source of truth for presence and every first/last
/// transition happens under that user's entry lock. `connections` and
/// `channels` are looked up only after the `users` guard is released, except
/// in `register` and the transition callbacks, which go `users` first, so
/// there is a single lock order.
#[derive(Default)]
pub struct PresenceRegistry {
    users: DashMap<UserId, HashSet<ConnectionId>>,
    connections: DashMap<ConnectionId, Link>,
    channels: DashMap<String, HashSet<ConnectionId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true iff this is the user's first live connection.
    ///
    /// `on_first` runs while the user's entry is still locked, after the new
    /// connection is reachable, so announcements for one user never overtake
    /// each other. It must not call back into the registry for that user.
    pub fn register(&self, user: UserId, conn: Connection, on_first: impl FnOnce()) -> bool {
        let mut conns = self.users.entry(user).or_default();
        let first = conns.is_empty();
        conns.insert(conn.id);
        self.connections.insert(
            conn.id,
            Link {
                user,
                conn,
                channels: HashSet::new(),
            },
        );
        if first {
            on_first();
        }
        first
    }

    /// `on_last` runs under the same entry lock as `register`'s `on_first`.
    pub fn deregister(&self, conn_id: ConnectionId, on_last: impl FnOnce(UserId)) -> Deregistered {
        let Some((_, link)) = self.connections.remove(&conn_id) else {
            return Deregistered::Unknown;
        };

        for name in &link.channels {
            if let Some(mut members) = self.channels.get_mut(name) {
                members.remove(&conn_id);
            }
            self.channels.remove_if(name, |_, members| members.is_empty());
        }

        match self.users.entry(link.user) {
            Entry::Occupied(mut conns) => {
                conns.get_mut().remove(&conn_id);
                if conns.get().is_empty() {
                    on_last(link.user);
                    conns.remove();
                    Deregistered::Last(link.user)
                } else {
                    Deregistered::Remaining(link.user)
                }
            }
            Entry::Vacant(_) => Deregistered::Unknown,
        }
    }

    pub fn live_connections_of(&self, user: UserId) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = match self.users.get(&user) {
            Some(conns) => conns.iter().copied().collect(),
            None => return Vec::new(),
        };
        self.lookup(ids)
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.users.get(&user).is_some_and(|conns| !conns.is_empty())
    }

    pub fn all_connections(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().conn.clone())
            .collect()
    }

    pub fn connection(&self, conn_id: ConnectionId) -> Option<Connection> {
        self.connections.get(&conn_id).map(|link| link.conn.clone())
    }

    /// Adds a connection to a transport-level named channel. Returns false if
    /// the connection is not registered.
    pub fn join_channel(&self, conn_id: ConnectionId, name: &str) -> bool {
        match self.connections.get_mut(&conn_id) {
            Some(mut link) => {
                link.channels.insert(name.to_owned());
            }
            None => return false,
        }
        self.channels
            .entry(name.to_owned())
            .or_default()
            .insert(conn_id);

        // lost a race with deregister
        if !self.connections.contains_key(&conn_id) {
            if let Some(mut members) = self.channels.get_mut(name) {
                members.remove(&conn_id);
            }
            self.channels.remove_if(name, |_, members| members.is_empty());
            return false;
        }
        true
    }

    pub fn channel_connections(&self, name: &str) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = match self.channels.get(name) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };
        self.lookup(ids)
    }

    fn lookup(&self, ids: Vec<ConnectionId>) -> Vec<Connection> {
        ids.into_iter()
            .filter_map(|id| self.connection(id))
            .collect()
    }
}
