use sqlx::SqlitePool;

use crate::{
    db::{now_millis, Group, GroupId, Message, User, UserId},
    error::{ChatError, ChatResult},
};

// evaluated inside the insert, under the write lock, so timestamps follow ids
const NOW_MILLIS: &str = "CAST(unixepoch('subsec') * 1000 AS INTEGER)";

const MESSAGE_COLUMNS: &str = "id, sender_id, content, image_ref, receiver_id, group_id, timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Private(UserId),
    Group(GroupId),
}

impl Scope {
    /// `receiver_id` and `group_id` are mutually exclusive; neither means global.
    pub fn from_parts(receiver_id: Option<UserId>, group_id: Option<GroupId>) -> ChatResult<Scope> {
        match (receiver_id, group_id) {
            (Some(_), Some(_)) => Err(ChatError::InvalidMessage(
                "a message cannot target both a receiver and a group",
            )),
            (Some(receiver), None) => Ok(Scope::Private(receiver)),
            (None, Some(group)) => Ok(Scope::Group(group)),
            (None, None) => Ok(Scope::Global),
        }
    }

    fn columns(self) -> (Option<UserId>, Option<GroupId>) {
        match self {
            Scope::Global => (None, None),
            Scope::Private(receiver) => (Some(receiver), None),
            Scope::Group(group) => (None, Some(group)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub content: String,
    pub image_ref: Option<String>,
    pub scope: Scope,
}

/// Durable record of messages plus the user and membership rows the router
/// reads. SQLite serializes concurrent writers; nothing here locks.
#[derive(Clone)]
pub struct MessageStore {
    db_pool: SqlitePool,
}

impl MessageStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn append(&self, message: NewMessage) -> Result<Message, sqlx::Error> {
        let (receiver_id, group_id) = message.scope.columns();
        sqlx::query_as(&format!(
            "INSERT INTO messages (sender_id,content,image_ref,receiver_id,group_id,timestamp) \
             VALUES (?,?,?,?,?,{NOW_MILLIS}) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message.sender_id)
        .bind(message.content)
        .bind(message.image_ref)
        .bind(receiver_id)
        .bind(group_id)
        .fetch_one(&self.db_pool)
        .await
    }

    /// Messages of one scope as seen by `viewer`, oldest first. With a limit,
    /// the newest `limit` rows are returned.
    pub async fn history(&self, viewer: UserId, scope: Scope, limit: Option<u32>) -> ChatResult<Vec<Message>> {
        let limit = limit.map_or(-1, i64::from);
        let messages = match scope {
            Scope::Global => {
                sqlx::query_as(&latest(
                    "receiver_id IS NULL AND group_id IS NULL",
                ))
                .bind(limit)
                .fetch_all(&self.db_pool)
                .await?
            }
            Scope::Private(peer) => {
                sqlx::query_as(&latest(
                    "group_id IS NULL AND ((sender_id=? AND receiver_id=?) OR (sender_id=? AND receiver_id=?))",
                ))
                .bind(viewer)
                .bind(peer)
                .bind(peer)
                .bind(viewer)
                .bind(limit)
                .fetch_all(&self.db_pool)
                .await?
            }
            Scope::Group(group) => {
                if !self.is_member(group, viewer).await? {
                    return Err(ChatError::Forbidden("not a member of this group"));
                }
                sqlx::query_as(&latest("group_id=?"))
                    .bind(group)
                    .bind(limit)
                    .fetch_all(&self.db_pool)
                    .await?
            }
        };
        Ok(messages)
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as("SELECT id,display_name,avatar_ref FROM users WHERE id=?")
            .bind(user_id)
            .fetch_optional(&self.db_pool)
            .await
    }

    pub async fn users_named(&self, names: &[String]) -> Result<Vec<User>, sqlx::Error> {
        let mut users = Vec::with_capacity(names.len());
        for name in names {
            let user: Option<User> =
                sqlx::query_as("SELECT id,display_name,avatar_ref FROM users WHERE display_name=?")
                    .bind(name)
                    .fetch_optional(&self.db_pool)
                    .await?;
            users.extend(user);
        }
        Ok(users)
    }

    pub async fn create_user(&self, display_name: &str, avatar_ref: Option<&str>) -> Result<User, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO users (display_name,avatar_ref) VALUES (?,?) RETURNING id,display_name,avatar_ref",
        )
        .bind(display_name)
        .bind(avatar_ref)
        .fetch_one(&self.db_pool)
        .await
    }

    /// Current members, read fresh on every call.
    pub async fn members(&self, group_id: GroupId) -> Result<Vec<UserId>, sqlx::Error> {
        let rows: Vec<(UserId,)> =
            sqlx::query_as("SELECT user_id FROM group_members WHERE group_id=? ORDER BY joined_at, user_id")
                .bind(group_id)
                .fetch_all(&self.db_pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM group_members WHERE group_id=? AND user_id=?")
            .bind(group_id)
            .bind(user_id)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn group(&self, group_id: GroupId) -> Result<Option<Group>, sqlx::Error> {
        sqlx::query_as("SELECT id,name,owner_id,avatar_ref,created_at FROM chat_groups WHERE id=?")
            .bind(group_id)
            .fetch_optional(&self.db_pool)
            .await
    }

    pub async fn groups_of(&self, user_id: UserId) -> Result<Vec<Group>, sqlx::Error> {
        sqlx::query_as(
            "SELECT g.id,g.name,g.owner_id,g.avatar_ref,g.created_at FROM chat_groups g \
             JOIN group_members m ON m.group_id=g.id WHERE m.user_id=? ORDER BY g.id",
        )
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await
    }

    /// Creates the group with its owner as the first member, plus `members`.
    pub async fn create_group(
        &self,
        owner_id: UserId,
        name: &str,
        avatar_ref: Option<&str>,
        members: &[UserId],
    ) -> Result<Group, sqlx::Error> {
        let now = now_millis();
        let mut tx = self.db_pool.begin().await?;

        let group: Group = sqlx::query_as(
            "INSERT INTO chat_groups (name,owner_id,avatar_ref,created_at) VALUES (?,?,?,?) \
             RETURNING id,name,owner_id,avatar_ref,created_at",
        )
        .bind(name)
        .bind(owner_id)
        .bind(avatar_ref)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for user_id in std::iter::once(&owner_id).chain(members) {
            sqlx::query("INSERT OR IGNORE INTO group_members (group_id,user_id,joined_at) VALUES (?,?,?)")
                .bind(group.id)
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(group)
    }

    /// An empty or missing name keeps the old one; the avatar is always
    /// replaced, so `None` clears it.
    pub async fn update_group(
        &self,
        group_id: GroupId,
        name: Option<&str>,
        avatar_ref: Option<&str>,
    ) -> Result<Option<Group>, sqlx::Error> {
        let name = name.map(str::trim).filter(|name| !name.is_empty());
        sqlx::query_as(
            "UPDATE chat_groups SET name=COALESCE(?,name), avatar_ref=? WHERE id=? \
             RETURNING id,name,owner_id,avatar_ref,created_at",
        )
        .bind(name)
        .bind(avatar_ref)
        .bind(group_id)
        .fetch_optional(&self.db_pool)
        .await
    }

    /// Returns how many users were not members before.
    pub async fn add_members(&self, group_id: GroupId, users: &[UserId]) -> Result<u64, sqlx::Error> {
        let now = now_millis();
        let mut tx = self.db_pool.begin().await?;
        let mut added = 0;
        for user_id in users {
            added += sqlx::query("INSERT OR IGNORE INTO group_members (group_id,user_id,joined_at) VALUES (?,?,?)")
                .bind(group_id)
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(added)
    }

    pub async fn remove_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id=? AND user_id=?")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_group(&self, group_id: GroupId) -> Result<bool, sqlx::Error> {
        let mut tx = self.db_pool.begin().await?;
        sqlx::query("DELETE FROM group_members WHERE group_id=?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM chat_groups WHERE id=?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

fn latest(filter: &str) -> String {
    format!(
        "SELECT {MESSAGE_COLUMNS} FROM \
         (SELECT {MESSAGE_COLUMNS} FROM messages WHERE {filter} ORDER BY id DESC LIMIT ?) \
         ORDER BY id"
    )
}
