use serde::{Deserialize, Serialize};

use crate::db::{Group, Message, User, UserId};

pub const SYSTEM_SENDER: &str = "System";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ReceiveMessage {
        id: i64,
        sender_id: UserId,
        sender_display_name: String,
        content: String,
        image_ref: Option<String>,
        receiver_id: Option<UserId>,
        group_id: Option<i64>,
        sender_avatar_ref: Option<String>,
        timestamp: i64,
    },
    UserStatusChanged {
        user_id: UserId,
        is_online: bool,
    },
    GroupMembershipChanged {
        action: MembershipAction,
        group: GroupSummary,
    },
}

impl ServerEvent {
    pub fn message(message: &Message, sender: &User) -> Self {
        ServerEvent::ReceiveMessage {
            id: message.id,
            sender_id: sender.id,
            sender_display_name: sender.display_name.clone(),
            content: message.content.clone(),
            image_ref: message.image_ref.clone(),
            receiver_id: message.receiver_id,
            group_id: message.group_id,
            sender_avatar_ref: sender.avatar_ref.clone(),
            timestamp: message.timestamp,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        ServerEvent::ReceiveMessage {
            id: 0,
            sender_id: 0,
            sender_display_name: SYSTEM_SENDER.to_owned(),
            content: content.into(),
            image_ref: None,
            receiver_id: None,
            group_id: None,
            sender_avatar_ref: None,
            timestamp: crate::db::now_millis(),
        }
    }

    pub fn status(user_id: UserId, is_online: bool) -> Self {
        ServerEvent::UserStatusChanged { user_id, is_online }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Added,
    Removed,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: i64,
    pub name: String,
    pub avatar_ref: Option<String>,
    pub owner_id: UserId,
}

impl From<&Group> for GroupSummary {
    fn from(group: &Group) -> Self {
        GroupSummary {
            id: group.id,
            name: group.name.clone(),
            avatar_ref: group.avatar_ref.clone(),
            owner_id: group.owner_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    SendMessage(SendMessage),
    JoinGroup { group_name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<i64>,
}
