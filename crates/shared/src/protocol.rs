use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        liked_by_from_wire, ConversationKey, DeletedFor, GroupId, IdFormat, Message, MessageId,
        MessageState, UserName,
    },
    error::ProtocolError,
};

/// Commands the client writes to the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Message {
        sender_id: UserName,
        receiver_id: UserName,
        content: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        likes: Vec<String>,
        #[serde(default)]
        deleted_by: Vec<String>,
    },
    GroupMessage {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        from: UserName,
        content: String,
    },
    Like {
        message_id: MessageId,
        is_group: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
    Delete {
        message_id: MessageId,
        is_group: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
    CreateGroup {
        #[serde(rename = "groupName")]
        group_name: String,
        creator: UserName,
        members: Vec<UserName>,
    },
    AddMember {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        by: UserName,
        #[serde(rename = "userId")]
        user_id: UserName,
    },
    RemoveMember {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        by: UserName,
        #[serde(rename = "userId")]
        user_id: UserName,
    },
    PromoteAdmin {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        by: UserName,
        #[serde(rename = "userId")]
        user_id: UserName,
    },
    ExitGroup {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        #[serde(rename = "userId")]
        user_id: UserName,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::GroupMessage { .. } => "group_message",
            Self::Like { .. } => "like",
            Self::Delete { .. } => "delete",
            Self::CreateGroup { .. } => "create_group",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::PromoteAdmin { .. } => "promote_admin",
            Self::ExitGroup { .. } => "exit_group",
        }
    }
}

/// A message record as the backend ships it, both in history responses and
/// in push events. Field spellings vary between the two, so every variant is
/// accepted and resolved by [`WireMessage::to_message`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id_camel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub likes: Vec<String>,
    #[serde(default)]
    pub deleted_by: Vec<String>,
}

impl WireMessage {
    pub fn authoritative_id(&self, format: &IdFormat) -> Option<MessageId> {
        [self.object_id.as_ref(), self.id.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|value| extract_id(value, format))
    }

    pub fn sender(&self) -> Option<UserName> {
        non_empty(self.sender_id.as_deref())
            .or_else(|| non_empty(self.from.as_deref()))
            .map(UserName::new)
    }

    pub fn group(&self) -> Option<GroupId> {
        non_empty(self.group_id_camel.as_deref())
            .or_else(|| non_empty(self.group_id.as_deref()))
            .map(GroupId::new)
    }

    /// Group id when present, otherwise the normalized sender/receiver pair.
    pub fn conversation(&self) -> Option<ConversationKey> {
        if let Some(group) = self.group() {
            return Some(ConversationKey::group(group));
        }
        let sender = self.sender()?;
        let receiver = non_empty(self.receiver_id.as_deref()).map(UserName::new)?;
        Some(ConversationKey::direct(sender, receiver))
    }

    /// Resolves into a confirmed [`Message`]. `fallback` supplies the
    /// conversation when the record carries neither group nor receiver.
    pub fn to_message(
        &self,
        format: &IdFormat,
        fallback: Option<&ConversationKey>,
    ) -> Result<Message, ProtocolError> {
        let id = self
            .authoritative_id(format)
            .ok_or(ProtocolError::MissingAuthoritativeId)?;
        let sender = self.sender().ok_or(ProtocolError::MissingField("sender_id"))?;
        let conversation = self
            .conversation()
            .or_else(|| fallback.cloned())
            .ok_or(ProtocolError::MissingField("receiver_id"))?;
        let content = self
            .content
            .clone()
            .ok_or(ProtocolError::MissingField("content"))?;
        let raw_timestamp = self
            .timestamp
            .as_deref()
            .ok_or(ProtocolError::MissingField("timestamp"))?;
        let timestamp = parse_timestamp(raw_timestamp)
            .ok_or_else(|| ProtocolError::InvalidTimestamp(raw_timestamp.to_string()))?;

        Ok(Message {
            state: MessageState::Confirmed { id },
            conversation,
            sender,
            content,
            timestamp,
            liked_by: liked_by_from_wire(&self.likes),
            deleted_for: DeletedFor::from_wire(&self.deleted_by),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<UserName>,
    #[serde(default)]
    pub admins: BTreeSet<UserName>,
    #[serde(default)]
    pub banned: BTreeSet<UserName>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl GroupSummary {
    /// Enforces `admins ⊆ members` and `banned ∩ members = ∅`.
    pub fn normalized(mut self) -> Self {
        let members = &self.members;
        self.admins.retain(|admin| members.contains(admin));
        self.banned.retain(|banned| !members.contains(banned));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Events pushed by the backend over the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(WireMessage),
    GroupMessage(WireMessage),
    LikeUpdate {
        message_id: String,
        #[serde(default)]
        likes: Vec<String>,
    },
    DeleteUpdate {
        message_id: String,
        #[serde(default)]
        deleted_by: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        likes: Option<Vec<String>>,
    },
    Status {
        user_id: UserName,
        status: PresenceStatus,
    },
    InitialStatus {
        #[serde(default)]
        online_users: Vec<UserName>,
    },
    GroupCreated {
        group: GroupSummary,
    },
    GroupAdded {
        group: GroupSummary,
    },
    GroupUpdated {
        group: GroupSummary,
    },
    GroupRemoved {
        #[serde(rename = "groupId")]
        group_id: GroupId,
    },
    GroupExited {
        #[serde(rename = "groupId")]
        group_id: GroupId,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::GroupMessage(_) => "group_message",
            Self::LikeUpdate { .. } => "like_update",
            Self::DeleteUpdate { .. } => "delete_update",
            Self::Status { .. } => "status",
            Self::InitialStatus { .. } => "initial_status",
            Self::GroupCreated { .. } => "group_created",
            Self::GroupAdded { .. } => "group_added",
            Self::GroupUpdated { .. } => "group_updated",
            Self::GroupRemoved { .. } => "group_removed",
            Self::GroupExited { .. } => "group_exited",
            Self::Error { .. } => "error",
        }
    }
}

/// RFC 3339, or a naive ISO-8601 stamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|pattern| NaiveDateTime::parse_from_str(raw, pattern).ok())
        .map(|naive| naive.and_utc())
}

fn extract_id(value: &Value, format: &IdFormat) -> Option<MessageId> {
    match value {
        Value::String(raw) => format.extract(raw),
        Value::Object(map) => map.get("$oid").and_then(|inner| extract_id(inner, format)),
        _ => None,
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
