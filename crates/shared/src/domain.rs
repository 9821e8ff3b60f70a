use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::normalize;

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl AsRef<str>) -> Self {
                Self(normalize(raw.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self::new(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_newtype!(UserName);
name_newtype!(GroupId);

pub const DEFAULT_ID_HEX_LEN: usize = 24;
pub const LOCAL_ID_PREFIX: &str = "optimistic-";
pub const DELETED_FOR_EVERYONE: &str = "*";
pub const REMOVED_PLACEHOLDER: &str = "This message was deleted";

/// Identifier assigned by the backend once a message is persisted.
///
/// Only constructed through [`IdFormat`], so a value always satisfies the
/// configured token shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shape of authoritative message ids: a fixed-length hexadecimal token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFormat {
    hex_len: usize,
}

impl Default for IdFormat {
    fn default() -> Self {
        Self {
            hex_len: DEFAULT_ID_HEX_LEN,
        }
    }
}

impl IdFormat {
    pub fn hex(hex_len: usize) -> Self {
        Self {
            hex_len: hex_len.max(1),
        }
    }

    pub fn hex_len(&self) -> usize {
        self.hex_len
    }

    pub fn is_authoritative(&self, raw: &str) -> bool {
        raw.len() == self.hex_len && raw.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Accepts only an exact token (after normalization).
    pub fn parse(&self, raw: &str) -> Option<MessageId> {
        let canonical = normalize(raw);
        self.is_authoritative(&canonical)
            .then_some(MessageId(canonical))
    }

    /// Accepts an exact token or pulls the first hex run of the configured
    /// length out of a wrapped form such as `ObjectId('…')`.
    pub fn extract(&self, raw: &str) -> Option<MessageId> {
        if let Some(id) = self.parse(raw) {
            return Some(id);
        }
        normalize(raw)
            .split(|c: char| !c.is_ascii_hexdigit())
            .find(|run| run.len() == self.hex_len)
            .map(|run| MessageId(run.to_string()))
    }
}

/// Client-assigned placeholder id for a message not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn is_local(raw: &str) -> bool {
        raw.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageState {
    Optimistic { local_id: LocalId },
    Confirmed { id: MessageId },
}

/// Scope of a message list: an unordered peer pair or a group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversationKey {
    /// `low <= high`, so both participants derive the same key.
    Direct { low: UserName, high: UserName },
    Group(GroupId),
}

impl ConversationKey {
    pub fn direct(a: UserName, b: UserName) -> Self {
        if a <= b {
            Self::Direct { low: a, high: b }
        } else {
            Self::Direct { low: b, high: a }
        }
    }

    pub fn group(id: GroupId) -> Self {
        Self::Group(id)
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Self::Group(id) => Some(id),
            Self::Direct { .. } => None,
        }
    }

    pub fn involves(&self, user: &UserName) -> bool {
        match self {
            Self::Direct { low, high } => low == user || high == user,
            Self::Group(_) => false,
        }
    }

    /// The other participant of a direct pair; a self-conversation yields
    /// the user itself.
    pub fn peer_of(&self, user: &UserName) -> Option<&UserName> {
        match self {
            Self::Direct { low, high } if low == user => Some(high),
            Self::Direct { low, high } if high == user => Some(low),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { low, high } => write!(f, "dm:{low}|{high}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

/// Who a message has been removed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletedFor {
    Everyone,
    Users(BTreeSet<UserName>),
}

impl Default for DeletedFor {
    fn default() -> Self {
        Self::Users(BTreeSet::new())
    }
}

impl DeletedFor {
    pub fn from_wire<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut users = BTreeSet::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry == DELETED_FOR_EVERYONE {
                return Self::Everyone;
            }
            let user = UserName::new(entry);
            if !user.is_empty() {
                users.insert(user);
            }
        }
        Self::Users(users)
    }

    pub fn is_everyone(&self) -> bool {
        matches!(self, Self::Everyone)
    }

    pub fn contains(&self, user: &UserName) -> bool {
        match self {
            Self::Everyone => true,
            Self::Users(users) => users.contains(user),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Users(users) if users.is_empty())
    }
}

pub fn liked_by_from_wire<I, S>(entries: I) -> BTreeSet<UserName>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .map(UserName::new)
        .filter(|user| !user.is_empty())
        .collect()
}

/// Identity of one logical send, used to collapse duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub sender: UserName,
    pub recipient: String,
    pub content: String,
    pub second: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub state: MessageState,
    pub conversation: ConversationKey,
    pub sender: UserName,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub liked_by: BTreeSet<UserName>,
    pub deleted_for: DeletedFor,
}

impl Message {
    pub fn optimistic(
        conversation: ConversationKey,
        sender: UserName,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            state: MessageState::Optimistic {
                local_id: LocalId::generate(),
            },
            conversation,
            sender,
            content: content.into(),
            timestamp,
            liked_by: BTreeSet::new(),
            deleted_for: DeletedFor::default(),
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match &self.state {
            MessageState::Confirmed { id } => Some(id),
            MessageState::Optimistic { .. } => None,
        }
    }

    pub fn local_id(&self) -> Option<&LocalId> {
        match &self.state {
            MessageState::Optimistic { local_id } => Some(local_id),
            MessageState::Confirmed { .. } => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, MessageState::Confirmed { .. })
    }

    /// Display id: the authoritative id or the local placeholder.
    pub fn handle(&self) -> &str {
        match &self.state {
            MessageState::Confirmed { id } => id.as_str(),
            MessageState::Optimistic { local_id } => local_id.as_str(),
        }
    }

    /// Receiver for direct messages, group id for group messages.
    pub fn recipient(&self) -> &str {
        match &self.conversation {
            ConversationKey::Group(id) => id.as_str(),
            ConversationKey::Direct { high, .. } => self
                .conversation
                .peer_of(&self.sender)
                .unwrap_or(high)
                .as_str(),
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            sender: self.sender.clone(),
            recipient: self.recipient().to_string(),
            content: self.content.clone(),
            second: self.timestamp.timestamp(),
        }
    }

    pub fn is_hidden_for(&self, viewer: &UserName) -> bool {
        self.deleted_for.contains(viewer)
    }

    pub fn display_content(&self, viewer: &UserName) -> &str {
        if self.is_hidden_for(viewer) {
            REMOVED_PLACEHOLDER
        } else {
            &self.content
        }
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
