//! Message reconciliation for the currently bound conversation.
//!
//! The engine is a synchronous state machine. Every method is one discrete
//! transition; the message list lives behind an `Arc` and is copied on write,
//! so a [`ReconciliationEngine::snapshot`] taken before a transition never
//! observes it half-applied.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConversationKey, DeletedFor, IdFormat, LocalId, Message, MessageId, MessageState, UserName,
    },
    protocol::{ClientCommand, WireMessage},
};
use tracing::{debug, info, warn};

use crate::error::ClientError;

pub const DEFAULT_CONFIRM_TOLERANCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Maximum distance between an optimistic entry's timestamp and its
    /// server echo for the two to be treated as the same send.
    pub confirm_tolerance: Duration,
    pub id_format: IdFormat,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            confirm_tolerance: DEFAULT_CONFIRM_TOLERANCE,
            id_format: IdFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Initial load after a binding transition.
    Replace,
    /// Reconciling re-fetch; never removes entries already present.
    Merge,
}

/// A history fetch the engine wants performed. The response must be handed
/// back through [`ReconciliationEngine::apply_history`] together with this
/// request so stale responses can be recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub conversation: ConversationKey,
    pub epoch: u64,
    pub mode: FetchMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied { inserted: usize, updated: usize },
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Appended { replaced_optimistic: usize },
    Duplicate { replaced_optimistic: usize },
    /// Message belongs to a conversation other than the bound one.
    NotBound,
    /// Arrived already deleted for everyone.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Updated,
    Removed,
    /// Target not in the list; a merge re-fetch is needed when `refetch`
    /// is set.
    Missing { refetch: Option<HistoryRequest> },
    Ignored,
}

#[derive(Debug, Clone)]
struct Binding {
    conversation: ConversationKey,
    epoch: u64,
    merge_in_flight: bool,
    /// Ids removed for everyone while bound. A later copy of one of these
    /// (redelivered confirmation, history fetched before the delete) is
    /// never re-admitted.
    removed: BTreeSet<MessageId>,
}

pub struct ReconciliationEngine {
    current_user: UserName,
    settings: EngineSettings,
    binding: Option<Binding>,
    next_epoch: u64,
    messages: Arc<Vec<Message>>,
}

impl ReconciliationEngine {
    pub fn new(current_user: UserName, settings: EngineSettings) -> Self {
        Self {
            current_user,
            settings,
            binding: None,
            next_epoch: 0,
            messages: Arc::new(Vec::new()),
        }
    }

    pub fn current_user(&self) -> &UserName {
        &self.current_user
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn bound_conversation(&self) -> Option<&ConversationKey> {
        self.binding.as_ref().map(|binding| &binding.conversation)
    }

    /// Raw sequence, including entries the dedup pass would collapse.
    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    /// Sequence as it should be rendered.
    pub fn visible(&self) -> Vec<Message> {
        dedup_messages(&self.messages)
    }

    /// Switches the bound conversation. The list is cleared immediately and
    /// the returned request loads the new conversation's history.
    pub fn bind(&mut self, conversation: ConversationKey) -> HistoryRequest {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let dropped_optimistic = self
            .messages
            .iter()
            .filter(|message| !message.is_confirmed())
            .count();
        if dropped_optimistic > 0 {
            debug!(
                dropped_optimistic,
                "engine: discarding unconfirmed sends from previous binding"
            );
        }
        info!(conversation = %conversation, epoch, "engine: binding conversation");
        self.messages = Arc::new(Vec::new());
        self.binding = Some(Binding {
            conversation: conversation.clone(),
            epoch,
            merge_in_flight: false,
            removed: BTreeSet::new(),
        });
        HistoryRequest {
            conversation,
            epoch,
            mode: FetchMode::Replace,
        }
    }

    pub fn unbind(&mut self) {
        if let Some(binding) = self.binding.take() {
            info!(conversation = %binding.conversation, "engine: unbinding conversation");
        }
        self.messages = Arc::new(Vec::new());
    }

    /// Request for a merge re-fetch of the bound conversation, unless one is
    /// already outstanding.
    pub fn request_merge_refetch(&mut self) -> Option<HistoryRequest> {
        let binding = self.binding.as_mut()?;
        if binding.merge_in_flight {
            return None;
        }
        binding.merge_in_flight = true;
        Some(HistoryRequest {
            conversation: binding.conversation.clone(),
            epoch: binding.epoch,
            mode: FetchMode::Merge,
        })
    }

    /// Marks a failed fetch so a later stale signal may re-fetch again.
    pub fn history_failed(&mut self, request: &HistoryRequest) {
        if request.mode != FetchMode::Merge {
            return;
        }
        if let Some(binding) = self.binding.as_mut() {
            if binding.conversation == request.conversation && binding.epoch == request.epoch {
                binding.merge_in_flight = false;
            }
        }
    }

    pub fn apply_history(
        &mut self,
        request: &HistoryRequest,
        records: &[WireMessage],
    ) -> HistoryOutcome {
        let Some(binding) = self.binding.as_mut() else {
            debug!(conversation = %request.conversation, "engine: history arrived while unbound");
            return HistoryOutcome::Stale;
        };
        if binding.conversation != request.conversation
            || (request.mode == FetchMode::Replace && binding.epoch != request.epoch)
        {
            debug!(
                requested = %request.conversation,
                bound = %binding.conversation,
                "engine: dropping stale history response"
            );
            return HistoryOutcome::Stale;
        }
        if request.mode == FetchMode::Merge && binding.epoch == request.epoch {
            binding.merge_in_flight = false;
        }

        let fetched = self.resolve_records(&request.conversation, records);
        let outcome = match request.mode {
            FetchMode::Replace => self.replace_with(fetched),
            FetchMode::Merge => self.merge_with(fetched),
        };
        info!(
            conversation = %request.conversation,
            mode = ?request.mode,
            len = self.messages.len(),
            "engine: applied history"
        );
        outcome
    }

    /// Appends an optimistic entry for `content` and returns it together
    /// with the command that transmits the send.
    pub fn send_optimistic(
        &mut self,
        content: &str,
    ) -> Result<(Message, ClientCommand), ClientError> {
        self.send_optimistic_at(content, Utc::now())
    }

    pub fn send_optimistic_at(
        &mut self,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(Message, ClientCommand), ClientError> {
        let conversation = self
            .bound_conversation()
            .cloned()
            .ok_or(ClientError::NotBound)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyContent);
        }

        let command = match &conversation {
            ConversationKey::Group(group_id) => ClientCommand::GroupMessage {
                group_id: group_id.clone(),
                from: self.current_user.clone(),
                content: content.to_string(),
            },
            ConversationKey::Direct { .. } => {
                let receiver = conversation
                    .peer_of(&self.current_user)
                    .cloned()
                    .ok_or_else(|| ClientError::NotParticipant(conversation.to_string()))?;
                ClientCommand::Message {
                    sender_id: self.current_user.clone(),
                    receiver_id: receiver,
                    content: content.to_string(),
                    timestamp: now,
                    likes: Vec::new(),
                    deleted_by: Vec::new(),
                }
            }
        };

        let message = Message::optimistic(conversation, self.current_user.clone(), content, now);
        Arc::make_mut(&mut self.messages).push(message.clone());
        debug!(local_id = %message.handle(), "engine: appended optimistic message");
        Ok((message, command))
    }

    /// Applies a server-confirmed message.
    pub fn apply_confirmation(&mut self, incoming: Message) -> ConfirmOutcome {
        if self.bound_conversation() != Some(&incoming.conversation) {
            return ConfirmOutcome::NotBound;
        }
        let Some(id) = incoming.id().cloned() else {
            warn!("engine: confirmation without authoritative id ignored");
            return ConfirmOutcome::Discarded;
        };

        let tolerance = self.tolerance();
        let removed = self.was_removed(&id);
        let messages = Arc::make_mut(&mut self.messages);
        let before = messages.len();
        messages.retain(|existing| !matches_optimistic(existing, &incoming, tolerance));
        let replaced_optimistic = before - messages.len();

        if incoming.deleted_for.is_everyone() || removed {
            return ConfirmOutcome::Discarded;
        }
        if messages
            .iter()
            .any(|existing| existing.id() == Some(&id))
        {
            debug!(message_id = %id, "engine: duplicate confirmation dropped");
            return ConfirmOutcome::Duplicate {
                replaced_optimistic,
            };
        }
        messages.push(incoming);
        debug!(message_id = %id, replaced_optimistic, "engine: confirmed message appended");
        ConfirmOutcome::Appended {
            replaced_optimistic,
        }
    }

    /// Applies an authoritative like set to `target`.
    pub fn apply_like(&mut self, target: &str, likes: &[String]) -> MutationOutcome {
        if self.binding.is_none() {
            return MutationOutcome::Ignored;
        }
        let Some(id) = self.settings.id_format.extract(target) else {
            warn!(target, "engine: like update for malformed id ignored");
            return MutationOutcome::Ignored;
        };
        let liked_by = shared::domain::liked_by_from_wire(likes);
        let Some(index) = self.position(&id) else {
            info!(message_id = %id, "engine: like for unknown message, view is stale");
            return MutationOutcome::Missing {
                refetch: self.request_merge_refetch(),
            };
        };
        let messages = Arc::make_mut(&mut self.messages);
        messages[index].liked_by = liked_by;
        MutationOutcome::Updated
    }

    /// Applies an authoritative delete set to `target`. A wildcard removes
    /// the entry; anything else updates it in place.
    pub fn apply_delete(
        &mut self,
        target: &str,
        deleted_by: &[String],
        likes: Option<&[String]>,
    ) -> MutationOutcome {
        if self.binding.is_none() {
            return MutationOutcome::Ignored;
        }
        let Some(id) = self.settings.id_format.extract(target) else {
            warn!(target, "engine: delete update for malformed id ignored");
            return MutationOutcome::Ignored;
        };
        let deleted_for = DeletedFor::from_wire(deleted_by);
        if deleted_for.is_everyone() {
            if let Some(binding) = self.binding.as_mut() {
                binding.removed.insert(id.clone());
            }
        }
        let Some(index) = self.position(&id) else {
            debug!(message_id = %id, "engine: delete for absent message is a no-op");
            return MutationOutcome::Missing { refetch: None };
        };

        let messages = Arc::make_mut(&mut self.messages);
        if deleted_for.is_everyone() {
            messages.retain(|message| message.id() != Some(&id));
            return MutationOutcome::Removed;
        }
        let entry = &mut messages[index];
        entry.deleted_for = deleted_for;
        if let Some(likes) = likes {
            entry.liked_by = shared::domain::liked_by_from_wire(likes);
        }
        MutationOutcome::Updated
    }

    pub fn like_command(&self, target: &str) -> Result<ClientCommand, ClientError> {
        let (message_id, is_group, group_id) = self.mutation_target(target)?;
        Ok(ClientCommand::Like {
            message_id,
            is_group,
            group_id,
        })
    }

    pub fn delete_command(&self, target: &str) -> Result<ClientCommand, ClientError> {
        let (message_id, is_group, group_id) = self.mutation_target(target)?;
        Ok(ClientCommand::Delete {
            message_id,
            is_group,
            group_id,
        })
    }

    fn mutation_target(
        &self,
        target: &str,
    ) -> Result<(MessageId, bool, Option<shared::domain::GroupId>), ClientError> {
        let conversation = self.bound_conversation().ok_or(ClientError::NotBound)?;
        if LocalId::is_local(target.trim()) {
            return Err(ClientError::UnconfirmedTarget(target.to_string()));
        }
        let message_id = self
            .settings
            .id_format
            .parse(target)
            .ok_or_else(|| ClientError::InvalidIdentifier(target.to_string()))?;
        let group_id = conversation.group_id().cloned();
        Ok((message_id, group_id.is_some(), group_id))
    }

    fn tolerance(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.confirm_tolerance)
            .unwrap_or_else(|_| chrono::Duration::seconds(5))
    }

    fn was_removed(&self, id: &MessageId) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.removed.contains(id))
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id() == Some(id))
    }

    fn resolve_records(
        &self,
        conversation: &ConversationKey,
        records: &[WireMessage],
    ) -> Vec<Message> {
        let format = self.settings.id_format;
        let mut resolved = Vec::with_capacity(records.len());
        for record in records {
            match record.to_message(&format, Some(conversation)) {
                Ok(message) if &message.conversation == conversation => resolved.push(message),
                Ok(message) => {
                    debug!(
                        message_id = %message.handle(),
                        conversation = %message.conversation,
                        "engine: history record outside bound conversation skipped"
                    );
                }
                Err(err) => {
                    debug!(error = %err, "engine: unusable history record skipped");
                }
            }
        }
        resolved
    }

    fn replace_with(&mut self, fetched: Vec<Message>) -> HistoryOutcome {
        let tolerance = self.tolerance();
        let mut next: Vec<Message> = fetched
            .into_iter()
            .filter(|message| !message.deleted_for.is_everyone())
            .filter(|message| !message.id().is_some_and(|id| self.was_removed(id)))
            .collect();
        let inserted = next.len();

        // Entries that arrived through events while the load was in flight
        // belong to this binding and must survive the replace.
        let mut updated = 0;
        for existing in self.messages.iter() {
            let known = match existing.id() {
                Some(id) => next.iter().any(|message| message.id() == Some(id)),
                None => next
                    .iter()
                    .any(|message| matches_optimistic(existing, message, tolerance)),
            };
            if !known {
                next.push(existing.clone());
                updated += 1;
            }
        }

        self.messages = Arc::new(dedup_messages(&next));
        HistoryOutcome::Applied { inserted, updated }
    }

    fn merge_with(&mut self, fetched: Vec<Message>) -> HistoryOutcome {
        let tolerance = self.tolerance();
        let removed = self
            .binding
            .as_ref()
            .map(|binding| binding.removed.clone())
            .unwrap_or_default();
        let messages = Arc::make_mut(&mut self.messages);
        let mut inserted = 0;
        let mut updated = 0;

        for incoming in fetched {
            let Some(id) = incoming.id() else {
                continue;
            };
            if removed.contains(id) {
                continue;
            }
            if let Some(existing) = messages.iter_mut().find(|m| m.id() == Some(id)) {
                if existing.liked_by != incoming.liked_by
                    || existing.deleted_for != incoming.deleted_for
                {
                    existing.liked_by = incoming.liked_by;
                    existing.deleted_for = incoming.deleted_for;
                    updated += 1;
                }
                continue;
            }
            if incoming.deleted_for.is_everyone() {
                continue;
            }
            if let Some(pending) = messages
                .iter_mut()
                .find(|m| matches_optimistic(m, &incoming, tolerance))
            {
                // Promote in place: the confirmed record takes the pending
                // entry's slot instead of being appended after it.
                *pending = incoming;
                updated += 1;
                continue;
            }
            messages.push(incoming);
            inserted += 1;
        }

        let deduped = dedup_messages(messages);
        *messages = deduped;
        HistoryOutcome::Applied { inserted, updated }
    }
}

/// Whether `existing` is an optimistic entry for the same send as
/// `confirmed`: same sender, recipient and content within `tolerance`.
fn matches_optimistic(
    existing: &Message,
    confirmed: &Message,
    tolerance: chrono::Duration,
) -> bool {
    matches!(existing.state, MessageState::Optimistic { .. })
        && existing.sender == confirmed.sender
        && existing.conversation == confirmed.conversation
        && existing.recipient() == confirmed.recipient()
        && existing.content == confirmed.content
        && (existing.timestamp - confirmed.timestamp).abs() < tolerance
}

/// Keeps the first message per dedup key, preserving relative order.
pub fn dedup_messages(messages: &[Message]) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(messages.len());
    messages
        .iter()
        .filter(|message| seen.insert(message.dedup_key()))
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
