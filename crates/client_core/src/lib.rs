use std::sync::{Arc, PoisonError};

use anyhow::{Context, Result};
use shared::{
    domain::{ConversationKey, GroupId, Message, UserName},
    protocol::ServerEvent,
};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{info, warn};

pub mod channel;
pub mod directory;
pub mod engine;
pub mod error;
pub mod history;

pub use channel::{EventChannel, Subscription};
pub use directory::{ConversationDirectory, DirectoryChange};
pub use engine::{
    ConfirmOutcome, EngineSettings, FetchMode, HistoryOutcome, HistoryRequest, MutationOutcome,
    ReconciliationEngine,
};
pub use error::ClientError;
pub use history::{HistoryApi, HttpHistoryApi, MissingHistoryApi};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The bound conversation's list changed; re-read [`ChatClient::messages`].
    MessagesChanged {
        conversation: ConversationKey,
    },
    /// The bound group went away and the list was cleared.
    ConversationUnbound {
        conversation: ConversationKey,
    },
    /// A confirmed message for a conversation that is not bound.
    BackgroundMessage {
        message: Message,
    },
    DirectoryChanged,
    PresenceChanged,
    /// Reported by the backend; local state is unchanged.
    ServerError(String),
    Error(String),
}

#[derive(Debug, Clone, Copy)]
enum EventRoute {
    Engine,
    Directory,
}

/// View binding for one signed-in session: owns the engine and the
/// directory and routes channel events into both.
pub struct ChatClient {
    current_user: UserName,
    history: Arc<dyn HistoryApi>,
    channel: Arc<EventChannel>,
    engine: Mutex<ReconciliationEngine>,
    directory: RwLock<ConversationDirectory>,
    subscriptions: std::sync::Mutex<Vec<Subscription>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(current_user: impl AsRef<str>) -> Arc<Self> {
        Self::new_with_dependencies(
            UserName::new(current_user),
            EngineSettings::default(),
            Arc::new(MissingHistoryApi),
            EventChannel::new(),
        )
    }

    pub fn new_with_dependencies(
        current_user: UserName,
        settings: EngineSettings,
        history: Arc<dyn HistoryApi>,
        channel: Arc<EventChannel>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            engine: Mutex::new(ReconciliationEngine::new(current_user.clone(), settings)),
            directory: RwLock::new(ConversationDirectory::new(current_user.clone())),
            current_user,
            history,
            channel,
            subscriptions: std::sync::Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn current_user(&self) -> &UserName {
        &self.current_user
    }

    pub fn channel(&self) -> &Arc<EventChannel> {
        &self.channel
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Registers the engine and directory with the channel. Must be called
    /// from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !subscriptions.is_empty() {
            return;
        }
        subscriptions.push(self.spawn_event_pump(EventRoute::Engine));
        subscriptions.push(self.spawn_event_pump(EventRoute::Directory));
        info!(user = %self.current_user, "client: started");
    }

    pub async fn connect(&self, ws_url: &str) -> Result<()> {
        self.channel.connect(ws_url).await
    }

    pub fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        self.channel.disconnect();
        info!(user = %self.current_user, "client: shut down");
    }

    /// Each route gets its own queue so engine and directory each see events
    /// in arrival order without blocking the channel's reader.
    fn spawn_event_pump(self: &Arc<Self>, route: EventRoute) -> Subscription {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                match route {
                    EventRoute::Engine => client.handle_engine_event(event).await,
                    EventRoute::Directory => client.handle_directory_event(event).await,
                }
            }
        });
        self.channel.subscribe(move |event| {
            let _ = tx.send(event.clone());
        })
    }

    /// Binds `conversation` and loads its history. A failed load leaves the
    /// binding in place with an empty list and is reported through
    /// [`ClientEvent::Error`], not returned.
    pub async fn select_conversation(&self, conversation: ConversationKey) -> Result<()> {
        if let ConversationKey::Direct { .. } = &conversation {
            if !conversation.involves(&self.current_user) {
                return Err(ClientError::NotParticipant(conversation.to_string()).into());
            }
        }
        let request = self.engine.lock().await.bind(conversation.clone());
        let _ = self
            .events
            .send(ClientEvent::MessagesChanged { conversation });
        self.load_history(request).await;
        Ok(())
    }

    pub async fn select_direct(&self, peer: &str) -> Result<()> {
        let peer = UserName::new(peer);
        if peer.is_empty() {
            return Err(ClientError::InvalidIdentifier(peer.to_string()).into());
        }
        self.directory.write().await.note_peer(&peer);
        self.select_conversation(ConversationKey::direct(self.current_user.clone(), peer))
            .await
    }

    pub async fn select_group(&self, group_id: &str) -> Result<()> {
        let group_id = GroupId::new(group_id);
        if group_id.is_empty() {
            return Err(ClientError::InvalidIdentifier(group_id.to_string()).into());
        }
        self.select_conversation(ConversationKey::group(group_id))
            .await
    }

    pub async fn bound_conversation(&self) -> Option<ConversationKey> {
        self.engine.lock().await.bound_conversation().cloned()
    }

    /// Deduplicated list of the bound conversation.
    pub async fn messages(&self) -> Vec<Message> {
        self.engine.lock().await.visible()
    }

    pub async fn directory(&self) -> ConversationDirectory {
        self.directory.read().await.clone()
    }

    pub async fn send_message(&self, text: &str) -> Result<Message> {
        let (message, command) = self.engine.lock().await.send_optimistic(text)?;
        self.channel.send(&command);
        let _ = self.events.send(ClientEvent::MessagesChanged {
            conversation: message.conversation.clone(),
        });
        Ok(message)
    }

    pub async fn like(&self, message_id: &str) -> Result<()> {
        let command = self.engine.lock().await.like_command(message_id)?;
        self.channel.send(&command);
        Ok(())
    }

    pub async fn delete(&self, message_id: &str) -> Result<()> {
        let command = self.engine.lock().await.delete_command(message_id)?;
        self.channel.send(&command);
        Ok(())
    }

    pub async fn create_group(&self, name: &str, members: &[&str]) -> Result<()> {
        let command = self
            .directory
            .read()
            .await
            .create_group_command(name, members.iter().map(UserName::new))?;
        self.channel.send(&command);
        Ok(())
    }

    pub async fn add_member(&self, group_id: &str, user: &str) -> Result<()> {
        let command = self
            .directory
            .read()
            .await
            .add_member_command(&GroupId::new(group_id), &UserName::new(user))?;
        self.channel.send(&command);
        Ok(())
    }

    pub async fn remove_member(&self, group_id: &str, user: &str) -> Result<()> {
        let command = self
            .directory
            .read()
            .await
            .remove_member_command(&GroupId::new(group_id), &UserName::new(user))?;
        self.channel.send(&command);
        Ok(())
    }

    pub async fn promote_admin(&self, group_id: &str, user: &str) -> Result<()> {
        let command = self
            .directory
            .read()
            .await
            .promote_admin_command(&GroupId::new(group_id), &UserName::new(user))?;
        self.channel.send(&command);
        Ok(())
    }

    pub async fn exit_group(&self, group_id: &str) -> Result<()> {
        let command = self
            .directory
            .read()
            .await
            .exit_group_command(&GroupId::new(group_id))?;
        self.channel.send(&command);
        Ok(())
    }

    pub async fn refresh_directory(&self) -> Result<()> {
        let groups = self
            .history
            .fetch_groups()
            .await
            .context("failed to fetch groups")?;
        let users = self
            .history
            .fetch_users()
            .await
            .context("failed to fetch users")?;
        {
            let mut directory = self.directory.write().await;
            directory.replace_groups(groups);
            directory.set_peers(users);
        }
        let _ = self.events.send(ClientEvent::DirectoryChanged);
        Ok(())
    }

    /// `None` when the fetch failed; the current list is kept.
    async fn load_history(&self, request: HistoryRequest) -> Option<HistoryOutcome> {
        match self
            .history
            .fetch_messages(&self.current_user, &request.conversation)
            .await
        {
            Ok(records) => {
                let outcome = self.engine.lock().await.apply_history(&request, &records);
                if let HistoryOutcome::Applied { .. } = outcome {
                    let _ = self.events.send(ClientEvent::MessagesChanged {
                        conversation: request.conversation.clone(),
                    });
                }
                Some(outcome)
            }
            Err(err) => {
                self.engine.lock().await.history_failed(&request);
                warn!(
                    conversation = %request.conversation,
                    mode = ?request.mode,
                    error = %err,
                    "client: history fetch failed, keeping current list"
                );
                let _ = self.events.send(ClientEvent::Error(format!(
                    "failed to load history for {}: {err:#}",
                    request.conversation
                )));
                None
            }
        }
    }

    async fn handle_engine_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Message(ref wire) | ServerEvent::GroupMessage(ref wire) => {
                let mut engine = self.engine.lock().await;
                let message = match wire.to_message(&engine.settings().id_format, None) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(event = event.name(), error = %err, "client: unusable message event");
                        let _ = self.events.send(ClientEvent::Error(format!(
                            "invalid {} event: {err}",
                            event.name()
                        )));
                        return;
                    }
                };
                let conversation = message.conversation.clone();
                match engine.apply_confirmation(message.clone()) {
                    ConfirmOutcome::NotBound => {
                        let _ = self.events.send(ClientEvent::BackgroundMessage { message });
                    }
                    ConfirmOutcome::Duplicate {
                        replaced_optimistic: 0,
                    } => {}
                    _ => {
                        let _ = self
                            .events
                            .send(ClientEvent::MessagesChanged { conversation });
                    }
                }
            }
            ServerEvent::LikeUpdate { message_id, likes } => {
                let (outcome, conversation) = {
                    let mut engine = self.engine.lock().await;
                    let outcome = engine.apply_like(&message_id, &likes);
                    (outcome, engine.bound_conversation().cloned())
                };
                match outcome {
                    MutationOutcome::Updated | MutationOutcome::Removed => {
                        self.notify_bound(conversation);
                    }
                    MutationOutcome::Missing {
                        refetch: Some(request),
                    } => {
                        let client = Arc::clone(self);
                        tokio::spawn(async move {
                            let _ = client.load_history(request).await;
                        });
                    }
                    MutationOutcome::Missing { refetch: None } | MutationOutcome::Ignored => {}
                }
            }
            ServerEvent::DeleteUpdate {
                message_id,
                deleted_by,
                likes,
            } => {
                let (outcome, conversation) = {
                    let mut engine = self.engine.lock().await;
                    let outcome = engine.apply_delete(&message_id, &deleted_by, likes.as_deref());
                    (outcome, engine.bound_conversation().cloned())
                };
                if matches!(outcome, MutationOutcome::Updated | MutationOutcome::Removed) {
                    self.notify_bound(conversation);
                }
            }
            ServerEvent::GroupRemoved { ref group_id } | ServerEvent::GroupExited { ref group_id } => {
                let mut engine = self.engine.lock().await;
                let Some(conversation) = engine
                    .bound_conversation()
                    .filter(|bound| bound.group_id() == Some(group_id))
                    .cloned()
                else {
                    return;
                };
                engine.unbind();
                info!(group_id = %group_id, event = event.name(), "client: bound group went away");
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUnbound { conversation });
            }
            ServerEvent::Error { message } => {
                warn!(error = %message, "client: backend reported an error");
                let _ = self.events.send(ClientEvent::ServerError(message));
            }
            _ => {}
        }
    }

    async fn handle_directory_event(&self, event: ServerEvent) {
        match &event {
            ServerEvent::GroupCreated { .. }
            | ServerEvent::GroupAdded { .. }
            | ServerEvent::GroupUpdated { .. }
            | ServerEvent::GroupRemoved { .. }
            | ServerEvent::GroupExited { .. } => {
                if self
                    .directory
                    .write()
                    .await
                    .apply_group_event(&event)
                    .is_some()
                {
                    let _ = self.events.send(ClientEvent::DirectoryChanged);
                }
            }
            ServerEvent::Status { .. } | ServerEvent::InitialStatus { .. } => {
                if self.directory.write().await.apply_presence_event(&event) {
                    let _ = self.events.send(ClientEvent::PresenceChanged);
                }
            }
            ServerEvent::Message(wire) => {
                let Some(conversation) = wire.conversation() else {
                    return;
                };
                let Some(peer) = conversation.peer_of(&self.current_user) else {
                    return;
                };
                if self.directory.write().await.note_peer(peer) {
                    let _ = self.events.send(ClientEvent::DirectoryChanged);
                }
            }
            _ => {}
        }
    }

    fn notify_bound(&self, conversation: Option<ConversationKey>) {
        if let Some(conversation) = conversation {
            let _ = self
                .events
                .send(ClientEvent::MessagesChanged { conversation });
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
