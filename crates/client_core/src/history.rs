use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{ConversationKey, UserName},
    protocol::{GroupSummary, WireMessage},
};
use tracing::debug;

/// Request/response side of the backend.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Full message history of `conversation` as seen by `viewer`.
    async fn fetch_messages(
        &self,
        viewer: &UserName,
        conversation: &ConversationKey,
    ) -> Result<Vec<WireMessage>>;

    /// Groups the current user belongs to.
    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>>;

    async fn fetch_users(&self) -> Result<Vec<UserName>>;
}

pub struct MissingHistoryApi;

#[async_trait]
impl HistoryApi for MissingHistoryApi {
    async fn fetch_messages(
        &self,
        _viewer: &UserName,
        _conversation: &ConversationKey,
    ) -> Result<Vec<WireMessage>> {
        Err(anyhow!("history api is not configured"))
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>> {
        Err(anyhow!("history api is not configured"))
    }

    async fn fetch_users(&self) -> Result<Vec<UserName>> {
        Err(anyhow!("history api is not configured"))
    }
}

pub struct HttpHistoryApi {
    http: Client,
    server_url: String,
    token: Option<String>,
}

impl HttpHistoryApi {
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(format!("{}{path}", self.server_url));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn fetch_messages(
        &self,
        viewer: &UserName,
        conversation: &ConversationKey,
    ) -> Result<Vec<WireMessage>> {
        let path = match conversation {
            ConversationKey::Group(group_id) => format!("/api/groups/{group_id}/messages"),
            ConversationKey::Direct { .. } => {
                let peer = conversation
                    .peer_of(viewer)
                    .ok_or_else(|| anyhow!("{viewer} is not part of {conversation}"))?;
                format!("/api/messages/{viewer}/{peer}")
            }
        };
        debug!(conversation = %conversation, path, "history: fetching messages");
        let records: Vec<WireMessage> = self
            .get(&path)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records)
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>> {
        let groups: Vec<GroupSummary> = self
            .get("/api/groups/me")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(groups)
    }

    async fn fetch_users(&self) -> Result<Vec<UserName>> {
        let users: Vec<UserName> = self
            .get("/api/auth/users")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(users)
    }
}
