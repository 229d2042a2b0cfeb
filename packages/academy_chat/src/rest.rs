//! REST collaborators used to bootstrap state before realtime events are
//! trusted as authoritative: fetch-or-create the end user's conversation,
//! list conversations for the console, page message history, read unread
//! counts, and backfill conversation metadata for placeholder stores.
//!
//! The backend endpoints are assumed idempotent and paginated; they are
//! consumed here, not designed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ChatError;
use crate::models::{ConversationMeta, Message};

#[async_trait]
pub trait ConversationApi: Send + Sync + 'static {
    /// Get-or-create the signed-in user's own conversation (widget).
    async fn fetch_or_create_conversation(&self) -> Result<ConversationMeta, ChatError>;

    /// All conversations, for seeding the admin console.
    async fn list_conversations(&self) -> Result<Vec<ConversationMeta>, ChatError>;

    /// One page of message history, newest-last, optionally bounded above
    /// by `before`.
    async fn message_page(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError>;

    /// Server-side unread count, used as a bootstrap cross-check.
    async fn unread_count(&self, conversation_id: &str) -> Result<usize, ChatError>;

    /// Metadata for a single conversation (placeholder backfill).
    async fn conversation(&self, conversation_id: &str) -> Result<ConversationMeta, ChatError>;
}

#[derive(Debug, Deserialize)]
struct UnreadResponse {
    count: usize,
}

/// reqwest-backed implementation against the platform API.
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    credential: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credential: credential.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chat{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn fetch_or_create_conversation(&self) -> Result<ConversationMeta, ChatError> {
        let meta = self
            .http
            .post(self.url("/conversations"))
            .bearer_auth(&self.credential)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(meta)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationMeta>, ChatError> {
        let list = self
            .http
            .get(self.url("/conversations"))
            .bearer_auth(&self.credential)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list)
    }

    async fn message_page(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let mut request = self
            .http
            .get(self.url(&format!("/conversations/{}/messages", conversation_id)))
            .bearer_auth(&self.credential)
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before {
            request = request.query(&[("before", before.to_rfc3339())]);
        }
        let page = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }

    async fn unread_count(&self, conversation_id: &str) -> Result<usize, ChatError> {
        let response: UnreadResponse = self
            .http
            .get(self.url(&format!("/conversations/{}/unread", conversation_id)))
            .bearer_auth(&self.credential)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.count)
    }

    async fn conversation(&self, conversation_id: &str) -> Result<ConversationMeta, ChatError> {
        let meta = self
            .http
            .get(self.url(&format!("/conversations/{}", conversation_id)))
            .bearer_auth(&self.credential)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(meta)
    }
}
