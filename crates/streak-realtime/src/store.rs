use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use uuid::Uuid;

use streak_types::api::{LoginRequest, LoginResponse, MarkReadRequest};
use streak_types::models::{ConversationKey, ConversationMember, Message};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {0}")]
    Status(StatusCode),

    #[error("store acts for {bound}, not {requested}")]
    WrongUser { bound: Uuid, requested: Uuid },

    #[error("{0}")]
    Backend(String),
}

/// Storage collaborator for unread tracking. Implementations fail
/// independently; callers treat every error as "state unknown".
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages in `conversation`, as seen by `user_id`, created strictly
    /// after `after` (all of them when `None`).
    async fn query_messages(
        &self,
        user_id: Uuid,
        conversation: ConversationKey,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, StoreError>;

    async fn update_last_read_at(
        &self,
        conversation: ConversationKey,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list_conversation_memberships(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConversationMember>, StoreError>;
}

/// [`MessageStore`] backed by the streak HTTP API. Acts for the user the
/// bearer token was issued to.
#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
    user_id: Uuid,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            user_id,
        }
    }

    /// Exchange credentials for a token.
    pub async fn login(base_url: &str, username: &str, password: &str) -> Result<LoginResponse, StoreError> {
        let response = reqwest::Client::new()
            .post(format!("{}/auth/login", base_url.trim_end_matches('/')))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        Ok(checked(response)?.json().await?)
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    fn ensure_user(&self, requested: Uuid) -> Result<(), StoreError> {
        if requested == self.user_id {
            Ok(())
        } else {
            Err(StoreError::WrongUser {
                bound: self.user_id,
                requested,
            })
        }
    }
}

fn checked(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StoreError::Status(status))
    }
}

#[async_trait]
impl MessageStore for HttpStore {
    async fn query_messages(
        &self,
        user_id: Uuid,
        conversation: ConversationKey,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, StoreError> {
        self.ensure_user(user_id)?;

        let mut request = self
            .client
            .get(format!("{}/conversations/{}/messages", self.base_url, conversation))
            .bearer_auth(&self.token);
        if let Some(after) = after {
            request = request.query(&[("after", after.to_rfc3339_opts(SecondsFormat::Micros, true))]);
        }

        let response = request.send().await?;
        Ok(checked(response)?.json().await?)
    }

    async fn update_last_read_at(
        &self,
        conversation: ConversationKey,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_user(user_id)?;

        let response = self
            .client
            .put(format!("{}/conversations/{}/read", self.base_url, conversation))
            .bearer_auth(&self.token)
            .json(&MarkReadRequest { read_at })
            .send()
            .await?;
        checked(response)?;
        Ok(())
    }

    async fn list_conversation_memberships(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConversationMember>, StoreError> {
        self.ensure_user(user_id)?;

        let response = self
            .client
            .get(format!("{}/conversations", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(checked(response)?.json().await?)
    }
}
