use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    conversation_id::encode_for_transport,
    domain::{Conversation, ConversationPatch, Message},
    error::ApiError,
    ConversationId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn first(page_size: u32) -> Self {
        Self { page: 1, page_size }
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self, page: PageRequest) -> Result<Page<Conversation>>;
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: PageRequest,
    ) -> Result<Page<Message>>;
    async fn update_conversation(
        &self,
        conversation_id: &ConversationId,
        patch: &ConversationPatch,
    ) -> Result<Conversation>;
}

/// Used when no REST endpoint is configured (offline replay).
pub struct MissingConversationApi;

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn list_conversations(&self, _page: PageRequest) -> Result<Page<Conversation>> {
        Err(anyhow!("conversation api is not configured"))
    }

    async fn list_messages(
        &self,
        _conversation_id: &ConversationId,
        _page: PageRequest,
    ) -> Result<Page<Message>> {
        Err(anyhow!("conversation api is not configured"))
    }

    async fn update_conversation(
        &self,
        _conversation_id: &ConversationId,
        _patch: &ConversationPatch,
    ) -> Result<Conversation> {
        Err(anyhow!("conversation api is not configured"))
    }
}

pub struct HttpConversationApi {
    base_url: String,
    http: Client,
    bearer_token: Option<String>,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn conversation_url(&self, conversation_id: &ConversationId) -> String {
        format!(
            "{}/conversations/{}",
            self.base_url,
            encode_for_transport(conversation_id)
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::from_body(status.as_u16(), &body).into());
    }
    Ok(response.json().await?)
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self, page: PageRequest) -> Result<Page<Conversation>> {
        let response = self
            .authorize(self.http.get(format!("{}/conversations", self.base_url)))
            .query(&page)
            .send()
            .await?;
        decode(response).await
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: PageRequest,
    ) -> Result<Page<Message>> {
        let url = format!("{}/messages", self.conversation_url(conversation_id));
        let response = self.authorize(self.http.get(url)).query(&page).send().await?;
        decode(response).await
    }

    async fn update_conversation(
        &self,
        conversation_id: &ConversationId,
        patch: &ConversationPatch,
    ) -> Result<Conversation> {
        let response = self
            .authorize(self.http.patch(self.conversation_url(conversation_id)))
            .json(patch)
            .send()
            .await?;
        decode(response).await
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
