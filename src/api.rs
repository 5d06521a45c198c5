//! REST client for the chat server.
//!
//! JSON endpoints share one request path ([`ApiClient::send`]) that maps
//! connection failures, non-2xx statuses and body decode failures onto
//! [`ClientError`]. The two generation endpoints return the raw response
//! body as a [`ByteStream`] of UTF-8 chunks.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::model::{
    Attachment, ConversationSummary, HistoryMessage, Project, ProjectInput, Provider, ProviderInput,
    ProviderModel, SystemPrompt,
};

/// Body of a streaming generation response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Parameters of `POST /chat`.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
    pub system_prompt: String,
    pub client_id: String,
    pub attachments: Vec<Attachment>,
}

/// Parameters of `POST /regenerate_response`.
#[derive(Debug, Clone)]
pub struct RegenerateRequest {
    pub conversation_id: String,
    pub message_id: String,
    /// The user prompt the regenerated reply answers.
    pub message: String,
    pub system_prompt: String,
    pub client_id: String,
}

// -- response envelopes -----------------------------------------------------

#[derive(Deserialize)]
struct ConversationsEnvelope {
    conversations: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    messages: Vec<HistoryMessage>,
}

#[derive(Deserialize)]
struct CreatedConversation {
    conversation_id: String,
}

#[derive(Deserialize)]
struct ContentEnvelope {
    content: String,
}

#[derive(Deserialize)]
struct SystemPromptEnvelope {
    system_prompt: String,
}

#[derive(Deserialize)]
struct VersionEnvelope {
    version: String,
}

#[derive(Deserialize)]
struct ProvidersEnvelope {
    providers: Vec<Provider>,
}

#[derive(Deserialize)]
struct ModelsEnvelope {
    models: Vec<ProviderModel>,
}

#[derive(Deserialize)]
struct PromptsEnvelope {
    prompts: Vec<SystemPrompt>,
}

#[derive(Deserialize)]
struct ProjectsEnvelope {
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct IdEnvelope<T> {
    id: T,
}

/// `{"status": "success"}` and friends; the body is not inspected.
#[derive(Deserialize)]
struct Ack {}

#[derive(Deserialize)]
struct ErrorDetail {
    detail: String,
}

/// Thin typed wrapper over the server's HTTP API.
#[derive(Clone)]
pub struct ApiClient {
    config: ClientConfig,
    client: reqwest::Client,
}

impl ApiClient {
    /// Build a client. Only the connect timeout is set on the underlying
    /// client; the request timeout is applied per non-streaming call so that
    /// long generations are not cut off.
    pub fn new(config: ClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn check(resp: Response, url: &str) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorDetail>(&body)
            .map(|d| d.detail)
            .unwrap_or(body);
        Err(ClientError::Http {
            status,
            url: url.to_string(),
            detail,
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let url = self.config.url(path);
        debug!(%method, %url, "api request");
        let mut req = self
            .client
            .request(method, &url)
            .timeout(self.config.request_timeout());
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| ClientError::transport(&url, e))?;
        let resp = Self::check(resp, &url).await?;
        let bytes = resp.bytes().await.map_err(|e| ClientError::transport(&url, e))?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::decode(path, e))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(Method::GET, path, None).await
    }

    fn body<B: Serialize>(value: &B) -> Result<serde_json::Value> {
        serde_json::to_value(value).map_err(|e| ClientError::decode("request body", e))
    }

    // -----------------------------------------------------------------------
    // Conversations and messages
    // -----------------------------------------------------------------------

    pub async fn version(&self) -> Result<String> {
        Ok(self.get::<VersionEnvelope>("/version").await?.version)
    }

    pub async fn list_conversations(&self, project_id: Option<&str>) -> Result<Vec<ConversationSummary>> {
        let path = match project_id {
            Some(p) => format!("/conversations?project_id={}", encode_component(p)),
            None => "/conversations".to_string(),
        };
        Ok(self.get::<ConversationsEnvelope>(&path).await?.conversations)
    }

    pub async fn fetch_conversation(&self, conversation_id: &str) -> Result<Vec<HistoryMessage>> {
        let path = format!("/conversations/{}", encode_component(conversation_id));
        Ok(self.get::<MessagesEnvelope>(&path).await?.messages)
    }

    pub async fn create_conversation(&self, project_id: Option<&str>) -> Result<String> {
        let body = json!({ "project_id": project_id });
        let created: CreatedConversation = self
            .send(Method::POST, "/create_conversation", Some(body))
            .await?;
        Ok(created.conversation_id)
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let path = format!("/conversations/{}", encode_component(conversation_id));
        self.send::<Ack>(Method::DELETE, &path, None).await.map(|_| ())
    }

    /// Set a conversation's title (its summary).
    pub async fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<()> {
        let path = format!("/conversations/{}/title", encode_component(conversation_id));
        self.send::<Ack>(Method::PUT, &path, Some(json!({ "title": title })))
            .await
            .map(|_| ())
    }

    pub async fn edit_message(&self, message_id: &str, content: &str) -> Result<()> {
        let path = format!("/messages/{}", encode_component(message_id));
        self.send::<Ack>(Method::PUT, &path, Some(json!({ "content": content })))
            .await
            .map(|_| ())
    }

    /// Unrendered source of a stored message.
    pub async fn raw_message(&self, message_id: &str) -> Result<String> {
        let path = format!("/messages/{}/raw", encode_component(message_id));
        Ok(self.get::<ContentEnvelope>(&path).await?.content)
    }

    /// Bytes of a stored attachment.
    pub async fn fetch_attachment(&self, attachment_id: &str) -> Result<Bytes> {
        let url = self
            .config
            .url(&format!("/attachments/{}", encode_component(attachment_id)));
        let resp = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| ClientError::transport(&url, e))?;
        let resp = Self::check(resp, &url).await?;
        resp.bytes().await.map_err(|e| ClientError::transport(&url, e))
    }

    /// System prompt the server would use for `conversation_id` (or for a
    /// new conversation when `None`).
    pub async fn system_prompt_for(&self, conversation_id: Option<&str>) -> Result<String> {
        let path = match conversation_id {
            Some(id) => format!("/get_system_prompt?conversation_id={}", encode_component(id)),
            None => "/get_system_prompt".to_string(),
        };
        Ok(self.get::<SystemPromptEnvelope>(&path).await?.system_prompt)
    }

    // -----------------------------------------------------------------------
    // Streaming generation
    // -----------------------------------------------------------------------

    async fn stream(&self, path: &str, form: Form) -> Result<ByteStream> {
        let url = self.config.url(path);
        debug!(%url, "opening generation stream");
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::transport(&url, e))?;
        let resp = Self::check(resp, &url).await?;
        let stream = resp
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| ClientError::transport(&url, e)));
        Ok(Box::pin(stream))
    }

    /// Submit a prompt and stream the reply.
    pub async fn chat(&self, req: ChatRequest) -> Result<ByteStream> {
        let mut form = Form::new()
            .text("message", req.message)
            .text("system_prompt", req.system_prompt)
            .text("conversation_id", req.conversation_id)
            .text("client_id", req.client_id);
        for attachment in req.attachments {
            match attachment {
                Attachment::Pending {
                    name,
                    mime_type,
                    data,
                } => {
                    let part = Part::bytes(data.to_vec())
                        .file_name(name)
                        .mime_str(&mime_type)
                        .map_err(|e| ClientError::decode("attachment mime type", e))?;
                    form = form.part("files", part);
                }
                Attachment::Stored { attachment_id, .. } => {
                    debug!(%attachment_id, "attachment already stored, not re-uploaded");
                }
            }
        }
        self.stream("/chat", form).await
    }

    /// Stream a replacement for an existing assistant message.
    pub async fn regenerate(&self, req: RegenerateRequest) -> Result<ByteStream> {
        let form = Form::new()
            .text("message", req.message)
            .text("system_prompt", req.system_prompt)
            .text("conversation_id", req.conversation_id)
            .text("message_id", req.message_id)
            .text("client_id", req.client_id);
        self.stream("/regenerate_response", form).await
    }

    // -----------------------------------------------------------------------
    // Providers and models
    // -----------------------------------------------------------------------

    pub async fn list_providers(&self) -> Result<Vec<Provider>> {
        Ok(self.get::<ProvidersEnvelope>("/providers").await?.providers)
    }

    pub async fn get_provider(&self, id: i64) -> Result<Provider> {
        self.get(&format!("/providers/{id}")).await
    }

    pub async fn default_provider(&self) -> Result<Provider> {
        self.get("/default_provider").await
    }

    pub async fn create_provider(&self, input: &ProviderInput) -> Result<i64> {
        let created: IdEnvelope<i64> = self
            .send(Method::POST, "/providers", Some(Self::body(input)?))
            .await?;
        Ok(created.id)
    }

    pub async fn update_provider(&self, id: i64, input: &ProviderInput) -> Result<()> {
        self.send::<Ack>(Method::PUT, &format!("/providers/{id}"), Some(Self::body(input)?))
            .await
            .map(|_| ())
    }

    pub async fn delete_provider(&self, id: i64) -> Result<()> {
        self.send::<Ack>(Method::DELETE, &format!("/providers/{id}"), None)
            .await
            .map(|_| ())
    }

    pub async fn set_default_provider(&self, id: i64) -> Result<()> {
        self.send::<Ack>(Method::POST, &format!("/providers/{id}/set_default"), None)
            .await
            .map(|_| ())
    }

    pub async fn list_models(&self, provider_id: i64) -> Result<Vec<ProviderModel>> {
        Ok(self
            .get::<ModelsEnvelope>(&format!("/providers/{provider_id}/models"))
            .await?
            .models)
    }

    pub async fn add_model(&self, provider_id: i64, model_name: &str, is_multimodal: bool) -> Result<i64> {
        let body = json!({ "model_name": model_name, "is_multimodal": is_multimodal });
        let created: IdEnvelope<i64> = self
            .send(Method::POST, &format!("/providers/{provider_id}/models"), Some(body))
            .await?;
        Ok(created.id)
    }

    pub async fn delete_model(&self, model_id: i64) -> Result<()> {
        self.send::<Ack>(Method::DELETE, &format!("/models/{model_id}"), None)
            .await
            .map(|_| ())
    }

    pub async fn set_default_model(&self, model_id: i64) -> Result<()> {
        self.send::<Ack>(Method::POST, &format!("/models/{model_id}/set_default"), None)
            .await
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // System prompts
    // -----------------------------------------------------------------------

    pub async fn list_prompts(&self) -> Result<Vec<SystemPrompt>> {
        Ok(self.get::<PromptsEnvelope>("/prompts").await?.prompts)
    }

    pub async fn get_prompt(&self, id: i64) -> Result<SystemPrompt> {
        self.get(&format!("/prompts/{id}")).await
    }

    pub async fn active_prompt(&self) -> Result<SystemPrompt> {
        self.get("/prompts/active").await
    }

    pub async fn create_prompt(&self, name: &str, text: &str) -> Result<i64> {
        let created: IdEnvelope<i64> = self
            .send(Method::POST, "/prompts", Some(json!({ "name": name, "text": text })))
            .await?;
        Ok(created.id)
    }

    pub async fn update_prompt(&self, id: i64, name: &str, text: &str) -> Result<()> {
        self.send::<Ack>(
            Method::PUT,
            &format!("/prompts/{id}"),
            Some(json!({ "name": name, "text": text })),
        )
        .await
        .map(|_| ())
    }

    /// The server refuses to delete the prompt named `default` (HTTP 403).
    pub async fn delete_prompt(&self, id: i64) -> Result<()> {
        self.send::<Ack>(Method::DELETE, &format!("/prompts/{id}"), None)
            .await
            .map(|_| ())
    }

    pub async fn activate_prompt(&self, id: i64) -> Result<()> {
        self.send::<Ack>(Method::POST, &format!("/prompts/{id}/activate"), None)
            .await
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.get::<ProjectsEnvelope>("/projects").await?.projects)
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        self.get(&format!("/projects/{}", encode_component(id))).await
    }

    pub async fn create_project(&self, input: &ProjectInput) -> Result<String> {
        let created: IdEnvelope<String> = self
            .send(Method::POST, "/projects", Some(Self::body(input)?))
            .await?;
        Ok(created.id)
    }

    pub async fn update_project(&self, id: &str, input: &ProjectInput) -> Result<()> {
        self.send::<Ack>(
            Method::PUT,
            &format!("/projects/{}", encode_component(id)),
            Some(Self::body(input)?),
        )
        .await
        .map(|_| ())
    }

    pub async fn delete_project(&self, id: &str) -> Result<()> {
        self.send::<Ack>(Method::DELETE, &format!("/projects/{}", encode_component(id)), None)
            .await
            .map(|_| ())
    }
}

/// Characters left as-is in a path segment or query value.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_component_passes_uuid() {
        let id = "3f2a9c1e-0b7d-4e55-9a10-2c6f8d1e4b3a";
        assert_eq!(encode_component(id), id);
    }

    #[test]
    fn test_encode_component_escapes_reserved() {
        assert_eq!(encode_component("a b/c?d"), "a%20b%2Fc%3Fd");
    }

    #[test]
    fn test_error_detail_parse() {
        let d: ErrorDetail = serde_json::from_str(r#"{"detail":"Prompt not found"}"#).unwrap();
        assert_eq!(d.detail, "Prompt not found");
    }
}
