//! Wire and domain types shared by the REST client, the reconciler and the
//! conversation list.

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Stored in history by the server; never shown in the message pane.
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Attachment as stored by the server and returned in conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub attachment_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// A file attached to a message: raw bytes before upload, a stored
/// reference afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Pending {
        name: String,
        mime_type: String,
        data: Bytes,
    },
    Stored {
        name: String,
        mime_type: String,
        attachment_id: String,
    },
}

impl Attachment {
    /// Build a pending attachment from in-memory bytes.
    pub fn pending(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Attachment::Pending {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Attachment::Pending {
            name,
            mime_type,
            data: Bytes::from(data),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Attachment::Pending { name, .. } | Attachment::Stored { name, .. } => name,
        }
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Attachment::Pending { mime_type, .. } | Attachment::Stored { mime_type, .. } => mime_type,
        }
    }

    /// The server-side id, once the attachment has been persisted.
    pub fn attachment_id(&self) -> Option<&str> {
        match self {
            Attachment::Stored { attachment_id, .. } => Some(attachment_id),
            Attachment::Pending { .. } => None,
        }
    }
}

impl From<StoredAttachment> for Attachment {
    fn from(a: StoredAttachment) -> Self {
        Attachment::Stored {
            name: a.file_name,
            mime_type: a.file_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            attachment_id: a.attachment_id,
        }
    }
}

/// One message of a fetched conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub message_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<f64>,
    #[serde(default)]
    pub attachments: Vec<StoredAttachment>,
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Row of the conversation list as served by `GET /conversations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub created_at: Option<f64>,
    /// Unix seconds.
    #[serde(default)]
    pub last_updated: Option<f64>,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(default)]
    pub last_message_at: Option<f64>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ConversationSummary {
    /// A bare entry for a conversation the list has heard of only by event.
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            summary: None,
            created_at: None,
            last_updated: None,
            message_count: None,
            last_message_at: None,
            project_id: None,
        }
    }

    /// Most recent activity, used to order the list newest first.
    pub fn activity(&self) -> f64 {
        self.last_message_at
            .or(self.last_updated)
            .or(self.created_at)
            .unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Settings: providers, models, prompts, projects
// ---------------------------------------------------------------------------

/// An OpenAI-compatible endpoint the server forwards generations to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Body of `POST /providers` and `PUT /providers/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInput {
    pub name: String,
    pub host: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub api_key: String,
}

impl ProviderInput {
    /// Input with the server's default sampling parameters.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            temperature: 1.0,
            max_tokens: 4096,
            top_p: 0.95,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderModel {
    pub id: i64,
    pub model_name: String,
    #[serde(default)]
    pub provider_id: Option<i64>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_multimodal: bool,
}

/// A named, reusable system prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: i64,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInput {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
}
