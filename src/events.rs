//! Push-channel event taxonomy.
//!
//! The server sends one JSON object per WebSocket text frame, discriminated
//! by its `type` field. The set of kinds is closed; frames with an unknown
//! `type` fail to decode and are skipped by the channel.

use serde::{Deserialize, Serialize};

use crate::model::Role;

/// An out-of-band update pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    ConversationCreated {
        conversation_id: String,
    },
    ConversationDeleted {
        conversation_id: String,
    },
    /// A message was persisted. After a regeneration the server omits
    /// `message_id` because the existing message was updated in place.
    MessageAdded {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    /// A message's content was replaced. The server does not always include
    /// the conversation id, so the message is located by its id.
    MessageEdited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    SummaryUpdated {
        conversation_id: String,
        summary: String,
    },
}

impl LiveEvent {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The conversation the event refers to, when the server supplied it.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            LiveEvent::ConversationCreated { conversation_id }
            | LiveEvent::ConversationDeleted { conversation_id }
            | LiveEvent::MessageAdded { conversation_id, .. }
            | LiveEvent::SummaryUpdated { conversation_id, .. } => Some(conversation_id),
            LiveEvent::MessageEdited { conversation_id, .. } => conversation_id.as_deref(),
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveEvent::ConversationCreated { .. } => "conversation_created",
            LiveEvent::ConversationDeleted { .. } => "conversation_deleted",
            LiveEvent::MessageAdded { .. } => "message_added",
            LiveEvent::MessageEdited { .. } => "message_edited",
            LiveEvent::SummaryUpdated { .. } => "summary_updated",
        }
    }
}

/// What subscribers of the live channel receive.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    /// The socket (re)opened. Anything may have been missed while it was
    /// down, so subscribers should reload rather than resume.
    Connected { reconnect: bool },
    /// The socket closed; a retry is scheduled.
    Disconnected,
    Event(LiveEvent),
}
