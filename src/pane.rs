//! Display-side state of the open conversation: rendered messages, the
//! affordances bound to them, scroll position and notifications.

use tracing::warn;

use crate::model::{Attachment, HistoryMessage, Role};
use crate::render::Renderer;

/// Local handle of a message in the pane, stable for the pane's lifetime and
/// available before the server has assigned a durable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey(u64);

/// An action a user can take on a message. Every one of them needs the
/// durable id, so none is available while a message is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affordance {
    Regenerate,
    Edit,
    CopyRaw,
}

/// An affordance wired to a specific durable message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAction {
    pub affordance: Affordance,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub key: MessageKey,
    pub message_id: Option<String>,
    pub role: Role,
    /// Raw source (accumulated markdown for assistant replies).
    pub source: String,
    /// Output of the renderer for `source`.
    pub rendered: String,
    pub attachments: Vec<Attachment>,
    pub actions: Vec<BoundAction>,
}

impl RenderedMessage {
    fn affordances(role: Role) -> &'static [Affordance] {
        match role {
            Role::Assistant => &[Affordance::Regenerate, Affordance::Edit, Affordance::CopyRaw],
            Role::User => &[Affordance::Edit, Affordance::CopyRaw],
            Role::System => &[],
        }
    }

    /// Bind `id` and rewire every affordance to it. Returns `false` when the
    /// message was already bound to `id` (nothing changed).
    pub fn bind_id(&mut self, id: &str) -> bool {
        if self.message_id.as_deref() == Some(id) {
            return false;
        }
        if let Some(old) = &self.message_id {
            warn!(old = %old, new = %id, "rebinding message to a different durable id");
        }
        self.message_id = Some(id.to_string());
        self.actions = Self::affordances(self.role)
            .iter()
            .map(|&affordance| BoundAction {
                affordance,
                message_id: id.to_string(),
            })
            .collect();
        true
    }

    pub fn action(&self, affordance: Affordance) -> Option<&BoundAction> {
        self.actions.iter().find(|a| a.affordance == affordance)
    }
}

// ---------------------------------------------------------------------------
// Viewport
// ---------------------------------------------------------------------------

/// Tracks whether the pane should follow new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewport {
    pinned: bool,
    auto_scrolls: u64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            pinned: true,
            auto_scrolls: 0,
        }
    }
}

impl Viewport {
    /// Whether the view is at the bottom and follows new content.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// How many times content growth scrolled the view.
    pub fn auto_scrolls(&self) -> u64 {
        self.auto_scrolls
    }

    /// Report a manual scroll. Leaving the bottom stops auto-scroll until the
    /// user comes back or the current stream ends.
    pub fn user_scrolled(&mut self, at_bottom: bool) {
        self.pinned = at_bottom;
    }

    /// Content grew; scroll only if the view was pinned before the update.
    pub fn content_grew(&mut self, was_pinned: bool) {
        if was_pinned {
            self.auto_scrolls += 1;
            self.pinned = true;
        }
    }

    /// Resume following at the end of a stream.
    pub fn rearm(&mut self) {
        self.pinned = true;
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub message: String,
}

/// Dismissible, user-visible error notices.
#[derive(Debug, Clone, Default)]
pub struct Notifications {
    items: Vec<Notification>,
    next_id: u64,
}

impl Notifications {
    pub fn push(&mut self, message: impl Into<String>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.items.push(Notification {
            id,
            message: message.into(),
        });
        id
    }

    /// Remove a notification. Returns `false` if it was already gone.
    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        self.items.len() != before
    }

    pub fn active(&self) -> &[Notification] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Message pane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MessagePane {
    conversation_id: Option<String>,
    title: Option<String>,
    messages: Vec<RenderedMessage>,
    viewport: Viewport,
    next_key: u64,
}

impl MessagePane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn is_showing(&self, conversation_id: &str) -> bool {
        self.conversation_id.as_deref() == Some(conversation_id)
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn set_title(&mut self, title: Option<String>) {
        self.title = title;
    }

    pub fn messages(&self) -> &[RenderedMessage] {
        &self.messages
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut Viewport {
        &mut self.viewport
    }

    /// Switch to `conversation_id` with an empty history.
    pub fn open(&mut self, conversation_id: impl Into<String>) {
        self.conversation_id = Some(conversation_id.into());
        self.title = None;
        self.messages.clear();
        self.viewport = Viewport::default();
    }

    /// Replace the pane with a fetched history. System messages are skipped.
    pub fn load(
        &mut self,
        conversation_id: impl Into<String>,
        history: Vec<HistoryMessage>,
        renderer: &dyn Renderer,
    ) {
        let title = self.title.take();
        let conversation_id = conversation_id.into();
        let same = self.is_showing(&conversation_id);
        self.open(conversation_id);
        if same {
            self.title = title;
        }
        for m in history.into_iter().filter(|m| m.role != Role::System) {
            let attachments = m.attachments.into_iter().map(Attachment::from).collect();
            let key = self.push(m.role, m.content, attachments, renderer);
            if let Some(msg) = self.get_mut(key) {
                msg.bind_id(&m.message_id);
            }
        }
    }

    /// Show nothing.
    pub fn clear(&mut self) {
        self.conversation_id = None;
        self.title = None;
        self.messages.clear();
        self.viewport = Viewport::default();
    }

    /// Append a message without a durable id.
    pub fn push(
        &mut self,
        role: Role,
        source: String,
        attachments: Vec<Attachment>,
        renderer: &dyn Renderer,
    ) -> MessageKey {
        self.next_key += 1;
        let key = MessageKey(self.next_key);
        let rendered = renderer.render(&source);
        self.messages.push(RenderedMessage {
            key,
            message_id: None,
            role,
            source,
            rendered,
            attachments,
            actions: Vec::new(),
        });
        key
    }

    pub fn get(&self, key: MessageKey) -> Option<&RenderedMessage> {
        self.messages.iter().find(|m| m.key == key)
    }

    pub fn get_mut(&mut self, key: MessageKey) -> Option<&mut RenderedMessage> {
        self.messages.iter_mut().find(|m| m.key == key)
    }

    pub fn find_by_id(&self, message_id: &str) -> Option<&RenderedMessage> {
        self.messages
            .iter()
            .find(|m| m.message_id.as_deref() == Some(message_id))
    }

    pub fn last(&self) -> Option<&RenderedMessage> {
        self.messages.last()
    }

    pub fn remove(&mut self, key: MessageKey) -> Option<RenderedMessage> {
        let idx = self.messages.iter().position(|m| m.key == key)?;
        Some(self.messages.remove(idx))
    }

    /// Replace a message's source and re-render it. Returns `false` if the
    /// message is not in the pane.
    pub fn set_source(&mut self, key: MessageKey, source: &str, renderer: &dyn Renderer) -> bool {
        match self.get_mut(key) {
            Some(msg) => {
                if msg.source != source {
                    msg.source = source.to_string();
                }
                msg.rendered = renderer.render(source);
                true
            }
            None => false,
        }
    }
}
