//! # Stream Reconciler
//!
//! Turns the byte stream of one assistant reply into a single message in
//! the [`MessagePane`], visible as soon as partial content exists, and binds
//! the durable id the server assigns once the message is persisted.
//!
//! ## Guarantees
//! - The rendered content is always `render(buffer)` over the whole buffer,
//!   never an incremental diff.
//! - At most one [`StreamSession`] per conversation: a second
//!   [`begin_stream`](StreamReconciler::begin_stream) fails with
//!   [`ClientError::StreamActive`] until the first session's guard is released.
//! - Partial output is never rolled back on failure.
//! - [`attach_durable_id`](StreamReconciler::attach_durable_id) is idempotent.
//!
//! ## NOT Responsible For
//! - Performing the HTTP request (the session pump does that)
//! - Confirming that the server actually stopped generating after a cancel

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::model::{Attachment, Role};
use crate::pane::{MessageKey, MessagePane, Notifications};
use crate::render::Renderer;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between the UI side and the pump.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Out-of-band request asking the server to stop generating.
///
/// Implemented by the live channel. Delivery is best-effort and the server
/// never acknowledges it.
pub trait StopSignal {
    /// Returns `true` if the request was handed to an open connection.
    fn request_stop(&self) -> bool;
}

/// Used when no live channel is available.
pub struct NoStopSignal;

impl StopSignal for NoStopSignal {
    fn request_stop(&self) -> bool {
        false
    }
}

/// Result of [`StreamReconciler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// The local request was aborted and the submission lock released.
    pub local: bool,
    /// A stop request was sent over the live channel. Sent, not confirmed.
    pub remote_signal_sent: bool,
}

// ---------------------------------------------------------------------------
// UTF-8 chunk decoding
// ---------------------------------------------------------------------------

/// Decodes a byte stream whose chunk boundaries may split multi-byte
/// characters. Incomplete trailing sequences are held for the next chunk;
/// invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

// ---------------------------------------------------------------------------
// Guard and session
// ---------------------------------------------------------------------------

type ActiveSet = Arc<Mutex<HashSet<String>>>;

/// Holds the per-conversation submission lock. Released on drop.
#[derive(Debug)]
pub struct StreamGuard {
    conversation_id: String,
    active: ActiveSet,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.conversation_id);
    }
}

/// What a session streams into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// A new reply to a freshly submitted prompt.
    Reply,
    /// Replacement content for an existing assistant message.
    Regenerate { message_id: String },
}

/// One in-flight assistant response.
#[derive(Debug)]
pub struct StreamSession {
    conversation_id: String,
    placeholder: MessageKey,
    kind: StreamKind,
    buffer: String,
    decoder: ChunkDecoder,
    cancel: CancelHandle,
    durable_id: Option<String>,
    guard: Option<StreamGuard>,
}

impl StreamSession {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn placeholder(&self) -> MessageKey {
        self.placeholder
    }

    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn durable_id(&self) -> Option<&str> {
        self.durable_id.as_deref()
    }

    /// Clone of the cancellation handle, for the task pumping the stream.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// `false` once the stream ended, failed or was cancelled.
    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Applies stream progress and durable ids to a [`MessagePane`].
pub struct StreamReconciler {
    active: ActiveSet,
    renderer: Arc<dyn Renderer>,
}

impl StreamReconciler {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            renderer,
        }
    }

    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }

    /// Whether a session currently holds the lock for `conversation_id`.
    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.active
            .lock()
            .map(|s| s.contains(conversation_id))
            .unwrap_or(false)
    }

    fn acquire(&self, conversation_id: &str) -> Result<StreamGuard> {
        let mut set = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(conversation_id.to_string()) {
            return Err(ClientError::StreamActive {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(StreamGuard {
            conversation_id: conversation_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    /// Start a reply: show the user's message at once, then an empty
    /// assistant placeholder without an id.
    pub fn begin_stream(
        &self,
        pane: &mut MessagePane,
        conversation_id: &str,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> Result<StreamSession> {
        let guard = self.acquire(conversation_id)?;
        if !pane.is_showing(conversation_id) {
            pane.open(conversation_id);
        }
        pane.push(Role::User, prompt.to_string(), attachments, self.renderer());
        let placeholder = pane.push(Role::Assistant, String::new(), Vec::new(), self.renderer());
        pane.viewport_mut().rearm();
        pane.viewport_mut().content_grew(true);

        info!(conversation_id, "reply stream started");
        Ok(StreamSession {
            conversation_id: conversation_id.to_string(),
            placeholder,
            kind: StreamKind::Reply,
            buffer: String::new(),
            decoder: ChunkDecoder::default(),
            cancel: CancelHandle::new(),
            durable_id: None,
            guard: Some(guard),
        })
    }

    /// Start regenerating `message_id`. Its current content stays visible
    /// until the first chunk arrives.
    pub fn begin_regenerate(
        &self,
        pane: &mut MessagePane,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<StreamSession> {
        let placeholder = match pane.find_by_id(message_id) {
            Some(m) if pane.is_showing(conversation_id) => m.key,
            _ => {
                return Err(ClientError::UnknownMessage {
                    message_id: message_id.to_string(),
                })
            }
        };
        let guard = self.acquire(conversation_id)?;
        info!(conversation_id, message_id, "regeneration stream started");
        Ok(StreamSession {
            conversation_id: conversation_id.to_string(),
            placeholder,
            kind: StreamKind::Regenerate {
                message_id: message_id.to_string(),
            },
            buffer: String::new(),
            decoder: ChunkDecoder::default(),
            cancel: CancelHandle::new(),
            durable_id: Some(message_id.to_string()),
            guard: Some(guard),
        })
    }

    /// Append a chunk and re-render the placeholder from the whole buffer.
    /// Returns `true` if the pane changed.
    pub fn on_chunk_received(
        &self,
        pane: &mut MessagePane,
        session: &mut StreamSession,
        bytes: &[u8],
    ) -> bool {
        if !session.is_active() {
            debug!(conversation_id = %session.conversation_id, "chunk after stream finished, ignored");
            return false;
        }
        let text = session.decoder.push(bytes);
        if text.is_empty() {
            return false;
        }
        session.buffer.push_str(&text);
        self.render_into(pane, session)
    }

    fn render_into(&self, pane: &mut MessagePane, session: &StreamSession) -> bool {
        if !pane.is_showing(&session.conversation_id) {
            return false;
        }
        let was_pinned = pane.viewport().is_pinned();
        if !pane.set_source(session.placeholder, &session.buffer, self.renderer()) {
            return false;
        }
        pane.viewport_mut().content_grew(was_pinned);
        true
    }

    /// Normal end of stream. Releases the submission lock.
    pub fn on_stream_end(&self, pane: &mut MessagePane, session: &mut StreamSession) {
        if !session.is_active() {
            return;
        }
        let tail = session.decoder.finish();
        if !tail.is_empty() {
            session.buffer.push_str(&tail);
            self.render_into(pane, session);
        }
        session.guard = None;
        if pane.is_showing(&session.conversation_id) {
            pane.viewport_mut().rearm();
        }
        info!(
            conversation_id = %session.conversation_id,
            chars = session.buffer.chars().count(),
            "reply stream finished"
        );
    }

    /// Failed stream. Cancellation is silent; anything else raises a
    /// dismissible notification. Partial output stays in place either way.
    /// Returns the notification id, if one was raised.
    pub fn on_stream_error(
        &self,
        pane: &mut MessagePane,
        notifications: &mut Notifications,
        session: &mut StreamSession,
        error: &ClientError,
    ) -> Option<u64> {
        if session.is_cancelled() || error.is_cancellation() {
            self.finish_cancelled(pane, session);
            return None;
        }
        if !session.is_active() {
            return None;
        }
        warn!(conversation_id = %session.conversation_id, error = %error, "reply stream failed");
        session.guard = None;
        if pane.is_showing(&session.conversation_id) {
            pane.viewport_mut().rearm();
        }
        Some(notifications.push(format!("Generation failed: {error}")))
    }

    /// Abort the stream locally and ask the server to stop over `stop`.
    pub fn cancel(
        &self,
        pane: &mut MessagePane,
        session: &mut StreamSession,
        stop: &dyn StopSignal,
    ) -> CancelOutcome {
        let was_active = session.is_active();
        session.cancel.cancel();
        let remote_signal_sent = was_active && stop.request_stop();
        self.finish_cancelled(pane, session);
        info!(
            conversation_id = %session.conversation_id,
            remote_signal_sent,
            "reply stream cancelled"
        );
        CancelOutcome {
            local: was_active,
            remote_signal_sent,
        }
    }

    fn finish_cancelled(&self, pane: &mut MessagePane, session: &mut StreamSession) {
        session.cancel.cancel();
        if session.guard.take().is_none() {
            return;
        }
        if session.kind == StreamKind::Reply && session.buffer.is_empty() {
            pane.remove(session.placeholder);
        }
        if pane.is_showing(&session.conversation_id) {
            pane.viewport_mut().rearm();
        }
    }

    /// Bind a durable id to a pane element and rewire its affordances.
    /// Returns `false` when nothing changed.
    pub fn attach_durable_id(&self, pane: &mut MessagePane, key: MessageKey, id: &str) -> bool {
        match pane.get_mut(key) {
            Some(msg) => msg.bind_id(id),
            None => false,
        }
    }

    /// Bind a durable id to the message a session is (or was) rendering.
    pub fn attach_to_session(
        &self,
        pane: &mut MessagePane,
        session: &mut StreamSession,
        id: &str,
    ) -> bool {
        let session_changed = session.durable_id.as_deref() != Some(id);
        session.durable_id = Some(id.to_string());
        let pane_changed = if pane.is_showing(&session.conversation_id) {
            self.attach_durable_id(pane, session.placeholder, id)
        } else {
            false
        };
        session_changed || pane_changed
    }
}
