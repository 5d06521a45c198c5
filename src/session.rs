//! # Session Context
//!
//! Owns everything one chat client session needs: the REST client, the live
//! channel, the stream reconciler and the visible state ([`ChatState`]).
//!
//! ## Responsibility
//! - Pump generation streams into the pane on background tasks
//! - Apply live-channel updates to the pane and the conversation list
//! - Run the follow-up fetches an update asks for (list refresh, reload)
//! - Bump a revision counter whenever visible state changes
//!
//! ## Guarantees
//! - State lives behind one mutex, touched only in short critical sections;
//!   the lock is never held across an `.await`.
//! - Live updates are applied one at a time, in arrival order.
//! - A finished or cancelled pump can never touch a newer stream for the
//!   same conversation.
//!
//! ## NOT Responsible For
//! - Drawing anything (frontends read snapshots and watch [`changes`](SessionContext::changes))

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ByteStream, ChatRequest, RegenerateRequest};
use crate::bus::{EventBus, Subscription};
use crate::channel::{ChannelState, LiveChannel, Visibility};
use crate::config::ClientConfig;
use crate::conversations::ConversationList;
use crate::error::{ClientError, Result};
use crate::events::{LiveEvent, LiveUpdate};
use crate::model::{Attachment, ConversationSummary, HistoryMessage, Role};
use crate::pane::{MessagePane, Notification, Notifications, RenderedMessage};
use crate::reconciler::{CancelHandle, CancelOutcome, StopSignal, StreamReconciler, StreamSession};
use crate::render::{FenceBalancingRenderer, Renderer};

/// Work a live update leaves for the session to do after the state lock is
/// released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    /// Reload the conversation list from the server.
    RefreshList,
    /// Reload the displayed conversation's history.
    ReloadConversation(String),
    /// Fetch the history and bind ids to messages still missing one.
    BackfillIds(String),
    /// Stop the stream targeting a conversation.
    CancelStream(String),
}

/// How a pumped stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    /// The stream failed; `notification` is the id of the raised notice.
    Failed { notification: Option<u64> },
}

/// Identifies one stream among all streams ever started in a [`ChatState`].
#[derive(Debug, Clone)]
pub struct StreamTicket {
    seq: u64,
    conversation_id: String,
    cancel: CancelHandle,
}

impl StreamTicket {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

#[derive(Debug)]
struct TrackedStream {
    seq: u64,
    session: StreamSession,
}

// ---------------------------------------------------------------------------
// ChatState
// ---------------------------------------------------------------------------

/// Everything a frontend displays, plus the stream sessions feeding it.
#[derive(Default)]
pub struct ChatState {
    pane: MessagePane,
    conversations: ConversationList,
    notifications: Notifications,
    streams: HashMap<String, TrackedStream>,
    next_seq: u64,
}

fn push_unique(out: &mut Vec<Followup>, f: Followup) {
    if !out.contains(&f) {
        out.push(f);
    }
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pane(&self) -> &MessagePane {
        &self.pane
    }

    pub fn pane_mut(&mut self) -> &mut MessagePane {
        &mut self.pane
    }

    pub fn conversations(&self) -> &ConversationList {
        &self.conversations
    }

    pub fn conversations_mut(&mut self) -> &mut ConversationList {
        &mut self.conversations
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn notifications_mut(&mut self) -> &mut Notifications {
        &mut self.notifications
    }

    /// Latest stream started for `conversation_id`, finished or not.
    pub fn stream(&self, conversation_id: &str) -> Option<&StreamSession> {
        self.streams.get(conversation_id).map(|t| &t.session)
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.stream(conversation_id).is_some_and(|s| s.is_active())
    }

    fn track(&mut self, session: StreamSession) -> StreamTicket {
        self.next_seq += 1;
        let ticket = StreamTicket {
            seq: self.next_seq,
            conversation_id: session.conversation_id().to_string(),
            cancel: session.cancel_handle(),
        };
        self.streams.insert(
            ticket.conversation_id.clone(),
            TrackedStream {
                seq: ticket.seq,
                session,
            },
        );
        ticket
    }

    fn tracked_mut(
        &mut self,
        ticket: &StreamTicket,
    ) -> Option<(&mut MessagePane, &mut Notifications, &mut StreamSession)> {
        let tracked = self.streams.get_mut(&ticket.conversation_id)?;
        if tracked.seq != ticket.seq {
            return None;
        }
        Some((&mut self.pane, &mut self.notifications, &mut tracked.session))
    }

    /// Start a reply stream into `conversation_id`.
    pub fn begin_stream(
        &mut self,
        reconciler: &StreamReconciler,
        conversation_id: &str,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> Result<StreamTicket> {
        let session = reconciler.begin_stream(&mut self.pane, conversation_id, prompt, attachments)?;
        Ok(self.track(session))
    }

    /// Start regenerating `message_id` in the displayed conversation. Also
    /// returns the user prompt the message answers.
    pub fn begin_regenerate(
        &mut self,
        reconciler: &StreamReconciler,
        message_id: &str,
    ) -> Result<(StreamTicket, String)> {
        let unknown = || ClientError::UnknownMessage {
            message_id: message_id.to_string(),
        };
        let conversation_id = self.pane.conversation_id().ok_or_else(unknown)?.to_string();
        let idx = self
            .pane
            .messages()
            .iter()
            .position(|m| m.message_id.as_deref() == Some(message_id) && m.role == Role::Assistant)
            .ok_or_else(unknown)?;
        let prompt = self.pane.messages()[..idx]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.source.clone())
            .unwrap_or_default();
        let session = reconciler.begin_regenerate(&mut self.pane, &conversation_id, message_id)?;
        Ok((self.track(session), prompt))
    }

    /// Feed one body chunk. Returns `true` if the pane changed.
    pub fn apply_chunk(&mut self, reconciler: &StreamReconciler, ticket: &StreamTicket, bytes: &[u8]) -> bool {
        match self.tracked_mut(ticket) {
            Some((pane, _, session)) => reconciler.on_chunk_received(pane, session, bytes),
            None => false,
        }
    }

    pub fn finish_stream(&mut self, reconciler: &StreamReconciler, ticket: &StreamTicket) {
        if let Some((pane, _, session)) = self.tracked_mut(ticket) {
            reconciler.on_stream_end(pane, session);
        }
    }

    pub fn fail_stream(
        &mut self,
        reconciler: &StreamReconciler,
        ticket: &StreamTicket,
        error: &ClientError,
    ) -> StreamOutcome {
        match self.tracked_mut(ticket) {
            Some((pane, notifications, session)) => {
                let cancelled = session.is_cancelled() || error.is_cancellation();
                let notification = reconciler.on_stream_error(pane, notifications, session, error);
                if cancelled {
                    StreamOutcome::Cancelled
                } else {
                    StreamOutcome::Failed { notification }
                }
            }
            None if error.is_cancellation() || ticket.cancel.is_cancelled() => StreamOutcome::Cancelled,
            None => StreamOutcome::Failed { notification: None },
        }
    }

    /// Cancel the stream for `conversation_id`, asking the server to stop
    /// through `stop`.
    pub fn cancel_stream(
        &mut self,
        reconciler: &StreamReconciler,
        conversation_id: &str,
        stop: &dyn StopSignal,
    ) -> CancelOutcome {
        match self.streams.get_mut(conversation_id) {
            Some(tracked) => reconciler.cancel(&mut self.pane, &mut tracked.session, stop),
            None => CancelOutcome {
                local: false,
                remote_signal_sent: false,
            },
        }
    }

    /// Show a fetched history, titled from the conversation list.
    pub fn open_history(&mut self, renderer: &dyn Renderer, conversation_id: &str, history: Vec<HistoryMessage>) {
        self.pane.load(conversation_id, history, renderer);
        if self.pane.title().is_none() {
            let title = self.conversations.get(conversation_id).and_then(|c| c.summary.clone());
            self.pane.set_title(title);
        }
    }

    /// Reload the displayed conversation unless a stream is writing into it.
    /// Returns `true` if the pane was replaced.
    pub fn reload_history(
        &mut self,
        renderer: &dyn Renderer,
        conversation_id: &str,
        history: Vec<HistoryMessage>,
    ) -> bool {
        if !self.pane.is_showing(conversation_id) || self.is_streaming(conversation_id) {
            return false;
        }
        self.open_history(renderer, conversation_id, history);
        true
    }

    /// Whether the displayed conversation is settled but still has messages
    /// without a durable id (typically the optimistic user message).
    pub fn needs_backfill(&self, conversation_id: &str) -> bool {
        self.pane.is_showing(conversation_id)
            && !self.is_streaming(conversation_id)
            && self.pane.last().is_some_and(|m| m.message_id.is_some())
            && self.pane.messages().iter().any(|m| m.message_id.is_none())
    }

    /// Bind ids from `history` to unbound pane messages, scanning both in
    /// order and pairing a message only with a record of the same role and
    /// content. Replies the server never stored (failed turns) stay unbound,
    /// and an id already shown is never bound twice. Content is left alone.
    /// Returns how many were bound.
    pub fn backfill_ids(&mut self, conversation_id: &str, history: &[HistoryMessage]) -> usize {
        if !self.pane.is_showing(conversation_id) {
            return 0;
        }
        let mut cursor = 0;
        let mut pairs = Vec::new();
        for m in self.pane.messages() {
            let rest = &history[cursor..];
            let found = match &m.message_id {
                Some(id) => rest.iter().position(|h| &h.message_id == id).map(|pos| (pos, None)),
                None => rest
                    .iter()
                    .position(|h| {
                        h.role == m.role && h.content == m.source && self.pane.find_by_id(&h.message_id).is_none()
                    })
                    .map(|pos| (pos, Some(rest[pos].message_id.clone()))),
            };
            if let Some((pos, id)) = found {
                cursor += pos + 1;
                if let Some(id) = id {
                    pairs.push((m.key, id));
                }
            }
        }
        pairs
            .into_iter()
            .filter(|(key, id)| self.pane.get_mut(*key).is_some_and(|m| m.bind_id(id)))
            .count()
    }

    /// Apply one live-channel update. Returns the follow-up work it implies,
    /// without duplicates.
    ///
    /// Applying the same event twice leaves the state as applying it once.
    pub fn apply_live_update(&mut self, reconciler: &StreamReconciler, update: &LiveUpdate) -> Vec<Followup> {
        let mut out = Vec::new();
        match update {
            LiveUpdate::Disconnected => {}
            LiveUpdate::Connected { reconnect } => {
                push_unique(&mut out, Followup::RefreshList);
                if *reconnect {
                    self.conversations.mark_stale();
                    if let Some(id) = self.pane.conversation_id() {
                        if !self.is_streaming(id) {
                            push_unique(&mut out, Followup::ReloadConversation(id.to_string()));
                        }
                    }
                }
            }
            LiveUpdate::Event(event) => {
                if self.conversations.apply(event) {
                    push_unique(&mut out, Followup::RefreshList);
                }
                self.apply_event(reconciler, event, &mut out);
            }
        }
        out
    }

    fn apply_event(&mut self, reconciler: &StreamReconciler, event: &LiveEvent, out: &mut Vec<Followup>) {
        match event {
            LiveEvent::MessageAdded {
                conversation_id,
                message_id: Some(id),
                role,
            } => {
                if !self.pane.is_showing(conversation_id) || self.pane.find_by_id(id).is_some() {
                    return;
                }
                let wanted = (*role).unwrap_or(Role::Assistant);
                let awaiting = |m: &RenderedMessage| m.message_id.is_none() && m.role == wanted;
                let placeholder = self
                    .streams
                    .get(conversation_id.as_str())
                    .map(|t| t.session.placeholder());
                let target = placeholder
                    .and_then(|key| self.pane.get(key))
                    .filter(|m| awaiting(*m))
                    .or_else(|| self.pane.last().filter(|m| awaiting(*m)))
                    .map(|m| m.key);
                let Some(key) = target else {
                    debug!(%conversation_id, message_id = %id, "no message awaiting this id, pane untouched");
                    let unbound = self.pane.messages().iter().any(|m| m.message_id.is_none());
                    if unbound && !self.is_streaming(conversation_id) {
                        push_unique(out, Followup::BackfillIds(conversation_id.clone()));
                    }
                    return;
                };
                let bound = match self.streams.get_mut(conversation_id.as_str()) {
                    Some(t) if Some(key) == placeholder => {
                        reconciler.attach_to_session(&mut self.pane, &mut t.session, id)
                    }
                    _ => reconciler.attach_durable_id(&mut self.pane, key, id),
                };
                if bound {
                    debug!(%conversation_id, message_id = %id, "durable id bound");
                }
                if self.needs_backfill(conversation_id) {
                    push_unique(out, Followup::BackfillIds(conversation_id.clone()));
                }
            }
            LiveEvent::MessageAdded {
                conversation_id,
                message_id: None,
                ..
            } => {
                let awaiting = self.pane.last().is_some_and(|m| m.message_id.is_none());
                if self.pane.is_showing(conversation_id) && !awaiting && !self.is_streaming(conversation_id) {
                    push_unique(out, Followup::ReloadConversation(conversation_id.clone()));
                }
            }
            LiveEvent::MessageEdited {
                conversation_id,
                message_id,
                content,
                ..
            } => {
                let here = conversation_id.as_deref().map_or(true, |cid| self.pane.is_showing(cid));
                if here && self.pane.find_by_id(message_id).is_some() {
                    self.replace_content(reconciler.renderer(), message_id, content);
                } else {
                    debug!(%message_id, "edited message not shown, refreshing list");
                    self.conversations.mark_stale();
                    push_unique(out, Followup::RefreshList);
                }
            }
            LiveEvent::ConversationDeleted { conversation_id } => {
                if self.is_streaming(conversation_id) {
                    push_unique(out, Followup::CancelStream(conversation_id.clone()));
                }
                if self.pane.is_showing(conversation_id) {
                    info!(%conversation_id, "displayed conversation deleted");
                    self.pane.clear();
                }
            }
            LiveEvent::SummaryUpdated {
                conversation_id,
                summary,
            } => {
                if self.pane.is_showing(conversation_id) {
                    self.pane.set_title(Some(summary.clone()));
                }
            }
            LiveEvent::ConversationCreated { .. } => {}
        }
    }

    /// Replace a message's content. Returns `false` if it is not shown or
    /// already has that content.
    pub fn replace_content(&mut self, renderer: &dyn Renderer, message_id: &str, content: &str) -> bool {
        let key = match self.pane.find_by_id(message_id) {
            Some(m) if m.source != content => m.key,
            _ => return false,
        };
        self.pane.set_source(key, content, renderer)
    }
}

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

/// A running stream. Dropping the handle does not stop the stream.
#[derive(Debug)]
pub struct StreamHandle {
    conversation_id: String,
    cancel: CancelHandle,
    task: JoinHandle<StreamOutcome>,
}

impl StreamHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Local-only cancellation. Prefer [`SessionContext::cancel`], which
    /// also asks the server to stop.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the pump to finish.
    pub async fn finished(self) -> StreamOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "stream task did not complete");
                StreamOutcome::Failed { notification: None }
            }
        }
    }
}

struct SessionInner {
    api: ApiClient,
    channel: LiveChannel,
    reconciler: StreamReconciler,
    state: Mutex<ChatState>,
    revision: watch::Sender<u64>,
    client_id: String,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    fn cancel(&self, conversation_id: &str) -> CancelOutcome {
        let outcome = self
            .lock()
            .cancel_stream(&self.reconciler, conversation_id, &self.channel);
        if outcome.local {
            self.bump();
        }
        outcome
    }

    fn fail(&self, ticket: &StreamTicket, error: &ClientError) -> StreamOutcome {
        let outcome = self.lock().fail_stream(&self.reconciler, ticket, error);
        self.bump();
        outcome
    }

    async fn refresh_conversations(&self) -> Result<()> {
        let list = self.api.list_conversations(None).await?;
        debug!(count = list.len(), "conversation list refreshed");
        self.lock().conversations_mut().replace_all(list);
        self.bump();
        Ok(())
    }

    async fn reload(&self, conversation_id: &str) -> Result<()> {
        let history = self.api.fetch_conversation(conversation_id).await?;
        let replaced = self
            .lock()
            .reload_history(self.reconciler.renderer(), conversation_id, history);
        if replaced {
            self.bump();
        }
        Ok(())
    }

    async fn backfill(&self, conversation_id: &str) -> Result<()> {
        let history = self.api.fetch_conversation(conversation_id).await?;
        let bound = self.lock().backfill_ids(conversation_id, &history);
        if bound > 0 {
            debug!(%conversation_id, bound, "ids backfilled");
            self.bump();
        }
        Ok(())
    }

    async fn run_followup(&self, followup: Followup) {
        let result = match &followup {
            Followup::RefreshList => self.refresh_conversations().await,
            Followup::ReloadConversation(id) => self.reload(id).await,
            Followup::BackfillIds(id) => self.backfill(id).await,
            Followup::CancelStream(id) => {
                self.cancel(id);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, ?followup, "live update followup failed");
        }
    }

    async fn dispatch(self: Arc<Self>, mut updates: Subscription) {
        while let Some(update) = updates.recv().await {
            let followups = self.lock().apply_live_update(&self.reconciler, &update);
            self.bump();
            for followup in followups {
                self.run_followup(followup).await;
            }
        }
        debug!("live update dispatcher stopped");
    }

    /// Drive `open` then the body it yields into the stream named by
    /// `ticket`, stopping early on cancellation.
    async fn pump<F>(self: Arc<Self>, ticket: StreamTicket, open: F) -> StreamOutcome
    where
        F: Future<Output = Result<ByteStream>> + Send + 'static,
    {
        let cancel = ticket.cancel.clone();
        let opened = tokio::select! {
            r = open => r,
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(e) => return self.fail(&ticket, &e),
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.fail(&ticket, &ClientError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    let changed = self.lock().apply_chunk(&self.reconciler, &ticket, &bytes);
                    if changed {
                        self.bump();
                    }
                }
                Some(Err(e)) => return self.fail(&ticket, &e),
                None => break,
            }
        }
        let backfill = {
            let mut state = self.lock();
            state.finish_stream(&self.reconciler, &ticket);
            state.needs_backfill(&ticket.conversation_id)
        };
        self.bump();
        if backfill {
            if let Err(e) = self.backfill(&ticket.conversation_id).await {
                debug!(error = %e, "id backfill after stream failed");
            }
        }
        StreamOutcome::Completed
    }

    fn spawn_pump<F>(self: &Arc<Self>, ticket: StreamTicket, open: F) -> StreamHandle
    where
        F: Future<Output = Result<ByteStream>> + Send + 'static,
    {
        let conversation_id = ticket.conversation_id.clone();
        let cancel = ticket.cancel.clone();
        let task = tokio::spawn(Arc::clone(self).pump(ticket, open));
        StreamHandle {
            conversation_id,
            cancel,
            task,
        }
    }
}

/// Explicit system prompt, else the server's for the conversation, else the
/// configured default.
async fn resolve_system_prompt(api: &ApiClient, conversation_id: &str, explicit: Option<String>) -> String {
    if let Some(prompt) = explicit.filter(|p| !p.trim().is_empty()) {
        return prompt;
    }
    match api.system_prompt_for(Some(conversation_id)).await {
        Ok(prompt) if !prompt.trim().is_empty() => prompt,
        Ok(_) => api.config().default_system_prompt.clone(),
        Err(e) => {
            debug!(error = %e, "server system prompt unavailable, using default");
            api.config().default_system_prompt.clone()
        }
    }
}

/// One chat client session. Cloning shares the session.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl SessionContext {
    /// New session rendering replies with [`FenceBalancingRenderer`].
    pub fn new(config: ClientConfig) -> Self {
        Self::with_renderer(config, Arc::new(FenceBalancingRenderer))
    }

    pub fn with_renderer(config: ClientConfig, renderer: Arc<dyn Renderer>) -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        let channel = LiveChannel::from_config(&config, &client_id, EventBus::new());
        let (revision, _) = watch::channel(0u64);
        info!(%client_id, base_url = %config.base_url, "chat session created");
        Self {
            inner: Arc::new(SessionInner {
                api: ApiClient::new(config),
                channel,
                reconciler: StreamReconciler::new(renderer),
                state: Mutex::new(ChatState::new()),
                revision,
                client_id,
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// Connect the live channel and start applying its updates. Calling it
    /// again only re-triggers the connection.
    pub fn start(&self) {
        {
            let mut dispatcher = self.inner.dispatcher.lock().unwrap_or_else(|p| p.into_inner());
            if dispatcher.is_none() {
                let updates = self.inner.channel.subscribe();
                *dispatcher = Some(tokio::spawn(Arc::clone(&self.inner).dispatch(updates)));
            }
        }
        self.inner.channel.connect();
    }

    /// Stop the live channel and the update dispatcher. Running streams are
    /// left to finish.
    pub fn shutdown(&self) {
        self.inner.channel.shutdown();
        let handle = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Revision counter, bumped on every visible state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Raw live-channel updates, for frontends that show them.
    pub fn subscribe(&self) -> Subscription {
        self.inner.channel.subscribe()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.inner.channel.state()
    }

    pub fn on_visibility_change(&self, visibility: Visibility) -> bool {
        self.inner.channel.on_visibility_change(visibility)
    }

    /// Run `f` against the current state.
    pub fn with_state<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.inner.lock())
    }

    pub fn pane(&self) -> MessagePane {
        self.with_state(|s| s.pane().clone())
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.with_state(|s| s.conversations().entries().to_vec())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.with_state(|s| s.notifications().active().to_vec())
    }

    pub fn dismiss_notification(&self, id: u64) -> bool {
        let dismissed = self.inner.lock().notifications_mut().dismiss(id);
        if dismissed {
            self.inner.bump();
        }
        dismissed
    }

    /// Report a manual scroll of the message pane.
    pub fn scroll(&self, at_bottom: bool) {
        self.inner.lock().pane_mut().viewport_mut().user_scrolled(at_bottom);
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.inner.reconciler.is_streaming(conversation_id)
    }

    pub async fn refresh_conversations(&self) -> Result<()> {
        self.inner.refresh_conversations().await
    }

    /// Fetch a conversation and show it.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<()> {
        let history = self.inner.api.fetch_conversation(conversation_id).await?;
        self.inner
            .lock()
            .open_history(self.inner.reconciler.renderer(), conversation_id, history);
        self.inner.bump();
        Ok(())
    }

    /// Create an empty conversation on the server and show it.
    pub async fn new_conversation(&self) -> Result<String> {
        let id = self.inner.api.create_conversation(None).await?;
        {
            let mut state = self.inner.lock();
            state.conversations_mut().apply(&LiveEvent::ConversationCreated {
                conversation_id: id.clone(),
            });
            state.pane_mut().open(id.clone());
        }
        self.inner.bump();
        info!(conversation_id = %id, "conversation created");
        Ok(id)
    }

    /// Send a prompt to the displayed conversation (creating one if none is
    /// shown) and stream the reply into the pane.
    ///
    /// The user message and an empty reply appear before any network I/O for
    /// the reply starts. Fails with [`ClientError::StreamActive`] while a
    /// reply is still streaming into the same conversation.
    pub async fn submit(
        &self,
        prompt: &str,
        attachments: Vec<Attachment>,
        system_prompt: Option<String>,
    ) -> Result<StreamHandle> {
        let shown = self.with_state(|s| s.pane().conversation_id().map(str::to_string));
        let conversation_id = match shown {
            Some(id) => id,
            None => self.new_conversation().await?,
        };
        let ticket = self.inner.lock().begin_stream(
            &self.inner.reconciler,
            &conversation_id,
            prompt,
            attachments.clone(),
        )?;
        self.inner.bump();

        let api = self.inner.api.clone();
        let req = ChatRequest {
            conversation_id,
            message: prompt.to_string(),
            system_prompt: String::new(),
            client_id: self.inner.client_id.clone(),
            attachments,
        };
        let open = async move {
            let system_prompt = resolve_system_prompt(&api, &req.conversation_id, system_prompt).await;
            api.chat(ChatRequest { system_prompt, ..req }).await
        };
        Ok(self.inner.spawn_pump(ticket, open))
    }

    /// Stream a new version of assistant message `message_id` in place.
    pub async fn regenerate(&self, message_id: &str, system_prompt: Option<String>) -> Result<StreamHandle> {
        let (ticket, prompt) = self
            .inner
            .lock()
            .begin_regenerate(&self.inner.reconciler, message_id)?;
        self.inner.bump();

        let api = self.inner.api.clone();
        let req = RegenerateRequest {
            conversation_id: ticket.conversation_id.clone(),
            message_id: message_id.to_string(),
            message: prompt,
            system_prompt: String::new(),
            client_id: self.inner.client_id.clone(),
        };
        let open = async move {
            let system_prompt = resolve_system_prompt(&api, &req.conversation_id, system_prompt).await;
            api.regenerate(RegenerateRequest { system_prompt, ..req }).await
        };
        Ok(self.inner.spawn_pump(ticket, open))
    }

    /// Stop the stream for `conversation_id`: abort the local request and
    /// send a stop request over the live channel if it is open.
    pub fn cancel(&self, conversation_id: &str) -> CancelOutcome {
        self.inner.cancel(conversation_id)
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.inner.cancel(conversation_id);
        self.inner.api.delete_conversation(conversation_id).await?;
        let event = LiveUpdate::Event(LiveEvent::ConversationDeleted {
            conversation_id: conversation_id.to_string(),
        });
        self.inner.lock().apply_live_update(&self.inner.reconciler, &event);
        self.inner.bump();
        Ok(())
    }

    pub async fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.inner.api.rename_conversation(conversation_id, title).await?;
        let event = LiveUpdate::Event(LiveEvent::SummaryUpdated {
            conversation_id: conversation_id.to_string(),
            summary: title.to_string(),
        });
        self.inner.lock().apply_live_update(&self.inner.reconciler, &event);
        self.inner.bump();
        Ok(())
    }

    pub async fn edit_message(&self, message_id: &str, content: &str) -> Result<()> {
        self.inner.api.edit_message(message_id, content).await?;
        let changed = self
            .inner
            .lock()
            .replace_content(self.inner.reconciler.renderer(), message_id, content);
        if changed {
            self.inner.bump();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::Affordance;
    use crate::reconciler::NoStopSignal;
    use crate::render::PlainRenderer;

    fn reconciler() -> StreamReconciler {
        StreamReconciler::new(Arc::new(PlainRenderer))
    }

    fn added(conv: &str, id: Option<&str>) -> LiveUpdate {
        LiveUpdate::Event(LiveEvent::MessageAdded {
            conversation_id: conv.into(),
            message_id: id.map(Into::into),
            role: None,
        })
    }

    fn history_msg(id: &str, role: Role, content: &str) -> HistoryMessage {
        HistoryMessage {
            message_id: id.into(),
            conversation_id: Some("c1".into()),
            role,
            content: content.into(),
            content_type: None,
            created_at: None,
            attachments: vec![],
        }
    }

    fn loaded(r: &StreamReconciler) -> ChatState {
        let mut st = ChatState::new();
        st.open_history(
            r.renderer(),
            "c1",
            vec![
                history_msg("s0", Role::System, "be nice"),
                history_msg("u1", Role::User, "hi"),
                history_msg("a1", Role::Assistant, "hello"),
            ],
        );
        st
    }

    #[test]
    fn test_hi_there_scenario() {
        let r = reconciler();
        let mut st = ChatState::new();
        st.pane_mut().open("c1");
        let t = st.begin_stream(&r, "c1", "hello", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"Hi");
        st.apply_live_update(&r, &added("c1", Some("m42")));
        st.apply_chunk(&r, &t, b" there");
        st.apply_chunk(&r, &t, b"!");
        st.finish_stream(&r, &t);

        let assistants: Vec<_> = st
            .pane()
            .messages()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .collect();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].source, "Hi there!");
        assert_eq!(assistants[0].message_id.as_deref(), Some("m42"));
        assert_eq!(st.stream("c1").unwrap().durable_id(), Some("m42"));
    }

    #[test]
    fn test_message_added_binds_without_rerender() {
        let r = reconciler();
        let mut st = ChatState::new();
        let t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"partial");
        let before = st.pane().last().unwrap().rendered.clone();
        st.apply_live_update(&r, &added("c1", Some("m1")));
        let last = st.pane().last().unwrap();
        assert_eq!(last.rendered, before);
        assert_eq!(last.message_id.as_deref(), Some("m1"));
        assert!(last.action(Affordance::Regenerate).is_some());
    }

    #[test]
    fn test_message_added_twice_is_idempotent() {
        let r = reconciler();
        let mut st = ChatState::new();
        let t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"x");
        st.apply_live_update(&r, &added("c1", Some("m1")));
        let once = st.pane().messages().to_vec();
        st.apply_live_update(&r, &added("c1", Some("m1")));
        assert_eq!(st.pane().messages(), once.as_slice());
    }

    #[test]
    fn test_message_added_for_other_conversation_only_refreshes_list() {
        let r = reconciler();
        let mut st = ChatState::new();
        let t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"x");
        let followups = st.apply_live_update(&r, &added("c2", Some("m9")));
        assert_eq!(followups, vec![Followup::RefreshList]);
        assert!(st.pane().last().unwrap().message_id.is_none());
        assert_eq!(st.conversations().entries()[0].conversation_id, "c2");
    }

    #[test]
    fn test_message_added_when_nothing_awaits_leaves_pane() {
        let r = reconciler();
        let mut st = loaded(&r);
        let before = st.pane().messages().to_vec();
        st.apply_live_update(&r, &added("c1", Some("a2")));
        assert_eq!(st.pane().messages(), before.as_slice());
    }

    #[test]
    fn test_message_added_after_end_requests_backfill() {
        let r = reconciler();
        let mut st = ChatState::new();
        let t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"answer");
        st.finish_stream(&r, &t);
        let followups = st.apply_live_update(&r, &added("c1", Some("a1")));
        assert!(followups.contains(&Followup::BackfillIds("c1".into())));

        let history = vec![
            history_msg("s0", Role::System, "sys"),
            history_msg("u1", Role::User, "q"),
            history_msg("a1", Role::Assistant, "answer"),
        ];
        assert_eq!(st.backfill_ids("c1", &history), 1);
        assert_eq!(st.pane().messages()[0].message_id.as_deref(), Some("u1"));
        assert!(!st.needs_backfill("c1"));
    }

    #[test]
    fn test_assistant_id_never_lands_on_user_message() {
        let r = reconciler();
        let mut st = ChatState::new();
        let _t = st.begin_stream(&r, "c1", "hello", vec![]).unwrap();
        st.cancel_stream(&r, "c1", &NoStopSignal);
        assert_eq!(st.pane().last().unwrap().role, Role::User);

        let followups = st.apply_live_update(&r, &added("c1", Some("a1")));
        let user = st.pane().last().unwrap();
        assert!(user.message_id.is_none());
        assert!(user.actions.is_empty());
        assert!(followups.contains(&Followup::BackfillIds("c1".into())));

        let history = vec![
            history_msg("u1", Role::User, "hello"),
            history_msg("a1", Role::Assistant, ""),
        ];
        assert_eq!(st.backfill_ids("c1", &history), 1);
        assert_eq!(st.pane().last().unwrap().message_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_message_added_honours_event_role() {
        let r = reconciler();
        let mut st = ChatState::new();
        let t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"partial");
        let ev = LiveUpdate::Event(LiveEvent::MessageAdded {
            conversation_id: "c1".into(),
            message_id: Some("u9".into()),
            role: Some(Role::User),
        });
        st.apply_live_update(&r, &ev);
        assert!(st.pane().last().unwrap().message_id.is_none());
        assert!(st.stream("c1").unwrap().durable_id().is_none());
    }

    #[test]
    fn test_backfill_skips_replies_the_server_never_stored() {
        let r = reconciler();
        let mut st = ChatState::new();
        for (prompt, partial) in [("u1", "partial"), ("u2", "oops")] {
            let t = st.begin_stream(&r, "c1", prompt, vec![]).unwrap();
            st.apply_chunk(&r, &t, partial.as_bytes());
            st.fail_stream(&r, &t, &ClientError::transport("http://x/chat", "reset"));
        }
        let t = st.begin_stream(&r, "c1", "u3", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"answer");
        st.finish_stream(&r, &t);
        st.apply_live_update(&r, &added("c1", Some("A3")));

        let history = vec![
            history_msg("U1", Role::User, "u1"),
            history_msg("U2", Role::User, "u2"),
            history_msg("U3", Role::User, "u3"),
            history_msg("A3", Role::Assistant, "answer"),
        ];
        assert_eq!(st.backfill_ids("c1", &history), 3);

        let ids: Vec<_> = st
            .pane()
            .messages()
            .iter()
            .map(|m| (m.source.as_str(), m.message_id.as_deref()))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("u1", Some("U1")),
                ("partial", None),
                ("u2", Some("U2")),
                ("oops", None),
                ("u3", Some("U3")),
                ("answer", Some("A3")),
            ]
        );
        assert_eq!(st.pane().find_by_id("A3").unwrap().source, "answer");
        assert_eq!(st.backfill_ids("c1", &history), 0);
    }

    #[test]
    fn test_regenerated_message_added_without_id_reloads() {
        let r = reconciler();
        let mut st = loaded(&r);
        let (t, prompt) = st.begin_regenerate(&r, "a1").unwrap();
        assert_eq!(prompt, "hi");
        st.apply_chunk(&r, &t, b"better");
        assert!(st.apply_live_update(&r, &added("c1", None)).iter().all(|f| !matches!(f, Followup::ReloadConversation(_))));
        st.finish_stream(&r, &t);
        let followups = st.apply_live_update(&r, &added("c1", None));
        assert!(followups.contains(&Followup::ReloadConversation("c1".into())));
        assert_eq!(st.pane().find_by_id("a1").unwrap().source, "better");
    }

    #[test]
    fn test_regenerate_rejects_user_message() {
        let r = reconciler();
        let mut st = loaded(&r);
        let err = st.begin_regenerate(&r, "u1").unwrap_err();
        assert!(matches!(err, ClientError::UnknownMessage { .. }));
    }

    #[test]
    fn test_message_edited_replaces_content() {
        let r = reconciler();
        let mut st = loaded(&r);
        let ev = LiveUpdate::Event(LiveEvent::MessageEdited {
            conversation_id: None,
            message_id: "u1".into(),
            content: "hi there".into(),
            role: Some(Role::User),
        });
        st.apply_live_update(&r, &ev);
        assert_eq!(st.pane().find_by_id("u1").unwrap().rendered, "hi there");
        assert!(!st.replace_content(r.renderer(), "u1", "hi there"));
    }

    #[test]
    fn test_message_edited_for_other_conversation_ignored() {
        let r = reconciler();
        let mut st = loaded(&r);
        let ev = LiveUpdate::Event(LiveEvent::MessageEdited {
            conversation_id: Some("c2".into()),
            message_id: "u1".into(),
            content: "changed".into(),
            role: None,
        });
        st.apply_live_update(&r, &ev);
        assert_eq!(st.pane().find_by_id("u1").unwrap().source, "hi");
    }

    #[test]
    fn test_edit_of_untracked_message_refreshes_list() {
        let r = reconciler();
        let mut st = loaded(&r);
        let before = st.pane().messages().to_vec();
        let ev = LiveUpdate::Event(LiveEvent::MessageEdited {
            conversation_id: None,
            message_id: "zz".into(),
            content: "elsewhere".into(),
            role: None,
        });
        assert_eq!(st.apply_live_update(&r, &ev), vec![Followup::RefreshList]);
        assert!(st.conversations().needs_refresh());
        assert_eq!(st.pane().messages(), before.as_slice());
    }

    #[test]
    fn test_deleting_displayed_conversation_clears_and_cancels() {
        let r = reconciler();
        let mut st = ChatState::new();
        let _t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        let ev = LiveUpdate::Event(LiveEvent::ConversationDeleted {
            conversation_id: "c1".into(),
        });
        let followups = st.apply_live_update(&r, &ev);
        assert_eq!(followups, vec![Followup::CancelStream("c1".into())]);
        assert!(st.pane().conversation_id().is_none());

        let out = st.cancel_stream(&r, "c1", &NoStopSignal);
        assert!(out.local);
        assert!(!r.is_streaming("c1"));
    }

    #[test]
    fn test_summary_updates_list_and_title() {
        let r = reconciler();
        let mut st = loaded(&r);
        st.conversations_mut().replace_all(vec![ConversationSummary::new("c1")]);
        let ev = LiveUpdate::Event(LiveEvent::SummaryUpdated {
            conversation_id: "c1".into(),
            summary: "Greeting".into(),
        });
        assert!(st.apply_live_update(&r, &ev).is_empty());
        assert_eq!(st.pane().title(), Some("Greeting"));
        assert_eq!(st.conversations().get("c1").unwrap().summary.as_deref(), Some("Greeting"));
    }

    #[test]
    fn test_reconnect_asks_for_full_reload() {
        let r = reconciler();
        let mut st = loaded(&r);
        let followups = st.apply_live_update(&r, &LiveUpdate::Connected { reconnect: true });
        assert_eq!(
            followups,
            vec![Followup::RefreshList, Followup::ReloadConversation("c1".into())]
        );
        assert!(st.conversations().needs_refresh());
    }

    #[test]
    fn test_reconnect_mid_stream_does_not_reload_pane() {
        let r = reconciler();
        let mut st = ChatState::new();
        let _t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        let followups = st.apply_live_update(&r, &LiveUpdate::Connected { reconnect: true });
        assert_eq!(followups, vec![Followup::RefreshList]);
    }

    #[test]
    fn test_disconnect_is_silent() {
        let r = reconciler();
        let mut st = loaded(&r);
        assert!(st.apply_live_update(&r, &LiveUpdate::Disconnected).is_empty());
        assert!(st.notifications().is_empty());
    }

    #[test]
    fn test_stale_ticket_cannot_touch_newer_stream() {
        let r = reconciler();
        let mut st = ChatState::new();
        let old = st.begin_stream(&r, "c1", "one", vec![]).unwrap();
        st.cancel_stream(&r, "c1", &NoStopSignal);
        let new = st.begin_stream(&r, "c1", "two", vec![]).unwrap();

        assert_eq!(st.fail_stream(&r, &old, &ClientError::Cancelled), StreamOutcome::Cancelled);
        assert!(st.is_streaming("c1"));
        assert!(!st.apply_chunk(&r, &old, b"late"));
        assert!(st.apply_chunk(&r, &new, b"fresh"));
        assert_eq!(st.pane().last().unwrap().source, "fresh");
    }

    #[test]
    fn test_failure_notifies_and_keeps_partial() {
        let r = reconciler();
        let mut st = ChatState::new();
        let t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        st.apply_chunk(&r, &t, b"half");
        let err = ClientError::transport("http://x/chat", "reset");
        let out = st.fail_stream(&r, &t, &err);
        assert!(matches!(out, StreamOutcome::Failed { notification: Some(_) }));
        assert_eq!(st.notifications().active().len(), 1);
        assert_eq!(st.pane().last().unwrap().source, "half");
    }

    #[test]
    fn test_reload_skipped_while_streaming() {
        let r = reconciler();
        let mut st = ChatState::new();
        let _t = st.begin_stream(&r, "c1", "q", vec![]).unwrap();
        assert!(!st.reload_history(r.renderer(), "c1", vec![history_msg("u1", Role::User, "q")]));
        assert_eq!(st.pane().messages().len(), 2);
    }

    #[test]
    fn test_open_history_titles_from_list() {
        let r = reconciler();
        let mut st = ChatState::new();
        let mut entry = ConversationSummary::new("c1");
        entry.summary = Some("Trip plans".into());
        st.conversations_mut().replace_all(vec![entry]);
        st.open_history(r.renderer(), "c1", vec![history_msg("u1", Role::User, "hi")]);
        assert_eq!(st.pane().title(), Some("Trip plans"));
    }
}
