//! # Live Update Channel
//!
//! One logical WebSocket connection per client session, reconnecting on a
//! fixed delay for as long as the session lives.
//!
//! ## State machine
//! `Disconnected --connect()--> Connecting --open--> Open --close--> Disconnected`,
//! then back to `Connecting` after `reconnect_delay`. Calling
//! [`connect`](LiveChannel::connect) while `Connecting` or `Open` does nothing.
//!
//! ## Guarantees
//! - Frames are published to the [`EventBus`] in the order the socket
//!   delivered them; nothing is reordered, duplicated or dropped while open.
//! - Every (re)open publishes [`LiveUpdate::Connected`] so subscribers can
//!   reload; the stream is never resumed.
//! - Drops are logged, never surfaced as errors.
//!
//! ## NOT Responsible For
//! - Applying events (see the session context)
//! - Confirming that a stop request took effect

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{LiveEvent, LiveUpdate};
use crate::reconciler::{CancelHandle, StopSignal};

/// Text frame asking the server to stop generating for this client.
pub const STOP_GENERATION: &str = "stop_generation";

/// Consecutive failed attempts after which retries are logged as errors.
const LOUD_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
        }
    }
}

/// Whether the UI hosting the session is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Visible,
}

struct Inner {
    url: String,
    reconnect_delay: Duration,
    bus: EventBus,
    state: Mutex<ChannelState>,
    supervisor_running: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    wake: Notify,
    shutdown: CancelHandle,
    opened: AtomicU64,
    visibility: Mutex<Visibility>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Inner {
    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ChannelState) -> ChannelState {
        let mut guard = lock(&self.state);
        let prev = *guard;
        *guard = next;
        if prev != next {
            debug!(url = %self.url, from = %prev, to = %next, "live channel state");
        }
        prev
    }

    /// Supervisor loop: connect, pump frames, wait, repeat until shutdown.
    async fn supervise(self: Arc<Self>) {
        let mut failures: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ChannelState::Connecting);
            match self.run_once().await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if failures >= LOUD_FAILURE_THRESHOLD {
                        error!(error = %e, url = %self.url, failures, "live channel failing repeatedly, will retry");
                    } else {
                        warn!(error = %e, url = %self.url, "live channel dropped, will retry");
                    }
                }
            }
            *lock(&self.outbound) = None;
            let was = self.set_state(ChannelState::Disconnected);
            if was == ChannelState::Open {
                self.bus.publish(LiveUpdate::Disconnected);
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.wake.notified() => debug!(url = %self.url, "reconnect requested early"),
                _ = self.shutdown.cancelled() => break,
            }
        }
        self.set_state(ChannelState::Disconnected);
        self.supervisor_running.store(false, Ordering::SeqCst);
        info!(url = %self.url, "live channel stopped");
    }

    /// One connection lifetime. `Ok` on a clean close or shutdown.
    async fn run_once(&self) -> Result<()> {
        let connecting = connect_async(self.url.as_str());
        let (ws, _) = tokio::select! {
            r = connecting => r.map_err(|e| ClientError::Channel(e.to_string()))?,
            _ = self.shutdown.cancelled() => return Ok(()),
        };
        let (mut sink, mut frames) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *lock(&self.outbound) = Some(tx);
        let opened = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ChannelState::Open);
        info!(url = %self.url, connection = opened, "live channel open");
        self.bus.publish(LiveUpdate::Connected {
            reconnect: opened > 1,
        });

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match LiveEvent::parse(&text) {
                        Ok(event) => {
                            debug!(kind = event.kind(), "live event");
                            self.bus.publish(LiveUpdate::Event(event));
                        }
                        Err(e) => debug!(error = %e, "skipping undecodable frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ClientError::Channel(e.to_string())),
                },
                Some(text) = rx.recv() => {
                    sink.send(WsMessage::Text(text))
                        .await
                        .map_err(|e| ClientError::Channel(e.to_string()))?;
                }
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Handle to the session's push connection. Cloning shares the connection.
#[derive(Clone)]
pub struct LiveChannel {
    inner: Arc<Inner>,
}

impl LiveChannel {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                reconnect_delay,
                bus,
                state: Mutex::new(ChannelState::Disconnected),
                supervisor_running: AtomicBool::new(false),
                outbound: Mutex::new(None),
                wake: Notify::new(),
                shutdown: CancelHandle::new(),
                opened: AtomicU64::new(0),
                visibility: Mutex::new(Visibility::Visible),
            }),
        }
    }

    /// Channel for `client_id` on the server named by `config`.
    pub fn from_config(config: &ClientConfig, client_id: &str, bus: EventBus) -> Self {
        Self::new(config.ws_url(client_id), config.reconnect_delay(), bus)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Number of times the socket has opened.
    pub fn connection_count(&self) -> u64 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    /// Start connecting. A no-op while `Connecting` or `Open`; while waiting
    /// out the reconnect delay it skips the rest of the wait. Returns `true`
    /// if a connection attempt was started or brought forward.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        if self.state() != ChannelState::Disconnected {
            return false;
        }
        if self.inner.supervisor_running.swap(true, Ordering::SeqCst) {
            self.inner.wake.notify_one();
            return true;
        }
        self.inner.set_state(ChannelState::Connecting);
        tokio::spawn(Arc::clone(&self.inner).supervise());
        true
    }

    /// Only a hidden-to-visible transition forces a connectivity check,
    /// reconnecting at once if the socket is not open.
    pub fn on_visibility_change(&self, visibility: Visibility) -> bool {
        let previous = std::mem::replace(&mut *lock(&self.inner.visibility), visibility);
        if previous != Visibility::Hidden || visibility != Visibility::Visible || self.is_open() {
            return false;
        }
        debug!(url = %self.inner.url, state = %self.state(), "visible again, reconnecting");
        self.connect()
    }

    /// Queue a text frame on the open connection.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_open() {
            return Err(ClientError::Channel("not open".into()));
        }
        let guard = lock(&self.inner.outbound);
        match guard.as_ref() {
            Some(tx) => tx
                .send(text.into())
                .map_err(|_| ClientError::Channel("connection closing".into())),
            None => Err(ClientError::Channel("not open".into())),
        }
    }

    /// Close the connection for good. Only the session owner calls this.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();
    }
}

impl StopSignal for LiveChannel {
    fn request_stop(&self) -> bool {
        match self.send_text(STOP_GENERATION) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "stop request not sent");
                false
            }
        }
    }
}
