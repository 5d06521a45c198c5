//! Client core for a self-hosted aiaio chat server.
//!
//! Replies stream into a [`pane::MessagePane`] chunk by chunk through the
//! [`reconciler::StreamReconciler`], while the [`channel::LiveChannel`]
//! pushes persistence events (ids, edits, summaries) that
//! [`session::SessionContext`] reconciles with what is already on screen.

pub mod api;
pub mod bus;
pub mod channel;
pub mod cli;
pub mod config;
pub mod conversations;
pub mod error;
pub mod events;
pub mod model;
pub mod pane;
pub mod reconciler;
pub mod render;
pub mod session;

pub use api::ApiClient;
pub use channel::{ChannelState, LiveChannel, Visibility};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::{LiveEvent, LiveUpdate};
pub use reconciler::{CancelOutcome, StreamReconciler};
pub use session::{ChatState, SessionContext, StreamOutcome};
