//! Narrow interfaces onto the external chat client, plus the event and
//! filter types the router and handlers share. The wire protocol itself
//! lives outside this crate; anything implementing [`ChatClientManager`]
//! can drive the engine.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One inbound event from the remote endpoint, already decoded by the
/// external client. `text` carries the caption for media messages.
#[derive(Debug, Clone, Default)]
pub struct ChatEvent {
    /// Chat the event arrived in; keys the router queue together with the account.
    pub peer_id: i64,
    pub sender_id: Option<i64>,
    pub message_id: i64,
    pub text: String,
    pub has_photo: bool,
    /// Inline keyboard labels, row-major. Empty when the message has no buttons.
    pub buttons: Vec<Vec<String>>,
}

impl ChatEvent {
    pub fn has_buttons(&self) -> bool {
        self.buttons.iter().any(|row| !row.is_empty())
    }

    /// All button labels flattened in display order.
    pub fn button_labels(&self) -> Vec<String> {
        self.buttons.iter().flatten().cloned().collect()
    }
}

/// Introspectable wait predicate: a conjunction of small tagged conditions
/// instead of an opaque closure, so router matching stays testable on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub from_sender: Option<i64>,
    pub require_photo: bool,
    pub require_buttons: bool,
}

impl EventFilter {
    /// Match any event in the peer's queue.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn from_sender(sender_id: i64) -> Self {
        Self {
            from_sender: Some(sender_id),
            ..Self::default()
        }
    }

    pub fn with_photo(mut self) -> Self {
        self.require_photo = true;
        self
    }

    pub fn with_buttons(mut self) -> Self {
        self.require_buttons = true;
        self
    }

    pub fn matches(&self, event: &ChatEvent) -> bool {
        if let Some(sender) = self.from_sender {
            if event.sender_id != Some(sender) {
                return false;
            }
        }
        if self.require_photo && !event.has_photo {
            return false;
        }
        if self.require_buttons && !event.has_buttons() {
            return false;
        }
        true
    }
}

/// A connected, authenticated client session for one account.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Resolve a username/identifier to a numeric peer id.
    async fn resolve_peer(&self, target: &str) -> Result<i64>;

    async fn send_message(&self, target: &str, text: &str) -> Result<()>;

    /// Fetch the media payload attached to an event.
    async fn download_media(&self, event: &ChatEvent) -> Result<Vec<u8>>;

    /// Press an inline button on the message behind `event`. Returns the
    /// callback answer text when the remote side pops a notification.
    async fn click(&self, event: &ChatEvent, label: &str) -> Result<Option<String>>;

    /// Subscribe to every inbound event this session sees. The router pumps
    /// this into its per-peer queues.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChatEvent>;
}

/// Scoped acquisition of per-account client sessions.
#[async_trait]
pub trait ChatClientManager: Send + Sync {
    async fn acquire(&self, session_name: &str) -> Result<Arc<dyn ChatClient>>;
}
