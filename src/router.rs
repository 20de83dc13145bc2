//! Demultiplexes each account's single inbound event stream into per-peer
//! FIFO queues that many concurrent waiters can consume by filter.
//!
//! A waiter pops events one at a time; events it does not match are held
//! aside and pushed back onto the queue head in original relative order
//! before the wait returns, so no waiter can permanently hide an event
//! meant for someone else.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::chat::{ChatClient, ChatEvent, EventFilter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("timeout waiting for a matching event in peer {peer_id}")]
    Timeout { peer_id: i64 },
}

#[derive(Default)]
struct PeerQueue {
    events: Mutex<VecDeque<ChatEvent>>,
    notify: Notify,
}

#[derive(Default)]
pub struct ConversationRouter {
    queues: Mutex<HashMap<(i64, i64), Arc<PeerQueue>>>,
    sources: Mutex<HashSet<i64>>,
}

impl ConversationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn queue(&self, account_id: i64, peer_id: i64) -> Arc<PeerQueue> {
        let mut queues = self.queues.lock().await;
        queues
            .entry((account_id, peer_id))
            .or_insert_with(|| Arc::new(PeerQueue::default()))
            .clone()
    }

    /// Append an inbound event to the tail of its peer's queue. Never blocks
    /// on a consumer and never drops the event.
    pub async fn route(&self, account_id: i64, event: ChatEvent) {
        let queue = self.queue(account_id, event.peer_id).await;
        queue.events.lock().await.push_back(event);
        queue.notify.notify_waiters();
    }

    /// Wire a client's inbound event subscription into [`route`]. Idempotent:
    /// a second call for the same account is a no-op, so only one pump task
    /// ever exists per account.
    ///
    /// [`route`]: ConversationRouter::route
    pub async fn register_source(self: &Arc<Self>, account_id: i64, client: &Arc<dyn ChatClient>) {
        {
            let mut sources = self.sources.lock().await;
            if !sources.insert(account_id) {
                return;
            }
        }
        let mut rx = client.subscribe();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                router.route(account_id, event).await;
            }
            debug!(account_id, "event source closed");
        });
    }

    /// Pop events from the queue head until one matches `filter`, holding
    /// non-matching events aside. On success, timeout or cancellation the
    /// held-aside events go back onto the queue head in their original
    /// relative order. The deadline is wall-clock, not event-count, bounded.
    pub async fn wait_for(
        &self,
        account_id: i64,
        peer_id: i64,
        filter: EventFilter,
        timeout: Duration,
    ) -> Result<ChatEvent, RouterError> {
        let queue = self.queue(account_id, peer_id).await;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut held: Vec<ChatEvent> = Vec::new();

        let outcome = loop {
            // Enable the waiter before draining; notify_waiters only wakes
            // already-registered futures, so an event routed between the
            // drain and the await would otherwise be a lost wakeup.
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let matched = {
                let mut events = queue.events.lock().await;
                let mut found = None;
                while let Some(event) = events.pop_front() {
                    if filter.matches(&event) {
                        found = Some(event);
                        break;
                    }
                    held.push(event);
                }
                found
            };
            if let Some(event) = matched {
                break Ok(event);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break Err(RouterError::Timeout { peer_id });
            }
        };

        if !held.is_empty() {
            let mut events = queue.events.lock().await;
            for event in held.drain(..).rev() {
                events.push_front(event);
            }
            queue.notify.notify_waiters();
        }
        outcome
    }

    /// Drain and discard everything queued for a peer. Handlers call this
    /// before starting a new interaction so stale replies from an earlier
    /// run cannot be mistaken for fresh ones.
    pub async fn clear(&self, account_id: i64, peer_id: i64) {
        let queue = self.queue(account_id, peer_id).await;
        queue.events.lock().await.clear();
    }

    /// Drop the queue and source registration for an account, for lifecycle
    /// cleanup when an account is deleted.
    pub async fn release_account(&self, account_id: i64) {
        self.queues
            .lock()
            .await
            .retain(|(acct, _), _| *acct != account_id);
        self.sources.lock().await.remove(&account_id);
    }
}
