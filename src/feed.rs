//!
//! smartmark change feed
//! ----------------------
//! Push notifications for bookmark mutations. The store publishes one event per
//! successful insert/delete; subscribers receive only the events of the owner
//! they subscribed for. Each owner with live subscribers has its own broadcast
//! channel, so one owner's write rate never affects another's subscribers.
//! A subscription is a handle: dropping it unsubscribes.
//!
//! Delivery is best-effort. A subscriber that falls behind the channel capacity
//! gets a single `FeedMessage::Resync` in place of the events it missed, which
//! is all a re-fetching consumer needs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub owner_id: String,
    pub bookmark_id: Uuid,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, owner_id: &str, bookmark_id: Uuid) -> Self {
        Self { kind, owner_id: owner_id.to_string(), bookmark_id, at: Utc::now() }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// Events were dropped; state must be re-fetched.
    Resync,
}

struct OwnerChannel {
    tx: broadcast::Sender<ChangeEvent>,
    subscribers: usize,
}

type Channels = Arc<Mutex<HashMap<String, OwnerChannel>>>;

#[derive(Clone)]
pub struct ChangeFeed {
    capacity: usize,
    channels: Channels,
}

impl Default for ChangeFeed {
    fn default() -> Self { Self::with_capacity(DEFAULT_CAPACITY) }
}

impl ChangeFeed {
    /// `capacity` is per owner: how many events a subscriber may fall behind before it must resync.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), channels: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn publish(&self, event: ChangeEvent) {
        tracing::debug!(target: "feed", owner = %event.owner_id, kind = ?event.kind, id = %event.bookmark_id, "publish");
        let channels = self.channels.lock();
        // nobody is watching this owner right now
        let Some(channel) = channels.get(&event.owner_id) else { return; };
        let _ = channel.tx.send(event);
    }

    pub fn subscribe(&self, owner_id: &str) -> Subscription {
        let rx = {
            let mut channels = self.channels.lock();
            let channel = channels.entry(owner_id.to_string()).or_insert_with(|| OwnerChannel {
                tx: broadcast::channel(self.capacity).0,
                subscribers: 0,
            });
            channel.subscribers += 1;
            channel.tx.subscribe()
        };
        tracing::debug!(target: "feed", owner = %owner_id, "subscribe");
        Subscription { owner_id: owner_id.to_string(), rx, channels: self.channels.clone() }
    }

    /// Live subscriptions for one owner.
    pub fn active_subscriptions(&self, owner_id: &str) -> usize {
        self.channels.lock().get(owner_id).map(|c| c.subscribers).unwrap_or(0)
    }

    /// Owners that currently have a channel.
    pub fn active_owners(&self) -> usize { self.channels.lock().len() }
}

/// An owner-scoped subscription. Dropping it releases the subscription.
pub struct Subscription {
    owner_id: String,
    rx: broadcast::Receiver<ChangeEvent>,
    channels: Channels,
}

impl Subscription {
    pub fn owner_id(&self) -> &str { &self.owner_id }

    /// Next message for this owner; `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(FeedMessage::Change(ev)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "feed", owner = %self.owner_id, skipped, "subscriber lagged");
                    return Some(FeedMessage::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, FeedMessage> {
        stream::unfold(self, |mut sub| async move {
            let msg = sub.recv().await?;
            Some((msg, sub))
        })
        .boxed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(&self.owner_id) {
            channel.subscribers = channel.subscribers.saturating_sub(1);
            if channel.subscribers == 0 { channels.remove(&self.owner_id); }
        }
        tracing::debug!(target: "feed", owner = %self.owner_id, "unsubscribe");
    }
}
