//!
//! smartmark sync client
//! ----------------------
//! Keeps a local copy of the signed-in identity's bookmarks converged with the
//! store, across any number of concurrently open clients.
//!
//! One task owns all client state. It reacts to four sources:
//! - commands from the `SyncHandle` (identity changes, create, delete, refresh, shutdown);
//! - change-feed messages, each of which triggers a full re-fetch;
//! - completions of in-flight fetches, mutations and subscription attempts;
//! - the resubscribe timer after the feed connection was lost, and the retry
//!   timer after the newest fetch failed.
//!
//! Fetches carry a sequence number and only the newest completed fetch is
//! applied, so a slow older response never overwrites a newer one. When the
//! newest fetch fails it is retried with the same backoff as resubscribing. Everything
//! tied to an identity carries a generation number and is discarded once the
//! identity changes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::feed::FeedMessage;
use crate::identity::Identity;
use crate::storage::{validate_new, Bookmark, BookmarkId};

mod backend;
mod remote;

pub use backend::{BookmarkBackend, FeedStream, LocalBackend};
pub use remote::RemoteBackend;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First resubscribe (or fetch retry) delay after a failure.
    pub resubscribe_min: Duration,
    /// Upper bound for the doubling delay.
    pub resubscribe_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { resubscribe_min: Duration::from_millis(100), resubscribe_max: Duration::from_secs(10) }
    }
}

/// What the client currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub identity: Option<Identity>,
    /// Newest first.
    pub bookmarks: Vec<Bookmark>,
    /// A live feed subscription exists for `identity`.
    pub subscribed: bool,
    pub last_error: Option<AppError>,
}

enum Command {
    SetIdentity(Option<Identity>),
    Create { title: String, url: String, reply: oneshot::Sender<AppResult<Bookmark>> },
    Delete { id: BookmarkId, reply: oneshot::Sender<AppResult<()>> },
    Refresh,
    Shutdown,
}

enum Done {
    Fetched { generation: u64, seq: u64, result: AppResult<Vec<Bookmark>> },
    Subscribed { generation: u64, result: AppResult<FeedStream> },
    Mutated { generation: u64, error: Option<AppError> },
}

fn stopped() -> AppError { AppError::internal("sync_stopped", "sync client is shut down") }

/// Handle to a running sync task. Dropping it stops the task and releases its subscription.
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SyncState>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Switch to another identity (`None` = signed out). Clears the list and resubscribes.
    pub fn set_identity(&self, identity: Option<Identity>) {
        let _ = self.commands.send(Command::SetIdentity(identity));
    }

    pub async fn create(&self, title: &str, url: &str) -> AppResult<Bookmark> {
        let (title, url) = validate_new(title, url)?;
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Create { title, url, reply }).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn delete(&self, id: BookmarkId) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Delete { id, reply }).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Ask for a re-fetch outside of any feed event.
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    pub fn state(&self) -> SyncState { self.state.borrow().clone() }

    pub fn watch(&self) -> watch::Receiver<SyncState> { self.state.clone() }

    /// Wait until the published state satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F) -> AppResult<SyncState>
    where
        F: FnMut(&SyncState) -> bool,
    {
        let mut rx = self.state.clone();
        let seen = rx.wait_for(pred).await.map_err(|_| stopped())?;
        Ok(seen.clone())
    }

    /// Stop the task and wait for it to release its subscription.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}

pub struct SyncClient;

impl SyncClient {
    /// Start the sync task on the current tokio runtime.
    pub fn spawn(backend: Arc<dyn BookmarkBackend>, config: SyncConfig) -> SyncHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SyncState::default());
        let backoff = config.resubscribe_min;
        let worker = SyncLoop {
            backend,
            config,
            commands: rx,
            state: state_tx,
            generation: 0,
            identity: None,
            feed: None,
            subscribing: false,
            resubscribe_at: None,
            backoff,
            refetch_at: None,
            fetch_backoff: backoff,
            next_seq: 0,
            applied_seq: 0,
            inflight: FuturesUnordered::new(),
        };
        let task = tokio::spawn(worker.run());
        SyncHandle { commands, state, task: Some(task) }
    }
}

struct SyncLoop {
    backend: Arc<dyn BookmarkBackend>,
    config: SyncConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SyncState>,
    generation: u64,
    identity: Option<Identity>,
    feed: Option<FeedStream>,
    subscribing: bool,
    resubscribe_at: Option<Instant>,
    backoff: Duration,
    refetch_at: Option<Instant>,
    fetch_backoff: Duration,
    next_seq: u64,
    applied_seq: u64,
    inflight: FuturesUnordered<BoxFuture<'static, Done>>,
}

async fn next_feed(feed: &mut Option<FeedStream>) -> Option<AppResult<FeedMessage>> {
    match feed {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl SyncLoop {
    async fn run(mut self) {
        loop {
            let wake = self.resubscribe_at.unwrap_or_else(Instant::now);
            let refetch = self.refetch_at.unwrap_or_else(Instant::now);
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                msg = next_feed(&mut self.feed) => self.on_feed(msg),
                Some(done) = self.inflight.next(), if !self.inflight.is_empty() => self.on_done(done),
                _ = tokio::time::sleep_until(wake), if self.resubscribe_at.is_some() => {
                    self.resubscribe_at = None;
                    self.start_subscribe();
                }
                _ = tokio::time::sleep_until(refetch), if self.refetch_at.is_some() => self.start_fetch(),
            }
        }
        if self.feed.take().is_some() {
            debug!(target: "sync", "feed subscription released");
        }
        self.state.send_modify(|s| s.subscribed = false);
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetIdentity(next) => self.switch_identity(next),
            Command::Refresh => self.start_fetch(),
            Command::Create { title, url, reply } => {
                if self.identity.is_none() {
                    let _ = reply.send(Err(AppError::anonymous()));
                    return;
                }
                let backend = self.backend.clone();
                let generation = self.generation;
                self.inflight.push(Box::pin(async move {
                    let result = backend.create(&title, &url).await;
                    let error = result.as_ref().err().cloned();
                    let _ = reply.send(result);
                    Done::Mutated { generation, error }
                }));
            }
            Command::Delete { id, reply } => {
                if self.identity.is_none() {
                    let _ = reply.send(Err(AppError::anonymous()));
                    return;
                }
                let backend = self.backend.clone();
                let generation = self.generation;
                self.inflight.push(Box::pin(async move {
                    let result = backend.delete(id).await;
                    let error = result.as_ref().err().cloned();
                    let _ = reply.send(result);
                    Done::Mutated { generation, error }
                }));
            }
            Command::Shutdown => {}
        }
    }

    fn switch_identity(&mut self, next: Option<Identity>) {
        if next == self.identity {
            self.start_fetch();
            return;
        }
        self.generation += 1;
        // dropping the stream releases the old identity's subscription
        self.feed = None;
        self.subscribing = false;
        self.resubscribe_at = None;
        self.backoff = self.config.resubscribe_min;
        self.refetch_at = None;
        self.fetch_backoff = self.config.resubscribe_min;
        info!(target: "sync", from = ?self.identity.as_ref().map(|i| i.id.as_str()), to = ?next.as_ref().map(|i| i.id.as_str()), "identity changed");
        self.identity = next.clone();
        self.state.send_replace(SyncState { identity: next, bookmarks: Vec::new(), subscribed: false, last_error: None });
        if self.identity.is_some() {
            self.start_subscribe();
            self.start_fetch();
        }
    }

    fn start_fetch(&mut self) {
        // a new fetch supersedes any pending retry
        self.refetch_at = None;
        if self.identity.is_none() {
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let generation = self.generation;
        let backend = self.backend.clone();
        self.inflight.push(Box::pin(async move {
            let result = backend.list().await;
            Done::Fetched { generation, seq, result }
        }));
    }

    fn start_subscribe(&mut self) {
        if self.identity.is_none() || self.subscribing || self.feed.is_some() {
            return;
        }
        self.subscribing = true;
        let generation = self.generation;
        let backend = self.backend.clone();
        self.inflight.push(Box::pin(async move {
            let result = backend.subscribe().await;
            Done::Subscribed { generation, result }
        }));
    }

    fn schedule_refetch(&mut self) {
        let delay = self.fetch_backoff;
        self.fetch_backoff = (self.fetch_backoff * 2).min(self.config.resubscribe_max);
        self.refetch_at = Some(Instant::now() + delay);
        debug!(target: "sync", delay_ms = delay.as_millis() as u64, "fetch retry scheduled");
    }

    fn schedule_resubscribe(&mut self) {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.resubscribe_max);
        self.resubscribe_at = Some(Instant::now() + delay);
        debug!(target: "sync", delay_ms = delay.as_millis() as u64, "resubscribe scheduled");
    }

    fn on_feed(&mut self, msg: Option<AppResult<FeedMessage>>) {
        match msg {
            Some(Ok(FeedMessage::Change(ev))) => {
                debug!(target: "sync", kind = ?ev.kind, id = %ev.bookmark_id, "change received");
                self.start_fetch();
            }
            Some(Ok(FeedMessage::Resync)) => self.start_fetch(),
            Some(Err(e)) => {
                warn!(target: "sync", "feed failed: {}", e);
                self.feed_lost(Some(e));
            }
            None => {
                warn!(target: "sync", "feed closed");
                self.feed_lost(None);
            }
        }
    }

    fn feed_lost(&mut self, error: Option<AppError>) {
        self.feed = None;
        self.state.send_modify(|s| {
            s.subscribed = false;
            if error.is_some() { s.last_error = error; }
        });
        self.schedule_resubscribe();
    }

    fn on_done(&mut self, done: Done) {
        match done {
            Done::Fetched { generation, seq, result } => {
                if generation != self.generation || seq <= self.applied_seq {
                    return;
                }
                match result {
                    Ok(bookmarks) => {
                        self.applied_seq = seq;
                        self.fetch_backoff = self.config.resubscribe_min;
                        self.state.send_modify(|s| {
                            s.bookmarks = bookmarks;
                            s.last_error = None;
                        });
                    }
                    Err(e) => {
                        warn!(target: "sync", seq, "fetch failed: {}", e);
                        self.state.send_modify(|s| s.last_error = Some(e));
                        // an older failure is covered by the newer fetch still in flight
                        if seq == self.next_seq {
                            self.schedule_refetch();
                        }
                    }
                }
            }
            Done::Subscribed { generation, result } => {
                if generation != self.generation {
                    return;
                }
                self.subscribing = false;
                match result {
                    Ok(stream) => {
                        self.feed = Some(stream);
                        self.backoff = self.config.resubscribe_min;
                        self.state.send_modify(|s| s.subscribed = true);
                        // anything committed while unsubscribed is picked up here
                        self.start_fetch();
                    }
                    Err(e) => {
                        warn!(target: "sync", "subscribe failed: {}", e);
                        self.state.send_modify(|s| s.last_error = Some(e));
                        self.schedule_resubscribe();
                    }
                }
            }
            Done::Mutated { generation, error } => {
                if generation != self.generation {
                    return;
                }
                match error {
                    None => self.start_fetch(),
                    Some(e) => self.state.send_modify(|s| s.last_error = Some(e)),
                }
            }
        }
    }
}
