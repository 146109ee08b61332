//! Where a sync client reads, writes and listens. The in-process backend goes
//! through the same session resolver as the HTTP gateway.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;

use crate::error::{AppError, AppResult};
use crate::feed::{ChangeFeed, FeedMessage};
use crate::identity::{Identity, ResolveOutcome, SessionResolver, TokenPair};
use crate::server::AppState;
use crate::storage::{Bookmark, BookmarkId, ScopedBookmarks, SharedStore};

/// Change notifications for the backend's current identity. A transport failure
/// ends the stream or yields an error; either way the subscriber must reconnect.
pub type FeedStream = BoxStream<'static, AppResult<FeedMessage>>;

#[async_trait]
pub trait BookmarkBackend: Send + Sync {
    async fn list(&self) -> AppResult<Vec<Bookmark>>;
    async fn create(&self, title: &str, url: &str) -> AppResult<Bookmark>;
    async fn delete(&self, id: BookmarkId) -> AppResult<()>;
    async fn subscribe(&self) -> AppResult<FeedStream>;
}

/// A client living in the same process as the store. Holds its own token pair the
/// way a browser holds cookies and resolves it on every call.
pub struct LocalBackend {
    resolver: SessionResolver,
    store: SharedStore,
    feed: ChangeFeed,
    tokens: Mutex<Option<TokenPair>>,
}

impl LocalBackend {
    pub fn new(resolver: SessionResolver, store: SharedStore, feed: ChangeFeed) -> Self {
        Self { resolver, store, feed, tokens: Mutex::new(None) }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(state.resolver.clone(), state.store.clone(), state.feed.clone())
    }

    /// Start a session for `identity`, as a completed provider sign-in would.
    pub fn sign_in(&self, identity: Identity) -> AppResult<Identity> {
        let pair = self.resolver.sessions().issue(identity.clone())?;
        *self.tokens.lock() = Some(pair);
        Ok(identity)
    }

    pub fn sign_out(&self) {
        if let Some(pair) = self.tokens.lock().take() {
            self.resolver.sessions().revoke(&pair);
        }
    }

    pub fn tokens(&self) -> Option<TokenPair> { self.tokens.lock().clone() }

    /// Resolve the held pair, keeping any rotation and forgetting a dead session.
    pub async fn current_identity(&self) -> Option<Identity> {
        let held = self.tokens();
        let res = self.resolver.resolve(held.as_ref()).await;
        if let Some(rotated) = res.rotated {
            *self.tokens.lock() = Some(rotated);
        } else if res.outcome == ResolveOutcome::ExpiredTerminal {
            *self.tokens.lock() = None;
        }
        res.identity
    }

    async fn scoped(&self) -> AppResult<ScopedBookmarks> {
        let who = self.current_identity().await;
        ScopedBookmarks::for_identity(self.store.clone(), who.as_ref())
    }
}

#[async_trait]
impl BookmarkBackend for LocalBackend {
    async fn list(&self) -> AppResult<Vec<Bookmark>> {
        self.scoped().await?.list().await
    }

    async fn create(&self, title: &str, url: &str) -> AppResult<Bookmark> {
        self.scoped().await?.create(title, url).await
    }

    async fn delete(&self, id: BookmarkId) -> AppResult<()> {
        self.scoped().await?.delete(id).await
    }

    async fn subscribe(&self) -> AppResult<FeedStream> {
        let who = self.current_identity().await.ok_or_else(AppError::anonymous)?;
        Ok(self.feed.subscribe(&who.id).into_stream().map(Ok).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{SessionManager, SessionSettings};
    use crate::storage::MemoryBookmarkStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn backend(settings: SessionSettings) -> LocalBackend {
        let feed = ChangeFeed::default();
        let store: SharedStore = Arc::new(MemoryBookmarkStore::new(feed.clone()));
        LocalBackend::new(SessionResolver::new(SessionManager::new(settings)), store, feed)
    }

    #[tokio::test]
    async fn anonymous_backend_is_refused() {
        let b = backend(SessionSettings::default());
        assert_eq!(b.list().await.unwrap_err().http_status(), 401);
        assert!(b.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn expired_access_token_is_refreshed_transparently() -> anyhow::Result<()> {
        let b = backend(SessionSettings { access_ttl: Duration::ZERO, ..SessionSettings::default() });
        b.sign_in(Identity::new("u1", "u1@example.test", "U"))?;
        let before = b.tokens().unwrap();
        b.create("Site", "https://x.test").await?;
        let after = b.tokens().unwrap();
        assert_ne!(before.refresh_token, after.refresh_token);
        assert_eq!(b.list().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn sign_out_revokes_the_session() {
        let b = backend(SessionSettings::default());
        b.sign_in(Identity::new("u1", "u1@example.test", "U")).unwrap();
        b.sign_out();
        assert!(b.tokens().is_none());
        assert!(b.list().await.is_err());
    }
}
