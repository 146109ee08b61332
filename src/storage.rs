//!
//! smartmark storage module
//! -------------------------
//! The bookmarks collection. `BookmarkStore` is the seam to whatever holds rows
//! durably; every primitive on it takes the owner id explicitly so no query can
//! run unfiltered. Application code never calls it directly: it goes through
//! `ScopedBookmarks`, which binds the owner once from a resolved identity.
//!
//! `MemoryBookmarkStore` keeps rows in memory, optionally mirrored to a bincode
//! snapshot file that is rewritten after each mutation and loaded at startup.
//! A mutation counts as committed once its snapshot is on disk; a failed write
//! undoes the in-memory change. Each committed mutation is published on the
//! `ChangeFeed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::feed::{ChangeEvent, ChangeFeed, ChangeKind};

mod scoped;

pub use scoped::{validate_new, ScopedBookmarks};

pub type BookmarkId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: BookmarkId,
    pub title: String,
    pub url: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// A row about to be inserted. The owner id is filled in by `ScopedBookmarks`, never by a caller.
#[derive(Debug, Clone)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
    pub owner_id: String,
}

#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn insert(&self, row: NewBookmark) -> AppResult<Bookmark>;

    /// Every row of one owner, newest first.
    async fn select_by_owner(&self, owner_id: &str) -> AppResult<Vec<Bookmark>>;

    /// Delete `id` only if it belongs to `owner_id`. Returns whether a row went away.
    async fn delete_owned(&self, id: BookmarkId, owner_id: &str) -> AppResult<bool>;
}

pub type SharedStore = Arc<dyn BookmarkStore>;

#[derive(Debug, Clone)]
struct Row {
    seq: u64,
    bookmark: Bookmark,
}

#[derive(Debug, Default)]
struct Rows {
    next_seq: u64,
    /// Bumped on every mutation; orders snapshot writes.
    version: u64,
    by_id: HashMap<BookmarkId, Row>,
}

/// Snapshot bytes taken under the rows lock, written after it is released.
struct Staged {
    version: u64,
    bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    created_ms: i64,
    rows: Vec<Bookmark>,
}

#[derive(Clone)]
pub struct MemoryBookmarkStore {
    rows: Arc<RwLock<Rows>>,
    feed: ChangeFeed,
    snapshot: Option<PathBuf>,
    /// Version of the snapshot last written; held while writing.
    written: Arc<Mutex<u64>>,
}

impl MemoryBookmarkStore {
    pub fn new(feed: ChangeFeed) -> Self {
        Self { rows: Arc::new(RwLock::new(Rows::default())), feed, snapshot: None, written: Arc::new(Mutex::new(0)) }
    }

    /// Store mirrored to `path`. An existing snapshot is loaded first.
    pub fn with_snapshot<P: AsRef<Path>>(feed: ChangeFeed, path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rows = Rows::default();
        if path.exists() {
            let bytes = std::fs::read(&path).with_context(|| format!("reading snapshot {}", path.display()))?;
            let snap: Snapshot = bincode::deserialize(&bytes).with_context(|| format!("decoding snapshot {}", path.display()))?;
            for bookmark in snap.rows.into_iter() {
                let seq = rows.next_seq;
                rows.next_seq += 1;
                rows.by_id.insert(bookmark.id, Row { seq, bookmark });
            }
            tracing::info!(target: "startup", rows = rows.by_id.len(), "loaded bookmark snapshot from {}", path.display());
        } else if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok();
        }
        Ok(Self { rows: Arc::new(RwLock::new(rows)), feed, snapshot: Some(path), written: Arc::new(Mutex::new(0)) })
    }

    pub fn feed(&self) -> &ChangeFeed { &self.feed }

    pub fn len(&self) -> usize { self.rows.read().by_id.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Bump the version and encode the rows, if this store is mirrored.
    fn stage(&self, rows: &mut Rows) -> anyhow::Result<Option<Staged>> {
        rows.version += 1;
        if self.snapshot.is_none() {
            return Ok(None);
        }
        let mut ordered: Vec<&Row> = rows.by_id.values().collect();
        ordered.sort_by_key(|r| r.seq);
        let snap = Snapshot {
            version: 1,
            created_ms: Utc::now().timestamp_millis(),
            rows: ordered.into_iter().map(|r| r.bookmark.clone()).collect(),
        };
        Ok(Some(Staged { version: rows.version, bytes: bincode::serialize(&snap)? }))
    }

    async fn write_staged(&self, staged: Staged) -> anyhow::Result<()> {
        let Some(path) = self.snapshot.as_ref() else { return Ok(()); };
        let mut written = self.written.lock().await;
        // a newer snapshot already on disk includes this mutation
        if staged.version <= *written {
            return Ok(());
        }
        let tmp = path.with_extension("bin.tmp");
        tokio::fs::write(&tmp, staged.bytes).await.with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path).await.with_context(|| format!("replacing {}", path.display()))?;
        *written = staged.version;
        Ok(())
    }

    async fn persist(&self, staged: anyhow::Result<Option<Staged>>) -> AppResult<()> {
        let result = match staged {
            Ok(Some(staged)) => self.write_staged(staged).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            error!("bookmark snapshot write failed: {e:#}");
            AppError::io("snapshot_write_failed".to_string(), format!("{e:#}"))
        })
    }
}

#[async_trait]
impl BookmarkStore for MemoryBookmarkStore {
    async fn insert(&self, row: NewBookmark) -> AppResult<Bookmark> {
        if row.owner_id.is_empty() {
            return Err(AppError::internal("missing_owner", "insert without owner id"));
        }
        let bookmark = Bookmark {
            id: Uuid::new_v4(),
            title: row.title,
            url: row.url,
            owner_id: row.owner_id,
            created_at: Utc::now(),
        };
        let staged = {
            let mut rows = self.rows.write();
            let seq = rows.next_seq;
            rows.next_seq += 1;
            rows.by_id.insert(bookmark.id, Row { seq, bookmark: bookmark.clone() });
            self.stage(&mut rows)
        };
        if let Err(e) = self.persist(staged).await {
            self.rows.write().by_id.remove(&bookmark.id);
            return Err(e);
        }
        debug!(owner = %bookmark.owner_id, id = %bookmark.id, "bookmark inserted");
        self.feed.publish(ChangeEvent::new(ChangeKind::Created, &bookmark.owner_id, bookmark.id));
        Ok(bookmark)
    }

    async fn select_by_owner(&self, owner_id: &str) -> AppResult<Vec<Bookmark>> {
        let rows = self.rows.read();
        let mut mine: Vec<&Row> = rows.by_id.values().filter(|r| r.bookmark.owner_id == owner_id).collect();
        mine.sort_by(|a, b| b.bookmark.created_at.cmp(&a.bookmark.created_at).then(b.seq.cmp(&a.seq)));
        Ok(mine.into_iter().map(|r| r.bookmark.clone()).collect())
    }

    async fn delete_owned(&self, id: BookmarkId, owner_id: &str) -> AppResult<bool> {
        let (row, staged) = {
            let mut rows = self.rows.write();
            let owned = rows.by_id.get(&id).map(|r| r.bookmark.owner_id == owner_id).unwrap_or(false);
            if !owned {
                return Ok(false);
            }
            let Some(row) = rows.by_id.remove(&id) else { return Ok(false); };
            let staged = self.stage(&mut rows);
            (row, staged)
        };
        if let Err(e) = self.persist(staged).await {
            self.rows.write().by_id.insert(id, row);
            return Err(e);
        }
        debug!(owner = %owner_id, id = %id, "bookmark deleted");
        self.feed.publish(ChangeEvent::new(ChangeKind::Deleted, owner_id, id));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_row(owner: &str, title: &str) -> NewBookmark {
        NewBookmark { title: title.into(), url: format!("https://{}.test", title), owner_id: owner.into() }
    }

    #[tokio::test]
    async fn select_is_owner_filtered_and_newest_first() {
        let store = MemoryBookmarkStore::new(ChangeFeed::default());
        store.insert(new_row("alice", "one")).await.unwrap();
        store.insert(new_row("bob", "bobs")).await.unwrap();
        store.insert(new_row("alice", "two")).await.unwrap();
        let titles: Vec<String> = store.select_by_owner("alice").await.unwrap().into_iter().map(|b| b.title).collect();
        assert_eq!(titles, vec!["two".to_string(), "one".to_string()]);
        assert_eq!(store.select_by_owner("carol").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn delete_requires_matching_owner() {
        let store = MemoryBookmarkStore::new(ChangeFeed::default());
        let b = store.insert(new_row("alice", "one")).await.unwrap();
        assert!(!store.delete_owned(b.id, "bob").await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.delete_owned(b.id, "alice").await.unwrap());
        assert!(!store.delete_owned(b.id, "alice").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn mutations_are_published_only_when_committed() {
        let feed = ChangeFeed::default();
        let store = MemoryBookmarkStore::new(feed.clone());
        let mut sub = feed.subscribe("alice");
        let b = store.insert(new_row("alice", "one")).await.unwrap();
        store.delete_owned(b.id, "bob").await.unwrap();
        store.delete_owned(b.id, "alice").await.unwrap();
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        match (first, second) {
            (crate::feed::FeedMessage::Change(c), crate::feed::FeedMessage::Change(d)) => {
                assert_eq!(c.kind, ChangeKind::Created);
                assert_eq!(d.kind, ChangeKind::Deleted);
                assert_eq!(d.bookmark_id, b.id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn snapshot_survives_restart() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let path = tmp.path().join("data").join("bookmarks.bin");
        {
            let store = MemoryBookmarkStore::with_snapshot(ChangeFeed::default(), &path)?;
            store.insert(new_row("alice", "one")).await?;
            let gone = store.insert(new_row("alice", "two")).await?;
            store.insert(new_row("alice", "three")).await?;
            store.delete_owned(gone.id, "alice").await?;
        }
        let reopened = MemoryBookmarkStore::with_snapshot(ChangeFeed::default(), &path)?;
        let titles: Vec<String> = reopened.select_by_owner("alice").await?.into_iter().map(|b| b.title).collect();
        assert_eq!(titles, vec!["three".to_string(), "one".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_snapshot_write_rolls_back_and_publishes_nothing() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let path = tmp.path().join("bookmarks.bin");
        let feed = ChangeFeed::default();
        let store = MemoryBookmarkStore::with_snapshot(feed.clone(), &path)?;
        let kept = store.insert(new_row("alice", "kept")).await?;
        let mut sub = feed.subscribe("alice");

        // a directory where the temp file goes makes every write fail
        let blocker = path.with_extension("bin.tmp");
        std::fs::create_dir(&blocker)?;
        let err = store.insert(new_row("alice", "lost")).await.unwrap_err();
        assert_eq!(err.http_status(), 503);
        assert_eq!(err.code_str(), "snapshot_write_failed");
        assert_eq!(store.len(), 1);
        assert!(store.delete_owned(kept.id, "alice").await.is_err());
        assert_eq!(store.select_by_owner("alice").await?[0].id, kept.id);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await.is_err());

        std::fs::remove_dir(&blocker)?;
        assert!(store.delete_owned(kept.id, "alice").await?);
        let reopened = MemoryBookmarkStore::with_snapshot(ChangeFeed::default(), &path)?;
        assert!(reopened.is_empty());
        Ok(())
    }
}
