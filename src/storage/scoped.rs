use super::{Bookmark, BookmarkId, NewBookmark, SharedStore};
use crate::error::{AppError, AppResult};
use crate::identity::Identity;

/// The bookmarks of exactly one identity.
///
/// The owner id is bound once, at construction, from a resolved identity. No
/// method accepts an owner id, so no call site can forget or forge the filter.
#[derive(Clone)]
pub struct ScopedBookmarks {
    store: SharedStore,
    owner_id: String,
}

impl ScopedBookmarks {
    /// Fails closed: without an identity there is no scope and no access.
    pub fn for_identity(store: SharedStore, identity: Option<&Identity>) -> AppResult<Self> {
        match identity {
            Some(who) if !who.id.is_empty() => Ok(Self { store, owner_id: who.id.clone() }),
            _ => Err(AppError::anonymous()),
        }
    }

    pub fn owner_id(&self) -> &str { &self.owner_id }

    pub async fn list(&self) -> AppResult<Vec<Bookmark>> {
        self.store.select_by_owner(&self.owner_id).await
    }

    pub async fn create(&self, title: &str, url: &str) -> AppResult<Bookmark> {
        let (title, url) = validate_new(title, url)?;
        self.store
            .insert(NewBookmark { title, url, owner_id: self.owner_id.clone() })
            .await
    }

    /// Unknown ids and ids owned by someone else are both a quiet no-op.
    pub async fn delete(&self, id: BookmarkId) -> AppResult<()> {
        let removed = self.store.delete_owned(id, &self.owner_id).await?;
        if !removed {
            tracing::debug!(owner = %self.owner_id, id = %id, "delete matched no owned row");
        }
        Ok(())
    }
}

/// Trim and check a create request. Shared with the sync client's local pre-check.
pub fn validate_new(title: &str, url: &str) -> AppResult<(String, String)> {
    let title = title.trim();
    let url = url.trim();
    if title.is_empty() {
        return Err(AppError::validation("empty_title", "title must not be empty"));
    }
    if url.is_empty() {
        return Err(AppError::validation("empty_url", "url must not be empty"));
    }
    Ok((title.to_string(), url.to_string()))
}
