use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use crate::tprintln;

use super::principal::Identity;

pub type SessionToken = String;

/// The opaque credential pair a browser carries between requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: SessionToken,
    pub refresh_token: SessionToken,
}

/// Result of looking up an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCheck {
    Valid(Identity),
    Expired,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("refresh token is not known")]
    UnknownRefresh,
    #[error("refresh token has expired")]
    RefreshExpired,
    #[error("refresh token was already rotated; session revoked")]
    RefreshReused,
    #[error("no randomness available for tokens: {0}")]
    Entropy(String),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Window in which a just-rotated refresh token still yields the current pair.
    pub refresh_reuse_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            access_ttl: Duration::from_secs(60 * 60),
            refresh_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            refresh_reuse_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct SessionRecord {
    identity: Identity,
    pair: TokenPair,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RotatedEntry {
    session_id: String,
    rotated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionTables {
    sessions: HashMap<String, SessionRecord>,
    /// access token -> session id
    access: HashMap<SessionToken, String>,
    /// current refresh token -> session id
    refresh: HashMap<SessionToken, String>,
    /// retired refresh token -> session it was rotated within
    rotated: HashMap<SessionToken, RotatedEntry>,
    /// identity id -> session ids
    by_identity: HashMap<String, HashSet<String>>,
}

impl SessionTables {
    fn remove_session(&mut self, sid: &str) -> Option<SessionRecord> {
        let rec = self.sessions.remove(sid)?;
        self.access.remove(&rec.pair.access_token);
        self.refresh.remove(&rec.pair.refresh_token);
        self.rotated.retain(|_, r| r.session_id != sid);
        if let Some(set) = self.by_identity.get_mut(&rec.identity.id) {
            set.remove(sid);
            if set.is_empty() { self.by_identity.remove(&rec.identity.id); }
        }
        Some(rec)
    }

    fn session_for_pair(&self, pair: &TokenPair) -> Option<String> {
        self.access.get(&pair.access_token)
            .or_else(|| self.refresh.get(&pair.refresh_token))
            .cloned()
            .or_else(|| self.rotated.get(&pair.refresh_token).map(|r| r.session_id.clone()))
    }
}

/// `len` random bytes, base64url without padding.
pub(crate) fn random_token(len: usize) -> Result<SessionToken, SessionError> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).map_err(|e| SessionError::Entropy(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

fn gen_token() -> Result<SessionToken, SessionError> {
    // 256-bit
    random_token(32)
}

fn gen_pair() -> Result<TokenPair, SessionError> {
    Ok(TokenPair { access_token: gen_token()?, refresh_token: gen_token()? })
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Issues, validates, rotates and revokes session token pairs.
///
/// Cheap to clone; all clones share the same tables.
#[derive(Clone, Default)]
pub struct SessionManager {
    settings: SessionSettings,
    tables: Arc<RwLock<SessionTables>>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings, tables: Arc::new(RwLock::new(SessionTables::default())) }
    }

    pub fn settings(&self) -> &SessionSettings { &self.settings }

    /// Start a new session for `identity` (sign-in).
    pub fn issue(&self, identity: Identity) -> Result<TokenPair, SessionError> {
        let now = Utc::now();
        let sid = gen_token()?;
        let pair = gen_pair()?;
        let rec = SessionRecord {
            identity: identity.clone(),
            pair: pair.clone(),
            access_expires_at: expiry(now, self.settings.access_ttl),
            refresh_expires_at: expiry(now, self.settings.refresh_ttl),
        };
        {
            let mut t = self.tables.write();
            t.access.insert(pair.access_token.clone(), sid.clone());
            t.refresh.insert(pair.refresh_token.clone(), sid.clone());
            t.by_identity.entry(identity.id.clone()).or_default().insert(sid.clone());
            t.sessions.insert(sid.clone(), rec);
        }
        tprintln!("session.issue user={} ttl_secs={}", identity.id, self.settings.access_ttl.as_secs());
        Ok(pair)
    }

    pub fn check_access(&self, token: &str) -> AccessCheck {
        let now = Utc::now();
        let t = self.tables.read();
        let Some(rec) = t.access.get(token).and_then(|sid| t.sessions.get(sid)) else {
            return AccessCheck::Unknown;
        };
        if rec.access_expires_at > now { AccessCheck::Valid(rec.identity.clone()) } else { AccessCheck::Expired }
    }

    /// Rotate a session: the presented refresh token is retired and a fresh pair minted.
    ///
    /// Presenting a retired token inside the reuse interval returns the session's
    /// current pair instead of failing; after that it revokes the session.
    pub fn refresh(&self, refresh_token: &str) -> Result<(TokenPair, Identity), SessionError> {
        let now = Utc::now();
        let mut t = self.tables.write();

        if let Some(sid) = t.refresh.get(refresh_token).cloned() {
            let Some(rec) = t.sessions.get(&sid) else {
                t.refresh.remove(refresh_token);
                return Err(SessionError::UnknownRefresh);
            };
            if rec.refresh_expires_at <= now {
                t.remove_session(&sid);
                return Err(SessionError::RefreshExpired);
            }
            let old = rec.pair.clone();
            let pair = gen_pair()?;
            t.access.remove(&old.access_token);
            t.refresh.remove(&old.refresh_token);
            t.access.insert(pair.access_token.clone(), sid.clone());
            t.refresh.insert(pair.refresh_token.clone(), sid.clone());
            t.rotated.insert(old.refresh_token, RotatedEntry { session_id: sid.clone(), rotated_at: now });
            let access_expires_at = expiry(now, self.settings.access_ttl);
            let identity = match t.sessions.get_mut(&sid) {
                Some(rec) => {
                    rec.pair = pair.clone();
                    rec.access_expires_at = access_expires_at;
                    rec.identity.clone()
                }
                None => return Err(SessionError::UnknownRefresh),
            };
            return Ok((pair, identity));
        }

        let Some(entry) = t.rotated.get(refresh_token) else {
            return Err(SessionError::UnknownRefresh);
        };
        let sid = entry.session_id.clone();
        let within = TimeDelta::from_std(self.settings.refresh_reuse_interval)
            .map(|w| now.signed_duration_since(entry.rotated_at) < w)
            .unwrap_or(false);
        if within {
            if let Some(rec) = t.sessions.get(&sid) {
                if rec.refresh_expires_at > now {
                    return Ok((rec.pair.clone(), rec.identity.clone()));
                }
            }
            t.remove_session(&sid);
            return Err(SessionError::RefreshExpired);
        }
        if let Some(rec) = t.remove_session(&sid) {
            tracing::warn!(target: "session", user = %rec.identity.id, "retired refresh token reused; session revoked");
        }
        Err(SessionError::RefreshReused)
    }

    /// End the session a pair belongs to (sign-out). Works with stale pairs too.
    pub fn revoke(&self, pair: &TokenPair) -> bool {
        let mut t = self.tables.write();
        let Some(sid) = t.session_for_pair(pair) else { return false; };
        match t.remove_session(&sid) {
            Some(rec) => {
                tprintln!("session.revoke user={}", rec.identity.id);
                true
            }
            None => false,
        }
    }

    /// End every session of one identity.
    pub fn revoke_identity(&self, identity_id: &str) -> usize {
        let mut t = self.tables.write();
        let sids: Vec<String> = t.by_identity.get(identity_id).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        let count = sids.iter().filter(|sid| t.remove_session(sid).is_some()).count();
        tprintln!("session.revoke_identity user={} count={}", identity_id, count);
        count
    }

    pub fn active_sessions(&self, identity_id: &str) -> usize {
        self.tables.read().by_identity.get(identity_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Drop sessions whose refresh token expired and retired tokens past the reuse window.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let reuse = TimeDelta::from_std(self.settings.refresh_reuse_interval).unwrap_or(TimeDelta::zero());
        let mut t = self.tables.write();
        let dead: Vec<String> = t.sessions.iter()
            .filter(|(_, rec)| rec.refresh_expires_at <= now)
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in dead.iter() { t.remove_session(sid); }
        t.rotated.retain(|_, r| now.signed_duration_since(r.rotated_at) < reuse);
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity { Identity::new("u-alice", "alice@example.test", "Alice") }

    fn short_access(reuse_secs: u64) -> SessionManager {
        SessionManager::new(SessionSettings {
            access_ttl: Duration::ZERO,
            refresh_ttl: Duration::from_secs(3600),
            refresh_reuse_interval: Duration::from_secs(reuse_secs),
        })
    }

    #[test]
    fn issued_access_token_resolves_identity() {
        let sm = SessionManager::default();
        let pair = sm.issue(alice()).unwrap();
        assert_ne!(pair.access_token, pair.refresh_token);
        assert_eq!(sm.check_access(&pair.access_token), AccessCheck::Valid(alice()));
        assert_eq!(sm.check_access("nope"), AccessCheck::Unknown);
        assert_eq!(sm.active_sessions("u-alice"), 1);
    }

    #[test]
    fn expired_access_refreshes_and_rotates_both_tokens() {
        let sm = short_access(10);
        let pair = sm.issue(alice()).unwrap();
        assert_eq!(sm.check_access(&pair.access_token), AccessCheck::Expired);

        let (rotated, who) = sm.refresh(&pair.refresh_token).expect("refresh");
        assert_eq!(who, alice());
        assert_ne!(rotated.access_token, pair.access_token);
        assert_ne!(rotated.refresh_token, pair.refresh_token);
        // old access token is gone entirely
        assert_eq!(sm.check_access(&pair.access_token), AccessCheck::Unknown);
    }

    #[test]
    fn retired_refresh_inside_reuse_window_returns_current_pair() {
        let sm = short_access(10);
        let pair = sm.issue(alice()).unwrap();
        let (first, _) = sm.refresh(&pair.refresh_token).unwrap();
        let (second, _) = sm.refresh(&pair.refresh_token).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn retired_refresh_outside_reuse_window_revokes_session() {
        let sm = short_access(0);
        let pair = sm.issue(alice()).unwrap();
        let (rotated, _) = sm.refresh(&pair.refresh_token).unwrap();
        assert_eq!(sm.refresh(&pair.refresh_token), Err(SessionError::RefreshReused));
        assert_eq!(sm.refresh(&rotated.refresh_token), Err(SessionError::UnknownRefresh));
        assert_eq!(sm.active_sessions("u-alice"), 0);
    }

    #[test]
    fn expired_refresh_token_fails_and_drops_session() {
        let sm = SessionManager::new(SessionSettings {
            access_ttl: Duration::ZERO,
            refresh_ttl: Duration::ZERO,
            refresh_reuse_interval: Duration::from_secs(10),
        });
        let pair = sm.issue(alice()).unwrap();
        assert_eq!(sm.refresh(&pair.refresh_token), Err(SessionError::RefreshExpired));
        assert_eq!(sm.active_sessions("u-alice"), 0);
    }

    #[test]
    fn revoke_invalidates_both_tokens() {
        let sm = SessionManager::default();
        let pair = sm.issue(alice()).unwrap();
        assert!(sm.revoke(&pair));
        assert_eq!(sm.check_access(&pair.access_token), AccessCheck::Unknown);
        assert_eq!(sm.refresh(&pair.refresh_token), Err(SessionError::UnknownRefresh));
        assert!(!sm.revoke(&pair));
    }

    #[test]
    fn revoke_identity_ends_every_session() {
        let sm = SessionManager::default();
        let a = sm.issue(alice()).unwrap();
        let b = sm.issue(alice()).unwrap();
        let other = sm.issue(Identity::new("u-bob", "bob@example.test", "Bob")).unwrap();
        assert_eq!(sm.revoke_identity("u-alice"), 2);
        assert_eq!(sm.check_access(&a.access_token), AccessCheck::Unknown);
        assert_eq!(sm.check_access(&b.access_token), AccessCheck::Unknown);
        assert!(matches!(sm.check_access(&other.access_token), AccessCheck::Valid(_)));
    }

    #[test]
    fn sweep_removes_dead_sessions() {
        let sm = SessionManager::new(SessionSettings {
            access_ttl: Duration::ZERO,
            refresh_ttl: Duration::ZERO,
            refresh_reuse_interval: Duration::ZERO,
        });
        sm.issue(alice()).unwrap();
        sm.issue(alice()).unwrap();
        assert_eq!(sm.sweep_expired(), 2);
        assert_eq!(sm.active_sessions("u-alice"), 0);
    }

    #[test]
    fn tokens_are_distinct_and_url_safe() {
        let a = random_token(32).unwrap();
        let b = random_token(32).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
