use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::Url;
use serde::Deserialize;

use super::principal::Identity;
use super::session::random_token;
use crate::error::{AppError, AppResult};

/// The external party that proves who a user is. Sign-in hands off to it and
/// comes back through the callback with a one-time code.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Where the browser goes to authenticate.
    fn authorize_url(&self, state: &str, redirect_uri: &str, login_hint: Option<&str>) -> AppResult<String>;

    /// Trade the callback code for the authenticated identity.
    async fn exchange(&self, code: &str, redirect_uri: &str) -> AppResult<Identity>;
}

/// Local directory of known users. The authorize step is skipped: the browser is sent
/// straight back to the callback with the user's email as the code.
#[derive(Debug, Clone, Default)]
pub struct DevIdentityProvider {
    users: BTreeMap<String, Identity>,
}

impl DevIdentityProvider {
    pub fn new() -> Self { Self::default() }

    pub fn with_user(mut self, email: &str, display_name: &str) -> Self {
        let email = email.trim().to_ascii_lowercase();
        let identity = Identity::new(format!("dev:{}", email), email.clone(), display_name);
        self.users.insert(email, identity);
        self
    }

    pub fn users(&self) -> impl Iterator<Item = &Identity> { self.users.values() }
}

#[async_trait]
impl IdentityProvider for DevIdentityProvider {
    fn name(&self) -> &str { "dev" }

    fn authorize_url(&self, state: &str, redirect_uri: &str, login_hint: Option<&str>) -> AppResult<String> {
        let email = match login_hint {
            Some(h) if !h.trim().is_empty() => h.trim().to_ascii_lowercase(),
            _ => self.users.keys().next().cloned()
                .ok_or_else(|| AppError::validation("no_dev_users", "no development users configured"))?,
        };
        Ok(format!(
            "{}?code={}&state={}",
            redirect_uri,
            urlencoding::encode(&email),
            urlencoding::encode(state)
        ))
    }

    async fn exchange(&self, code: &str, _redirect_uri: &str) -> AppResult<Identity> {
        self.users
            .get(&code.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| AppError::auth("unknown_user", "no such development user"))
    }
}

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize: String,
    pub token: String,
    pub userinfo: String,
}

impl OAuthEndpoints {
    pub fn google() -> Self {
        Self {
            authorize: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token: "https://oauth2.googleapis.com/token".into(),
            userinfo: "https://openidconnect.googleapis.com/v1/userinfo".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
}

/// Authorization-code flow against an OpenID Connect style provider.
#[derive(Clone)]
pub struct OAuthIdentityProvider {
    pub client_id: String,
    client_secret: String,
    pub endpoints: OAuthEndpoints,
    pub scope: String,
    http: reqwest::Client,
}

impl OAuthIdentityProvider {
    pub fn new(client_id: String, client_secret: String, endpoints: OAuthEndpoints) -> Self {
        Self {
            client_id,
            client_secret,
            endpoints,
            scope: "openid email profile".into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for OAuthIdentityProvider {
    fn name(&self) -> &str { "oauth" }

    fn authorize_url(&self, state: &str, redirect_uri: &str, login_hint: Option<&str>) -> AppResult<String> {
        let mut url = Url::parse(&self.endpoints.authorize)
            .map_err(|e| AppError::internal("bad_authorize_endpoint".to_string(), e.to_string()))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.scope)
                .append_pair("state", state);
            if let Some(hint) = login_hint { q.append_pair("login_hint", hint); }
        }
        Ok(url.to_string())
    }

    async fn exchange(&self, code: &str, redirect_uri: &str) -> AppResult<Identity> {
        let resp = self.http
            .post(&self.endpoints.token)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::upstream("token_exchange_failed".to_string(), e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::auth("code_rejected".to_string(), format!("token endpoint answered HTTP {}", resp.status())));
        }
        let token: TokenResponse = resp.json().await
            .map_err(|e| AppError::upstream("token_response_invalid".to_string(), e.to_string()))?;

        let info: UserInfo = self.http
            .get(&self.endpoints.userinfo)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::upstream("userinfo_failed".to_string(), e.to_string()))?
            .json()
            .await
            .map_err(|e| AppError::upstream("userinfo_invalid".to_string(), e.to_string()))?;
        Ok(Identity::new(info.sub, info.email, info.name))
    }
}

/// Outstanding sign-in attempts keyed by their `state` value. Each state is single use.
#[derive(Clone)]
pub struct PendingSignIns {
    ttl: Duration,
    states: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl Default for PendingSignIns {
    fn default() -> Self { Self::new(Duration::from_secs(10 * 60)) }
}

impl PendingSignIns {
    pub fn new(ttl: Duration) -> Self { Self { ttl, states: Arc::new(Mutex::new(HashMap::new())) } }

    /// How long a started sign-in stays completable.
    pub fn ttl(&self) -> Duration { self.ttl }

    pub fn begin(&self) -> AppResult<String> {
        let state = random_token(16)?;
        self.states.lock().insert(state.clone(), Utc::now());
        Ok(state)
    }

    /// Consume a state. False for unknown, replayed or stale values.
    pub fn complete(&self, state: &str) -> bool {
        let Some(started) = self.states.lock().remove(state) else { return false; };
        TimeDelta::from_std(self.ttl)
            .map(|ttl| Utc::now().signed_duration_since(started) < ttl)
            .unwrap_or(true)
    }

    pub fn sweep_expired(&self) -> usize {
        let Ok(ttl) = TimeDelta::from_std(self.ttl) else { return 0; };
        let now = Utc::now();
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, started| now.signed_duration_since(*started) < ttl);
        before - states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_provider_round_trips_through_callback() {
        let p = DevIdentityProvider::new().with_user("Alice@Example.test", "Alice");
        let url = p.authorize_url("st8", "http://localhost/auth/callback", None).unwrap();
        assert_eq!(url, "http://localhost/auth/callback?code=alice%40example.test&state=st8");
        let who = p.exchange("alice@example.test", "").await.unwrap();
        assert_eq!(who.id, "dev:alice@example.test");
        assert_eq!(who.display_name, "Alice");
        assert!(p.exchange("mallory@example.test", "").await.is_err());
    }

    #[test]
    fn dev_provider_without_users_refuses() {
        assert!(DevIdentityProvider::new().authorize_url("s", "/cb", None).is_err());
    }

    #[test]
    fn oauth_authorize_url_carries_flow_parameters() {
        let p = OAuthIdentityProvider::new("client-1".into(), "secret".into(), OAuthEndpoints::google());
        let url = Url::parse(&p.authorize_url("abc", "https://app.test/auth/callback", Some("a@b.test")).unwrap()).unwrap();
        let q: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["client_id"], "client-1");
        assert_eq!(q["redirect_uri"], "https://app.test/auth/callback");
        assert_eq!(q["state"], "abc");
        assert_eq!(q["login_hint"], "a@b.test");
        assert!(!url.as_str().contains("secret"));
    }

    #[test]
    fn sign_in_state_is_single_use() {
        let pending = PendingSignIns::default();
        let st = pending.begin().unwrap();
        assert!(pending.complete(&st));
        assert!(!pending.complete(&st));
        assert!(!pending.complete("forged"));
    }

    #[test]
    fn stale_sign_in_state_is_rejected() {
        let pending = PendingSignIns::new(Duration::ZERO);
        let st = pending.begin().unwrap();
        assert!(!pending.complete(&st));
        pending.begin().unwrap();
        assert_eq!(pending.sweep_expired(), 1);
    }
}
