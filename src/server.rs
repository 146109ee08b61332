//!
//! smartmark HTTP/WS server
//! -------------------------
//! Axum application for the bookmark manager.
//!
//! Responsibilities:
//! - Access gateway in front of every route (session resolution, refresh, route policy).
//! - Sign-in through an external identity provider, sign-out, session cookies.
//! - Owner-scoped bookmark API and a per-identity WebSocket change feed.
//! - Background sweeping of expired sessions and abandoned sign-in attempts.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::Extension;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use tracing::info;

use crate::config::{ProviderConfig, ServerConfig};
use crate::error::{AppError, AppResult};
use crate::feed::ChangeFeed;
use crate::identity::{
    CookieSettings, DevIdentityProvider, IdentityProvider, OAuthIdentityProvider, PendingSignIns, RequestContext,
    SessionManager, SessionResolver,
};
use crate::storage::{MemoryBookmarkStore, SharedStore};

pub mod policy;
pub mod gateway;
mod auth;
mod bookmarks;

use policy::RoutePolicy;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub resolver: SessionResolver,
    pub store: SharedStore,
    pub feed: ChangeFeed,
    pub provider: Arc<dyn IdentityProvider>,
    pub sign_ins: PendingSignIns,
    pub policy: Arc<RoutePolicy>,
    pub cookies: CookieSettings,
}

impl AppState {
    /// Wire the state from configuration, using the configured provider.
    pub fn from_config(config: ServerConfig) -> anyhow::Result<Self> {
        let provider = build_provider(&config);
        Self::new(config, provider)
    }

    pub fn new(config: ServerConfig, provider: Arc<dyn IdentityProvider>) -> anyhow::Result<Self> {
        let feed = ChangeFeed::default();
        let store: SharedStore = match config.snapshot_path.as_ref() {
            Some(path) => Arc::new(
                MemoryBookmarkStore::with_snapshot(feed.clone(), path)
                    .with_context(|| format!("While opening bookmark snapshot {}", path.display()))?,
            ),
            None => Arc::new(MemoryBookmarkStore::new(feed.clone())),
        };
        let cookies = CookieSettings {
            secure: config.secure_cookies,
            max_age_secs: config.sessions.refresh_ttl.as_secs(),
        };
        Ok(Self {
            resolver: SessionResolver::new(SessionManager::new(config.sessions.clone())),
            store,
            feed,
            provider,
            sign_ins: PendingSignIns::default(),
            policy: Arc::new(RoutePolicy::new(config.protected.clone())),
            cookies,
            config: Arc::new(config),
        })
    }

    pub fn sessions(&self) -> &SessionManager { self.resolver.sessions() }
}

pub fn build_provider(config: &ServerConfig) -> Arc<dyn IdentityProvider> {
    match &config.provider {
        ProviderConfig::Dev { users } => {
            let dev = users.iter().fold(DevIdentityProvider::new(), |p, (email, name)| p.with_user(email, name));
            Arc::new(dev)
        }
        ProviderConfig::OAuth { client_id, client_secret, endpoints } => {
            Arc::new(OAuthIdentityProvider::new(client_id.clone(), client_secret.clone(), endpoints.clone()))
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/about", get(about))
        .route("/dashboard", get(dashboard))
        .route("/dashboard/{*rest}", get(dashboard))
        .route("/auth/sign-in", get(auth::sign_in))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/sign-out", post(auth::sign_out))
        .route("/api/me", get(bookmarks::me))
        .route("/api/bookmarks", get(bookmarks::list).post(bookmarks::create))
        .route("/api/bookmarks/feed", get(bookmarks::feed))
        .route("/api/bookmarks/{id}", delete(bookmarks::remove))
        .layer(middleware::from_fn_with_state(state.clone(), gateway::access_gateway))
        .with_state(state)
}

fn log_startup(config: &ServerConfig) {
    info!(target: "startup", "listen: {}:{}", config.bind_addr, config.http_port);
    info!(target: "startup", "identity provider: {}", config.provider.kind());
    for (prefix, effect) in config.protected.iter() {
        info!(target: "startup", "protected: {} -> {}", prefix, effect);
    }
    match config.snapshot_path.as_ref() {
        Some(p) => info!(target: "startup", "bookmark snapshot: {}", p.display()),
        None => info!(target: "startup", "bookmark snapshot: none (in-memory only)"),
    }
    if !config.secure_cookies {
        tracing::warn!(target: "startup", "session cookies are sent without the Secure attribute");
    }
}

/// Periodically drop expired sessions and abandoned sign-in attempts.
pub fn spawn_sweeper(state: &AppState) -> tokio::task::JoinHandle<()> {
    let sessions = state.sessions().clone();
    let sign_ins = state.sign_ins.clone();
    let every = state.config.sweep_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let sessions_removed = sessions.sweep_expired();
            let states_removed = sign_ins.sweep_expired();
            if sessions_removed + states_removed > 0 {
                tracing::debug!(target: "session", sessions_removed, states_removed, "sweep");
            }
        }
    })
}

/// Serve on an already bound listener. Used by `run` and by tests that need an ephemeral port.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let sweeper = spawn_sweeper(&state);
    let app = build_router(state);
    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;
    Ok(())
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    log_startup(&config);
    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.http_port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind_addr, config.http_port))?;
    let state = AppState::from_config(config)?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state).await
}

async fn home(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "app": "smartmark",
        "signed_in": ctx.identity.is_some(),
        "sign_in": "/auth/sign-in",
    }))
}

async fn about() -> &'static str {
    "smartmark: private bookmarks, synced live across your tabs"
}

/// Every page under the dashboard prefix. The gateway already required an identity;
/// the handler still refuses to render without one.
async fn dashboard(Extension(ctx): Extension<RequestContext>, uri: Uri) -> AppResult<Json<serde_json::Value>> {
    let who = ctx.identity.as_ref().ok_or_else(AppError::anonymous)?;
    Ok(Json(json!({
        "status": "ok",
        "page": uri.path(),
        "welcome": who.greeting_name(),
        "email": who.email,
    })))
}
