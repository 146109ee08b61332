//! Bookmark API and the live change feed. Every call is scoped to the request's identity.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::feed::Subscription;
use crate::identity::RequestContext;
use crate::storage::{BookmarkId, ScopedBookmarks};

#[derive(Debug, Deserialize)]
pub(super) struct CreatePayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}

fn scoped(state: &AppState, ctx: &RequestContext) -> AppResult<ScopedBookmarks> {
    ScopedBookmarks::for_identity(state.store.clone(), ctx.identity.as_ref())
}

pub(super) async fn me(Extension(ctx): Extension<RequestContext>) -> AppResult<Json<serde_json::Value>> {
    let who = ctx.identity.ok_or_else(AppError::anonymous)?;
    Ok(Json(json!({"status":"ok","identity": who})))
}

pub(super) async fn list(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> AppResult<Json<serde_json::Value>> {
    let bookmarks = scoped(&state, &ctx)?.list().await?;
    Ok(Json(json!({"status":"ok","bookmarks": bookmarks})))
}

pub(super) async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(payload): Json<CreatePayload>,
) -> AppResult<Response> {
    let bookmark = scoped(&state, &ctx)?.create(&payload.title, &payload.url).await?;
    debug!(request_id = %ctx.request_id, id = %bookmark.id, "bookmark created");
    Ok((StatusCode::CREATED, Json(json!({"status":"ok","bookmark": bookmark}))).into_response())
}

/// Deleting an id that is unknown or owned by someone else answers exactly like a real delete.
pub(super) async fn remove(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<BookmarkId>,
) -> AppResult<Json<serde_json::Value>> {
    scoped(&state, &ctx)?.delete(id).await?;
    Ok(Json(json!({"status":"ok"})))
}

/// Subscribe before the upgrade completes so no event between handshake and first poll is missed.
pub(super) async fn feed(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let who = ctx.identity.ok_or_else(AppError::anonymous)?;
    let sub = state.feed.subscribe(&who.id);
    Ok(ws.on_upgrade(move |socket| pump_feed(socket, sub)))
}

async fn pump_feed(mut socket: WebSocket, mut sub: Subscription) {
    loop {
        tokio::select! {
            msg = sub.recv() => {
                let Some(msg) = msg else { break; };
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => { warn!(target: "feed", "feed message encode failed: {}", e); continue; }
                };
                if socket.send(Message::Text(text.into())).await.is_err() { break; }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(target: "feed", owner = %sub.owner_id(), "feed socket closed");
}
