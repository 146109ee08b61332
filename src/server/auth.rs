//! Sign-in, provider callback and sign-out.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use tracing::{info, warn};

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::identity::cookies;

#[derive(Debug, Deserialize)]
pub(super) struct SignInParams {
    login_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Start the external sign-in: remember a one-time state, pin it to this browser with a
/// short-lived cookie and hand the browser to the provider.
pub(super) async fn sign_in(State(state): State<AppState>, Query(params): Query<SignInParams>) -> AppResult<Response> {
    let st = state.sign_ins.begin()?;
    let url = state
        .provider
        .authorize_url(&st, &state.config.callback_uri(), params.login_hint.as_deref())?;
    info!(target: "session", provider = state.provider.name(), "sign-in started");
    let mut headers = HeaderMap::new();
    cookies::write_sign_in_state(&mut headers, &st, state.sign_ins.ttl().as_secs(), &state.cookies);
    Ok((headers, Redirect::to(&url)).into_response())
}

pub(super) async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> AppResult<Response> {
    if let Some(err) = params.error {
        warn!(target: "session", provider = state.provider.name(), "provider refused sign-in: {}", err);
        return Err(AppError::auth("sign_in_refused".to_string(), format!("identity provider answered '{}'", err)));
    }
    let st = params.state.unwrap_or_default();
    // the state must come back to the same browser that started the sign-in
    let pinned = cookies::parse_cookie(&headers, cookies::SIGN_IN_COOKIE);
    if pinned.as_deref() != Some(st.as_str()) {
        warn!(target: "session", "callback state does not match this browser's sign-in");
        return Err(AppError::csrf("bad_state", "sign-in was not started from this browser"));
    }
    if !state.sign_ins.complete(&st) {
        return Err(AppError::csrf("bad_state", "unknown or expired sign-in attempt"));
    }
    let code = params.code.filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::validation("missing_code", "callback without authorization code"))?;

    let identity = state.provider.exchange(&code, &state.config.callback_uri()).await?;
    let pair = state.sessions().issue(identity.clone())?;
    info!(target: "session", user = %identity.id, "signed in");

    let mut out = HeaderMap::new();
    cookies::write_token_pair(&mut out, &pair, &state.cookies);
    cookies::clear_sign_in_state(&mut out, &state.cookies);
    Ok((out, Redirect::to(&state.config.after_sign_in)).into_response())
}

/// Revoke the presented session (if any), clear the cookies and go back to the public root.
/// Anonymous sign-out behaves the same.
pub(super) async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(pair) = cookies::read_token_pair(&headers) {
        if state.sessions().revoke(&pair) {
            info!(target: "session", "signed out");
        }
    }
    let mut out = HeaderMap::new();
    cookies::clear_token_pair(&mut out, &state.cookies);
    (out, Redirect::to(&state.config.public_root)).into_response()
}
