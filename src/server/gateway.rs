//! Per-request access gateway.
//!
//! Runs before routing: resolves the cookie token pair (refreshing when needed),
//! decides from the route policy whether the request may proceed, and writes any
//! rotated tokens back onto the response. Handlers read the outcome from the
//! `RequestContext` extension and never touch tokens themselves.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::{debug, info};

use super::policy::{Protection, RouteEffect};
use super::AppState;
use crate::error::AppError;
use crate::identity::cookies::{self, ACCESS_COOKIE};
use crate::identity::{CookieSettings, RequestContext, Resolution, ResolveOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Redirect,
    Unauthorized,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::Allow => "allow",
            GateDecision::Redirect => "redirect",
            GateDecision::Unauthorized => "unauthorized",
        }
    }
}

/// Pure decision. Public paths always pass; protected ones need an identity.
pub fn decide(protection: Protection, resolution: &Resolution) -> GateDecision {
    match (protection, resolution.identity.is_some()) {
        (Protection::Public, _) | (_, true) => GateDecision::Allow,
        (Protection::Protected(RouteEffect::RequireIdentity), false) => GateDecision::Redirect,
        (Protection::Protected(RouteEffect::RejectAnonymous), false) => GateDecision::Unauthorized,
    }
}

pub async fn access_gateway(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let tokens = cookies::read_token_pair(req.headers());
    let resolution = state.resolver.resolve(tokens.as_ref()).await;
    let path = req.uri().path().to_string();
    let decision = decide(state.policy.classify(&path), &resolution);

    let mut response = match decision {
        GateDecision::Allow => {
            let ctx = RequestContext::new(resolution.identity.clone());
            debug!(target: "gateway", request_id = %ctx.request_id, path = %path, outcome = resolution.outcome.as_str(), "allow");
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        GateDecision::Redirect => {
            info!(target: "gateway", path = %path, outcome = resolution.outcome.as_str(), "anonymous request redirected to {}", state.config.public_root);
            Redirect::temporary(&state.config.public_root).into_response()
        }
        GateDecision::Unauthorized => {
            info!(target: "gateway", path = %path, outcome = resolution.outcome.as_str(), "anonymous request rejected");
            AppError::anonymous().into_response()
        }
    };

    apply_session_cookies(&mut response, &resolution, &state.cookies);
    response
}

/// Carry rotation forward, or drop cookies that can no longer resolve.
/// A handler that set the session cookies itself (sign-in, sign-out) has the last word.
fn apply_session_cookies(response: &mut Response, resolution: &Resolution, cfg: &CookieSettings) {
    let handler_set_session = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with(&format!("{}=", ACCESS_COOKIE)));
    if handler_set_session {
        return;
    }
    if let Some(pair) = resolution.rotated.as_ref() {
        cookies::write_token_pair(response.headers_mut(), pair, cfg);
    } else if resolution.outcome == ResolveOutcome::ExpiredTerminal {
        cookies::clear_token_pair(response.headers_mut(), cfg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn resolved(identity: Option<Identity>) -> Resolution {
        let outcome = if identity.is_some() { ResolveOutcome::Valid } else { ResolveOutcome::Anonymous };
        Resolution { identity, rotated: None, outcome }
    }

    #[test]
    fn decision_table() {
        let who = Some(Identity::new("u1", "u1@example.test", "U"));
        let page = Protection::Protected(RouteEffect::RequireIdentity);
        let api = Protection::Protected(RouteEffect::RejectAnonymous);
        assert_eq!(decide(Protection::Public, &resolved(None)), GateDecision::Allow);
        assert_eq!(decide(Protection::Public, &resolved(who.clone())), GateDecision::Allow);
        assert_eq!(decide(page, &resolved(None)), GateDecision::Redirect);
        assert_eq!(decide(page, &resolved(who.clone())), GateDecision::Allow);
        assert_eq!(decide(api, &resolved(None)), GateDecision::Unauthorized);
        assert_eq!(decide(api, &resolved(who)), GateDecision::Allow);
    }

    #[test]
    fn expired_session_cookies_are_cleared() {
        let mut resp = Response::new(axum::body::Body::empty());
        let res = Resolution { identity: None, rotated: None, outcome: ResolveOutcome::ExpiredTerminal };
        apply_session_cookies(&mut resp, &res, &CookieSettings::default());
        let set: Vec<_> = resp.headers().get_all(header::SET_COOKIE).iter().map(|v| v.to_str().unwrap().to_string()).collect();
        assert_eq!(set.len(), 2);
        assert!(set.iter().all(|c| c.contains("Max-Age=0")));
    }

    #[test]
    fn handler_cookies_are_not_overwritten() {
        let mut resp = Response::new(axum::body::Body::empty());
        cookies::clear_token_pair(resp.headers_mut(), &CookieSettings::default());
        let res = Resolution {
            identity: Some(Identity::new("u1", "", "")),
            rotated: Some(crate::identity::TokenPair { access_token: "a2".into(), refresh_token: "r2".into() }),
            outcome: ResolveOutcome::Refreshed,
        };
        apply_session_cookies(&mut resp, &res, &CookieSettings::default());
        assert_eq!(resp.headers().get_all(header::SET_COOKIE).iter().count(), 2);
    }
}
