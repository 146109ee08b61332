//! Cookie transport for the session token pair. No decisions are made here.

use axum::http::{header, HeaderMap, HeaderValue};

use super::session::TokenPair;

pub const ACCESS_COOKIE: &str = "smartmark_access";
pub const REFRESH_COOKIE: &str = "smartmark_refresh";
/// Binds a started sign-in to the browser that started it.
pub const SIGN_IN_COOKIE: &str = "smartmark_signin";
const SIGN_IN_PATH: &str = "/auth";

#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub secure: bool,
    /// Lifetime the browser keeps both cookies; the refresh TTL.
    pub max_age_secs: u64,
}

impl Default for CookieSettings {
    fn default() -> Self { Self { secure: true, max_age_secs: 30 * 24 * 60 * 60 } }
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all(header::COOKIE).iter() {
        let Ok(s) = cookie.to_str() else { continue; };
        for part in s.split(';') {
            let p = part.trim();
            if let Some((k, v)) = p.split_once('=') {
                if k == name && !v.is_empty() { return Some(v.to_string()); }
            }
        }
    }
    None
}

/// Read whatever half of the pair is present; a missing access token is still refreshable.
pub fn read_token_pair(headers: &HeaderMap) -> Option<TokenPair> {
    let access = parse_cookie(headers, ACCESS_COOKIE);
    let refresh = parse_cookie(headers, REFRESH_COOKIE);
    if access.is_none() && refresh.is_none() { return None; }
    Some(TokenPair {
        access_token: access.unwrap_or_default(),
        refresh_token: refresh.unwrap_or_default(),
    })
}

fn cookie_value(name: &str, value: &str, max_age: u64, path: &str, cfg: &CookieSettings) -> Option<HeaderValue> {
    let secure = if cfg.secure { "; Secure" } else { "" };
    HeaderValue::from_str(&format!("{}={}; Max-Age={}; HttpOnly; SameSite=Lax; Path={}{}", name, value, max_age, path, secure)).ok()
}

pub fn write_token_pair(headers: &mut HeaderMap, pair: &TokenPair, cfg: &CookieSettings) {
    for (name, value) in [(ACCESS_COOKIE, &pair.access_token), (REFRESH_COOKIE, &pair.refresh_token)] {
        if let Some(v) = cookie_value(name, value, cfg.max_age_secs, "/", cfg) {
            headers.append(header::SET_COOKIE, v);
        }
    }
}

pub fn clear_token_pair(headers: &mut HeaderMap, cfg: &CookieSettings) {
    for name in [ACCESS_COOKIE, REFRESH_COOKIE] {
        if let Some(v) = cookie_value(name, "deleted", 0, "/", cfg) {
            headers.append(header::SET_COOKIE, v);
        }
    }
}

pub fn write_sign_in_state(headers: &mut HeaderMap, state: &str, max_age_secs: u64, cfg: &CookieSettings) {
    if let Some(v) = cookie_value(SIGN_IN_COOKIE, state, max_age_secs, SIGN_IN_PATH, cfg) {
        headers.append(header::SET_COOKIE, v);
    }
}

pub fn clear_sign_in_state(headers: &mut HeaderMap, cfg: &CookieSettings) {
    if let Some(v) = cookie_value(SIGN_IN_COOKIE, "deleted", 0, SIGN_IN_PATH, cfg) {
        headers.append(header::SET_COOKIE, v);
    }
}
