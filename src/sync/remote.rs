//! Backend talking to a smartmark server over HTTP, with the change feed on a WebSocket.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::backend::{BookmarkBackend, FeedStream};
use crate::error::{AppError, AppResult};
use crate::feed::FeedMessage;
use crate::identity::Identity;
use crate::storage::{Bookmark, BookmarkId};

#[derive(Clone)]
pub struct RemoteBackend {
    base: Url,
    client: reqwest::Client,
    jar: Arc<Jar>,
}

impl RemoteBackend {
    pub fn new(base: &str) -> AppResult<Self> {
        let base = Url::parse(base).map_err(|e| AppError::validation("invalid_base_url".to_string(), e.to_string()))?;
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder().cookie_provider(jar.clone()).build()?;
        Ok(Self { base, client, jar })
    }

    fn url(&self, path: &str) -> AppResult<Url> {
        self.base.join(path).map_err(|e| AppError::validation("invalid_path".to_string(), e.to_string()))
    }

    fn ws_url(&self, path: &str) -> AppResult<Url> {
        let mut ws = self.url(path)?;
        let scheme = if ws.scheme() == "https" { "wss" } else { "ws" };
        ws.set_scheme(scheme).map_err(|_| AppError::internal("ws_scheme", "cannot derive websocket url"))?;
        Ok(ws)
    }

    /// The session cookies as a `Cookie` header, for the WebSocket handshake.
    fn cookie_header(&self) -> Option<String> {
        self.jar.cookies(&self.base).and_then(|v| v.to_str().ok().map(|s| s.to_string()))
    }

    /// Run the sign-in redirect chain (provider and callback included) and report who we became.
    pub async fn sign_in(&self, login_hint: Option<&str>) -> AppResult<Identity> {
        let mut url = self.url("/auth/sign-in")?;
        if let Some(hint) = login_hint {
            url.query_pairs_mut().append_pair("login_hint", hint);
        }
        check(self.client.get(url).send().await?).await?;
        self.me().await?.ok_or_else(|| AppError::auth("sign_in_incomplete", "sign-in finished without a session"))
    }

    pub async fn sign_out(&self) -> AppResult<()> {
        check(self.client.post(self.url("/auth/sign-out")?).send().await?).await?;
        Ok(())
    }

    /// `None` when the server sees no identity.
    pub async fn me(&self) -> AppResult<Option<Identity>> {
        let resp = self.client.get(self.url("/api/me")?).send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let body: serde_json::Value = check(resp).await?.json().await?;
        field(body, "identity").map(Some)
    }
}

async fn check(resp: Response) -> AppResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::json!({}));
    Err(AppError::from_wire(status.as_u16(), &body))
}

fn field<T: DeserializeOwned>(mut body: serde_json::Value, name: &str) -> AppResult<T> {
    let v = body.get_mut(name).map(serde_json::Value::take)
        .ok_or_else(|| AppError::upstream("bad_response".to_string(), format!("response has no '{}'", name)))?;
    serde_json::from_value(v).map_err(|e| AppError::upstream("bad_response".to_string(), e.to_string()))
}

fn feed_connect_error(e: WsError) -> AppError {
    match e {
        WsError::Http(resp) if resp.status() == 401 => AppError::anonymous(),
        other => AppError::io("feed_connect_failed".to_string(), other.to_string()),
    }
}

#[async_trait]
impl BookmarkBackend for RemoteBackend {
    async fn list(&self) -> AppResult<Vec<Bookmark>> {
        let resp = check(self.client.get(self.url("/api/bookmarks")?).send().await?).await?;
        field(resp.json().await?, "bookmarks")
    }

    async fn create(&self, title: &str, url: &str) -> AppResult<Bookmark> {
        let resp = self.client
            .post(self.url("/api/bookmarks")?)
            .json(&serde_json::json!({"title": title, "url": url}))
            .send()
            .await?;
        field(check(resp).await?.json().await?, "bookmark")
    }

    async fn delete(&self, id: BookmarkId) -> AppResult<()> {
        let resp = self.client.delete(self.url(&format!("/api/bookmarks/{}", id))?).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn subscribe(&self) -> AppResult<FeedStream> {
        let ws_url = self.ws_url("/api/bookmarks/feed")?;
        let mut req = ws_url.as_str().into_client_request().map_err(feed_connect_error)?;
        if let Some(cookie) = self.cookie_header() {
            let value = WsHeaderValue::from_str(&cookie)
                .map_err(|e| AppError::internal("bad_cookie_header".to_string(), e.to_string()))?;
            req.headers_mut().insert("cookie", value);
        }
        let (stream, resp) = tokio_tungstenite::connect_async(req).await.map_err(feed_connect_error)?;
        // the handshake may have rotated the session
        let rotated: Vec<reqwest::header::HeaderValue> = resp
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| reqwest::header::HeaderValue::from_bytes(v.as_bytes()).ok())
            .collect();
        if !rotated.is_empty() {
            self.jar.set_cookies(&mut rotated.iter(), &self.base);
        }
        let messages = stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<FeedMessage>(&text) {
                    Ok(m) => Some(Ok(m)),
                    Err(e) => {
                        tracing::warn!(target: "sync", "unreadable feed message: {}", e);
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(AppError::io("feed_transport".to_string(), e.to_string()))),
            }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_http_scheme() {
        let plain = RemoteBackend::new("http://127.0.0.1:3000").unwrap();
        assert_eq!(plain.ws_url("/api/bookmarks/feed").unwrap().as_str(), "ws://127.0.0.1:3000/api/bookmarks/feed");
        let tls = RemoteBackend::new("https://marks.example.test/").unwrap();
        assert_eq!(tls.ws_url("/api/bookmarks/feed").unwrap().as_str(), "wss://marks.example.test/api/bookmarks/feed");
    }

    #[test]
    fn rejects_unparseable_base() {
        assert!(RemoteBackend::new("not a url").is_err());
    }

    #[test]
    fn missing_response_field_is_upstream_error() {
        let err = field::<Vec<Bookmark>>(serde_json::json!({"status":"ok"}), "bookmarks").unwrap_err();
        assert_eq!(err.http_status(), 502);
    }
}
