//!
//! smartmark server configuration
//! -------------------------------
//! Defaults, overridden by `SMARTMARK_*` environment variables, overridden by
//! command-line flags. Parsing is deliberately plain: a handful of scalar
//! settings plus the protected-prefix rules.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::identity::{OAuthEndpoints, SessionSettings};
use crate::server::policy::{parse_rules, RouteEffect};

pub const HELP: &str = "smartmark\n\nUSAGE:\n  smartmark [--http-port N] [--bind ADDR] [--public-url URL] [--protect PREFIX=EFFECT]... [--snapshot PATH] [--insecure-cookies]\n\nOPTIONS:\n  --http-port N        HTTP port (env: SMARTMARK_HTTP_PORT, default 3000)\n  --bind ADDR          Bind address (env: SMARTMARK_BIND, default 0.0.0.0)\n  --public-url URL     Externally visible base URL, used for the sign-in callback (env: SMARTMARK_PUBLIC_URL)\n  --protect P=E        Protected prefix rule; E is require-identity or reject-anonymous. Repeatable; replaces the defaults\n                       (env: SMARTMARK_PROTECTED, comma separated, default /dashboard=require-identity,/api=reject-anonymous)\n  --snapshot PATH      Persist bookmarks to a snapshot file (env: SMARTMARK_SNAPSHOT)\n  --insecure-cookies   Omit the Secure cookie attribute, for plain-http development (env: SMARTMARK_SECURE_COOKIES=false)\n\nSESSION (env only):\n  SMARTMARK_ACCESS_TTL_SECS (3600), SMARTMARK_REFRESH_TTL_SECS (2592000), SMARTMARK_REFRESH_REUSE_SECS (10)\n\nIDENTITY PROVIDER (env only):\n  SMARTMARK_PROVIDER          dev | google | oauth (default dev)\n  SMARTMARK_DEV_USERS         email:Name,... for the dev provider\n  SMARTMARK_OAUTH_CLIENT_ID, SMARTMARK_OAUTH_CLIENT_SECRET\n  SMARTMARK_OAUTH_AUTHORIZE_URL, SMARTMARK_OAUTH_TOKEN_URL, SMARTMARK_OAUTH_USERINFO_URL (oauth only)\n";

#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Dev { users: Vec<(String, String)> },
    OAuth { client_id: String, client_secret: String, endpoints: OAuthEndpoints },
}

impl ProviderConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::Dev { .. } => "dev",
            ProviderConfig::OAuth { .. } => "oauth",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub http_port: u16,
    /// Where anonymous visitors of protected pages are sent.
    pub public_root: String,
    /// Landing page after a completed sign-in.
    pub after_sign_in: String,
    /// Externally visible base URL. Without it the callback URI is relative.
    pub public_url: Option<String>,
    pub protected: Vec<(String, RouteEffect)>,
    pub sessions: SessionSettings,
    pub secure_cookies: bool,
    pub snapshot_path: Option<PathBuf>,
    pub provider: ProviderConfig,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            http_port: 3000,
            public_root: "/".into(),
            after_sign_in: "/dashboard".into(),
            public_url: None,
            protected: default_protected(),
            sessions: SessionSettings::default(),
            secure_cookies: true,
            snapshot_path: None,
            provider: ProviderConfig::Dev { users: Vec::new() },
            sweep_interval: Duration::from_secs(60),
        }
    }
}

pub fn default_protected() -> Vec<(String, RouteEffect)> {
    vec![
        ("/dashboard".to_string(), RouteEffect::RequireIdentity),
        ("/api".to_string(), RouteEffect::RejectAnonymous),
    ]
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(|s| s.as_str())
}

fn arg_values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2).filter(|w| w[0] == flag).map(|w| w[1].as_str()).collect()
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_dev_users(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .map(|e| match e.split_once(':') {
            Some((email, name)) => (email.trim().to_string(), name.trim().to_string()),
            None => (e.to_string(), String::new()),
        })
        .collect()
}

impl ServerConfig {
    /// Build from the process environment and arguments.
    pub fn load(args: &[String]) -> Result<Self> {
        Self::from_sources(|k| std::env::var(k).ok(), args)
    }

    /// Build from an arbitrary variable lookup; CLI arguments win over variables.
    pub fn from_sources<F>(env: F, args: &[String]) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = ServerConfig::default();

        let secs = |name: &str| -> Result<Option<Duration>> {
            match env(name) {
                Some(v) => v.trim().parse::<u64>().map(|n| Some(Duration::from_secs(n)))
                    .map_err(|_| anyhow!("{} must be a number of seconds, got '{}'", name, v)),
                None => Ok(None),
            }
        };

        if let Some(p) = env("SMARTMARK_HTTP_PORT") {
            cfg.http_port = p.trim().parse().map_err(|_| anyhow!("SMARTMARK_HTTP_PORT is not a port: '{}'", p))?;
        }
        if let Some(b) = env("SMARTMARK_BIND") { cfg.bind_addr = b; }
        if let Some(u) = env("SMARTMARK_PUBLIC_URL") { cfg.public_url = Some(u); }
        if let Some(rules) = env("SMARTMARK_PROTECTED") { cfg.protected = parse_rules(&rules)?; }
        if let Some(v) = env("SMARTMARK_SECURE_COOKIES") {
            cfg.secure_cookies = parse_bool(&v).ok_or_else(|| anyhow!("SMARTMARK_SECURE_COOKIES must be a boolean"))?;
        }
        if let Some(p) = env("SMARTMARK_SNAPSHOT") { cfg.snapshot_path = Some(PathBuf::from(p)); }
        if let Some(d) = secs("SMARTMARK_ACCESS_TTL_SECS")? { cfg.sessions.access_ttl = d; }
        if let Some(d) = secs("SMARTMARK_REFRESH_TTL_SECS")? { cfg.sessions.refresh_ttl = d; }
        if let Some(d) = secs("SMARTMARK_REFRESH_REUSE_SECS")? { cfg.sessions.refresh_reuse_interval = d; }

        cfg.provider = match env("SMARTMARK_PROVIDER").as_deref().map(str::trim).unwrap_or("dev") {
            "dev" => ProviderConfig::Dev { users: env("SMARTMARK_DEV_USERS").map(|s| parse_dev_users(&s)).unwrap_or_default() },
            kind @ ("google" | "oauth") => {
                let client_id = env("SMARTMARK_OAUTH_CLIENT_ID").ok_or_else(|| anyhow!("SMARTMARK_OAUTH_CLIENT_ID is required for provider '{}'", kind))?;
                let client_secret = env("SMARTMARK_OAUTH_CLIENT_SECRET").ok_or_else(|| anyhow!("SMARTMARK_OAUTH_CLIENT_SECRET is required for provider '{}'", kind))?;
                let endpoints = if kind == "google" {
                    OAuthEndpoints::google()
                } else {
                    let need = |k: &str| env(k).ok_or_else(|| anyhow!("{} is required for provider 'oauth'", k));
                    OAuthEndpoints {
                        authorize: need("SMARTMARK_OAUTH_AUTHORIZE_URL")?,
                        token: need("SMARTMARK_OAUTH_TOKEN_URL")?,
                        userinfo: need("SMARTMARK_OAUTH_USERINFO_URL")?,
                    }
                };
                ProviderConfig::OAuth { client_id, client_secret, endpoints }
            }
            other => bail!("unknown SMARTMARK_PROVIDER '{}'", other),
        };

        // CLI arguments override environment
        if let Some(p) = arg_value(args, "--http-port") {
            cfg.http_port = p.parse().map_err(|_| anyhow!("--http-port is not a port: '{}'", p))?;
        }
        if let Some(b) = arg_value(args, "--bind") { cfg.bind_addr = b.to_string(); }
        if let Some(u) = arg_value(args, "--public-url") { cfg.public_url = Some(u.to_string()); }
        if let Some(p) = arg_value(args, "--snapshot") { cfg.snapshot_path = Some(PathBuf::from(p)); }
        let protect = arg_values(args, "--protect");
        if !protect.is_empty() { cfg.protected = parse_rules(&protect.join(","))?; }
        if has_flag(args, "--insecure-cookies") { cfg.secure_cookies = false; }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.public_root.starts_with('/') {
            bail!("public root must be an absolute path, got '{}'", self.public_root);
        }
        if let ProviderConfig::OAuth { .. } = self.provider {
            if self.public_url.is_none() {
                bail!("an OAuth provider needs SMARTMARK_PUBLIC_URL / --public-url for its callback");
            }
        }
        Ok(())
    }

    /// Absolute or relative URI the identity provider sends the browser back to.
    pub fn callback_uri(&self) -> String {
        match self.public_url.as_deref() {
            Some(base) => format!("{}/auth/callback", base.trim_end_matches('/')),
            None => "/auth/callback".to_string(),
        }
    }
}
