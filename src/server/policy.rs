//! Which paths need an identity, and what happens to anonymous requests for them.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEffect {
    /// Pages: send the browser to the public root.
    RequireIdentity,
    /// API calls: answer 401 with a JSON error body.
    RejectAnonymous,
}

impl RouteEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteEffect::RequireIdentity => "require-identity",
            RouteEffect::RejectAnonymous => "reject-anonymous",
        }
    }
}

impl fmt::Display for RouteEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for RouteEffect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "require-identity" | "redirect" => Ok(RouteEffect::RequireIdentity),
            "reject-anonymous" | "reject" | "401" => Ok(RouteEffect::RejectAnonymous),
            other => Err(anyhow!("unknown route effect '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Public,
    Protected(RouteEffect),
}

/// Parse `PREFIX=EFFECT[,PREFIX=EFFECT...]`.
pub fn parse_rules(s: &str) -> anyhow::Result<Vec<(String, RouteEffect)>> {
    let mut out = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((prefix, effect)) = part.split_once('=') else {
            bail!("protected rule '{}' is not PREFIX=EFFECT", part);
        };
        let prefix = normalize_prefix(prefix)?;
        out.push((prefix, effect.parse()?));
    }
    Ok(out)
}

fn normalize_prefix(raw: &str) -> anyhow::Result<String> {
    let p = raw.trim();
    if !p.starts_with('/') {
        bail!("protected prefix '{}' must start with '/'", p);
    }
    let trimmed = p.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
}

/// Static prefix rules. Matching is by whole path segment, and the longest prefix wins.
#[derive(Debug, Clone, Default)]
pub struct RoutePolicy {
    rules: Vec<(String, RouteEffect)>,
}

impl RoutePolicy {
    pub fn new(rules: impl IntoIterator<Item = (String, RouteEffect)>) -> Self {
        let mut rules: Vec<(String, RouteEffect)> = rules.into_iter().collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { rules }
    }

    pub fn rules(&self) -> &[(String, RouteEffect)] { &self.rules }

    pub fn classify(&self, path: &str) -> Protection {
        self.rules
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, effect)| Protection::Protected(*effect))
            .unwrap_or(Protection::Public)
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_protected;

    #[test]
    fn default_rules_classify_pages_and_api() {
        let p = RoutePolicy::new(default_protected());
        assert_eq!(p.classify("/dashboard"), Protection::Protected(RouteEffect::RequireIdentity));
        assert_eq!(p.classify("/dashboard/settings"), Protection::Protected(RouteEffect::RequireIdentity));
        assert_eq!(p.classify("/api/bookmarks"), Protection::Protected(RouteEffect::RejectAnonymous));
        assert_eq!(p.classify("/"), Protection::Public);
        assert_eq!(p.classify("/about"), Protection::Public);
        assert_eq!(p.classify("/auth/callback"), Protection::Public);
    }

    #[test]
    fn matching_is_segment_aware() {
        let p = RoutePolicy::new(default_protected());
        assert_eq!(p.classify("/dashboards"), Protection::Public);
        assert_eq!(p.classify("/apiary"), Protection::Public);
    }

    #[test]
    fn longest_prefix_wins() {
        let p = RoutePolicy::new(parse_rules("/app=reject,/app/pages/=redirect").unwrap());
        assert_eq!(p.classify("/app/x"), Protection::Protected(RouteEffect::RejectAnonymous));
        assert_eq!(p.classify("/app/pages/home"), Protection::Protected(RouteEffect::RequireIdentity));
    }

    #[test]
    fn rule_parsing_errors() {
        assert!(parse_rules("dashboard=redirect").is_err());
        assert!(parse_rules("/dashboard").is_err());
        assert!(parse_rules("/dashboard=sometimes").is_err());
        assert_eq!(parse_rules(" /=reject , ").unwrap(), vec![("/".to_string(), RouteEffect::RejectAnonymous)]);
    }
}
