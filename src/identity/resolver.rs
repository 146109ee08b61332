use super::principal::Identity;
use super::session::{AccessCheck, SessionError, SessionManager, TokenPair};

/// How a resolution was reached. Callers only see `identity`; this is for the gateway and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Access token valid as presented.
    Valid,
    /// Access token expired or missing; the refresh token minted a new pair.
    Refreshed,
    /// No tokens presented.
    Anonymous,
    /// Tokens presented but neither could be used.
    ExpiredTerminal,
}

impl ResolveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveOutcome::Valid => "valid",
            ResolveOutcome::Refreshed => "refreshed",
            ResolveOutcome::Anonymous => "anonymous",
            ResolveOutcome::ExpiredTerminal => "expired_terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub identity: Option<Identity>,
    /// Set when the pair was rotated; must be written back to the caller.
    pub rotated: Option<TokenPair>,
    pub outcome: ResolveOutcome,
}

impl Resolution {
    fn anonymous(outcome: ResolveOutcome) -> Self { Self { identity: None, rotated: None, outcome } }
}

/// The single way any component turns a token pair into an identity.
#[derive(Clone)]
pub struct SessionResolver {
    sessions: SessionManager,
}

impl SessionResolver {
    pub fn new(sessions: SessionManager) -> Self { Self { sessions } }

    pub fn sessions(&self) -> &SessionManager { &self.sessions }

    /// Never fails: every unusable token pair degrades to an anonymous resolution.
    pub async fn resolve(&self, tokens: Option<&TokenPair>) -> Resolution {
        let Some(pair) = tokens else { return Resolution::anonymous(ResolveOutcome::Anonymous); };

        if !pair.access_token.is_empty() {
            if let AccessCheck::Valid(identity) = self.sessions.check_access(&pair.access_token) {
                return Resolution { identity: Some(identity), rotated: None, outcome: ResolveOutcome::Valid };
            }
        }
        if pair.refresh_token.is_empty() {
            return Resolution::anonymous(ResolveOutcome::ExpiredTerminal);
        }

        match self.sessions.refresh(&pair.refresh_token) {
            Ok((pair, identity)) => {
                tracing::debug!(target: "session", user = %identity.id, "access token rotated");
                Resolution { identity: Some(identity), rotated: Some(pair), outcome: ResolveOutcome::Refreshed }
            }
            Err(SessionError::Entropy(e)) => {
                // the session is untouched; keep the caller's cookies
                tracing::error!(target: "session", "refresh could not mint tokens: {}", e);
                Resolution::anonymous(ResolveOutcome::Anonymous)
            }
            Err(e) => {
                tracing::debug!(target: "session", reason = %e, "refresh failed; treating request as anonymous");
                Resolution::anonymous(ResolveOutcome::ExpiredTerminal)
            }
        }
    }
}
