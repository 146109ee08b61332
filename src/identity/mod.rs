//! Identity and session management: who a request acts as, and how that is proven.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod resolver;
mod provider;
mod request_context;
pub mod cookies;

pub use principal::Identity;
pub use session::{AccessCheck, SessionError, SessionManager, SessionSettings, SessionToken, TokenPair};
pub use resolver::{Resolution, ResolveOutcome, SessionResolver};
pub use provider::{DevIdentityProvider, IdentityProvider, OAuthEndpoints, OAuthIdentityProvider, PendingSignIns};
pub use request_context::RequestContext;
pub use cookies::CookieSettings;
