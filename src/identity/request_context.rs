use super::Identity;

/// Per-request values the access gateway attaches as a request extension.
///
/// Handlers read the caller's identity from here and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub identity: Option<Identity>,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(identity: Option<Identity>) -> Self {
        Self { identity, request_id: uuid::Uuid::new_v4().to_string() }
    }
}
