use axum::http::HeaderMap;

/// Auth and rate-limit verdicts are supplied by a collaborator outside this
/// crate; handlers consume the verdict before touching any session. The
/// default composition is permissive.
pub trait AccessGuard: Send + Sync {
    fn check(&self, caller: &CallerIdentity, action: GuardedAction) -> GuardVerdict;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedAction {
    Execute,
    Stream,
    Input,
    Kill,
}

#[derive(Debug, Clone)]
pub enum GuardVerdict {
    Allow,
    Deny { reason: String },
    Throttle { reason: String },
}

/// What the guard gets to key its decision on.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub bearer_token: Option<String>,
    pub forwarded_for: Option<String>,
}

impl CallerIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer_token = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);
        let forwarded_for = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Self {
            bearer_token,
            forwarded_for,
        }
    }
}

/// Permissive guard for deployments that front the server with their own
/// auth layer.
pub struct AllowAll;

impl AccessGuard for AllowAll {
    fn check(&self, _caller: &CallerIdentity, _action: GuardedAction) -> GuardVerdict {
        GuardVerdict::Allow
    }
}
