mod guard;
mod router;
mod stream;

pub use guard::AccessGuard;
pub use guard::AllowAll;
pub use guard::CallerIdentity;
pub use guard::GuardVerdict;
pub use guard::GuardedAction;
pub use router::AppState;
pub use router::ServerConfig;
pub use router::build_router;
