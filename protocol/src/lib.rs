mod api;
mod session_id;
mod wire;

pub use api::ApiFailure;
pub use api::ApiOk;
pub use api::ExecuteParams;
pub use api::HealthResponse;
pub use api::InputParams;
pub use api::KillParams;
pub use session_id::SessionId;
pub use wire::OutputOrigin;
pub use wire::StreamRecord;
