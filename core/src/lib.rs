mod config;
mod error;
mod events;
mod queue;
mod registry;
mod session;
mod supervisor;

pub use config::DuplicatePolicy;
pub use config::ExecMode;
pub use config::ReaderPolicy;
pub use config::RegistryConfig;
pub use error::SessionError;
pub use events::OutputEvent;
pub use events::SnapshotFingerprint;
pub use registry::SessionRegistry;
pub use session::ReaderLease;
pub use session::Session;
pub use session::SessionStatus;
pub use session::StreamDetached;
pub use supervisor::ExecSpec;
pub use supervisor::InProcessLauncher;
pub use supervisor::Job;
pub use supervisor::JobConsole;
pub use supervisor::JobError;
pub use supervisor::JobFactory;
pub use supervisor::Launcher;
pub use supervisor::SubprocessLauncher;
