use std::fmt;
use std::time::Duration;

/// Which execution strategy a registry launches jobs with. Selected per
/// deployment; never mixed within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Subprocess,
    InProcess,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Subprocess => write!(f, "subprocess"),
            ExecMode::InProcess => write!(f, "in_process"),
        }
    }
}

/// What `execute` does when the session id already has a live execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Kill the previous run and start fresh. Matches the original web UI,
    /// where re-running a session always replaced the old process.
    #[default]
    Supersede,
    /// Refuse the new execute with `AlreadyRunning`.
    Reject,
}

/// What attaching a stream reader does when one is already attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderPolicy {
    /// The new reader takes over; the previous encoder detaches at its next
    /// wakeup. This is what makes browser reconnects work.
    #[default]
    Displace,
    /// Refuse the second reader with `StreamBusy`.
    Reject,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub duplicate_policy: DuplicatePolicy,
    pub reader_policy: ReaderPolicy,
    /// Queued-but-unread events beyond this bound are coalesced.
    pub queue_capacity: usize,
    /// How long a subprocess gets between the graceful signal and the forced
    /// kill.
    pub grace_period: Duration,
    /// Live sessions with no reader and no activity past this are reaped.
    pub idle_timeout: Duration,
    /// Terminated sessions are kept this long so late readers can drain the
    /// buffered stream and repeated kills stay idempotent.
    pub terminal_retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            reader_policy: ReaderPolicy::default(),
            queue_capacity: 256,
            grace_period: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            terminal_retention: Duration::from_secs(60),
        }
    }
}
