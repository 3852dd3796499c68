mod inprocess;
mod subprocess;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;

pub use inprocess::InProcessLauncher;
pub use inprocess::Job;
pub use inprocess::JobConsole;
pub use inprocess::JobError;
pub use inprocess::JobFactory;
pub use subprocess::SubprocessLauncher;

use crate::config::ExecMode;
use crate::error::SessionError;
use crate::session::SessionCore;

// Conventional shell mapping for signal-terminated jobs: 128 + signal.
pub(crate) const EXIT_CODE_SIGNAL_BASE: i32 = 128;
/// Reported when an in-process job honors the cooperative cancel flag.
pub(crate) const CANCELLED_EXIT_CODE: i32 = 130;

/// What to run: the validated path plus shell-split arguments.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub path: String,
    pub args: Vec<String>,
}

impl ExecSpec {
    /// Rendering of the command for the announcement record and logs.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.path.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        shlex::try_join(parts.iter().copied()).unwrap_or_else(|_| parts.join(" "))
    }
}

/// Live control surface for one running job. Exclusively owned by its
/// session and released exactly once on natural exit, kill, or supervisor
/// failure.
#[async_trait]
pub(crate) trait JobHandle: Send + Sync {
    /// Queues one line of interactive input.
    async fn write_input(&self, line: String) -> Result<(), SessionError>;

    /// Requests termination. Subprocesses get a graceful signal first; in-
    /// process jobs get the cooperative cancel flag. The terminal exit event
    /// is pushed by the strategy's own supervision task.
    async fn kill(&self);
}

/// The execution strategy a registry launches every job with. Callers depend
/// only on this surface; the strategies stay interchangeable.
pub enum Launcher {
    Subprocess(SubprocessLauncher),
    InProcess(InProcessLauncher),
}

impl Launcher {
    pub fn subprocess() -> Self {
        Self::Subprocess(SubprocessLauncher)
    }

    pub fn in_process(factory: JobFactory) -> Self {
        Self::InProcess(InProcessLauncher::new(factory))
    }

    pub fn mode(&self) -> ExecMode {
        match self {
            Launcher::Subprocess(_) => ExecMode::Subprocess,
            Launcher::InProcess(_) => ExecMode::InProcess,
        }
    }

    pub(crate) async fn start(
        &self,
        spec: &ExecSpec,
        core: Arc<SessionCore>,
        grace_period: Duration,
    ) -> Result<Box<dyn JobHandle>, SessionError> {
        match self {
            Launcher::Subprocess(launcher) => launcher.start(spec, core, grace_period).await,
            Launcher::InProcess(launcher) => launcher.start(spec, core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_line_quotes_arguments() {
        let spec = ExecSpec {
            path: "/opt/jobs/render".to_string(),
            args: vec!["--title".to_string(), "two words".to_string()],
        };
        assert_eq!(spec.command_line(), "/opt/jobs/render --title 'two words'");
    }
}
