use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::mpsc::channel;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::SessionError;
use crate::session::SessionCore;
use crate::session::SessionStatus;
use crate::supervisor::CANCELLED_EXIT_CODE;
use crate::supervisor::ExecSpec;
use crate::supervisor::JobHandle;

/// How often a blocked `read_line` re-checks the cancel flag.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum JobError {
    /// The cooperative cancel flag was observed. Jobs should release scoped
    /// resources and return this from their current step.
    #[error("job cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// The in-process job contract. Implementations run on a blocking worker and
/// must poll `console.cancelled()` between logical steps; forced thread
/// termination is never used because it can corrupt shared state.
pub trait Job: Send + 'static {
    /// Runs to completion, returning the exit code for the stream's terminal
    /// record.
    fn run(self: Box<Self>, console: &mut JobConsole) -> Result<i32, JobError>;
}

/// Builds the job for an execute request. Injected by the composition root;
/// the supervisor itself knows nothing about job internals.
pub type JobFactory = Arc<dyn Fn(&ExecSpec) -> Result<Box<dyn Job>, SessionError> + Send + Sync>;

/// The job's view of its session: an output sink that re-renders the full
/// transcript per print, a blocking input queue, and the cancel flag.
pub struct JobConsole {
    core: Arc<SessionCore>,
    input_rx: Receiver<String>,
    cancel: Arc<AtomicBool>,
    transcript: String,
}

impl JobConsole {
    /// Appends a line and emits a full re-rendering of the transcript. The
    /// snapshot dedup collapses renders the client has already seen.
    pub fn print(&mut self, line: impl AsRef<str>) {
        self.transcript.push_str(line.as_ref());
        self.transcript.push('\n');
        self.core.push_snapshot(self.transcript.clone());
    }

    /// Re-emits the current transcript without appending, as a producer that
    /// re-renders on a tick would. Identical renders are suppressed.
    pub fn refresh(&self) {
        self.core.push_snapshot(self.transcript.clone());
    }

    /// Blocks until a line of interactive input arrives, polling the cancel
    /// flag at a fixed interval so a kill is honored promptly.
    pub fn read_line(&mut self) -> Result<String, JobError> {
        loop {
            if self.cancelled() {
                return Err(JobError::Cancelled);
            }
            match self.input_rx.recv_timeout(INPUT_POLL_INTERVAL) {
                Ok(line) => return Ok(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(JobError::Cancelled),
            }
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }
}

/// Runs the job on a blocking worker inside the server process.
pub struct InProcessLauncher {
    factory: JobFactory,
}

struct InProcessHandle {
    input_tx: Mutex<Sender<String>>,
    cancel: Arc<AtomicBool>,
}

#[async_trait]
impl JobHandle for InProcessHandle {
    async fn write_input(&self, line: String) -> Result<(), SessionError> {
        let Ok(sender) = self.input_tx.lock() else {
            return Err(SessionError::InputClosed);
        };
        sender.send(line).map_err(|_| SessionError::InputClosed)
    }

    async fn kill(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl InProcessLauncher {
    pub fn new(factory: JobFactory) -> Self {
        Self { factory }
    }

    pub(crate) fn start(
        &self,
        spec: &ExecSpec,
        core: Arc<SessionCore>,
    ) -> Result<Box<dyn JobHandle>, SessionError> {
        let job = (self.factory)(spec)?;
        let (input_tx, input_rx) = channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let worker_core = Arc::clone(&core);
        let worker_cancel = Arc::clone(&cancel);
        let worker = tokio::task::spawn_blocking(move || {
            let mut console = JobConsole {
                core: worker_core,
                input_rx,
                cancel: worker_cancel,
                transcript: String::new(),
            };
            job.run(&mut console)
        });

        tokio::spawn(async move {
            match worker.await {
                Ok(Ok(code)) => core.push_exit(code, SessionStatus::Completed),
                Ok(Err(JobError::Cancelled)) => {
                    core.push_exit(CANCELLED_EXIT_CODE, SessionStatus::Killed);
                }
                Ok(Err(JobError::Failed(err))) => {
                    tracing::error!(error = ?err, "in-process job failed");
                    core.push_error(format!("Execution error: {err:#}"));
                    core.push_exit(1, SessionStatus::Error);
                }
                Err(err) => {
                    // A panic inside the job lands here; recover it into the
                    // stream rather than tearing anything else down.
                    tracing::error!(error = ?err, "in-process worker crashed");
                    core.push_error("Execution error: job crashed unexpectedly".to_string());
                    core.push_exit(1, SessionStatus::Error);
                }
            }
        });

        Ok(Box::new(InProcessHandle {
            input_tx: Mutex::new(input_tx),
            cancel,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutputEvent;
    use crate::queue::PopOutcome;
    use pretty_assertions::assert_eq;

    struct PrintingJob {
        lines: Vec<&'static str>,
    }

    impl Job for PrintingJob {
        fn run(self: Box<Self>, console: &mut JobConsole) -> Result<i32, JobError> {
            for line in self.lines {
                console.print(line);
            }
            Ok(0)
        }
    }

    struct EchoJob;

    impl Job for EchoJob {
        fn run(self: Box<Self>, console: &mut JobConsole) -> Result<i32, JobError> {
            console.print("Continue?");
            let reply = console.read_line()?;
            console.print(format!("received {reply}"));
            Ok(0)
        }
    }

    struct StubbornlyPoliteJob;

    impl Job for StubbornlyPoliteJob {
        fn run(self: Box<Self>, console: &mut JobConsole) -> Result<i32, JobError> {
            loop {
                if console.cancelled() {
                    return Err(JobError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn factory_for(job: impl Fn() -> Box<dyn Job> + Send + Sync + 'static) -> JobFactory {
        Arc::new(move |_spec: &ExecSpec| Ok(job()))
    }

    fn spec() -> ExecSpec {
        ExecSpec {
            path: "/tmp/x".to_string(),
            args: Vec::new(),
        }
    }

    fn drain(core: &SessionCore) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let PopOutcome::Event(event) = core.try_pop() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn printing_job_emits_snapshots_then_exit_zero() {
        let core = Arc::new(SessionCore::new(64));
        let launcher = InProcessLauncher::new(factory_for(|| {
            Box::new(PrintingJob {
                lines: vec!["one", "two"],
            })
        }));
        let _handle = launcher
            .start(&spec(), Arc::clone(&core))
            .expect("start job");
        core.mark_running();
        core.wait_terminal(tokio::time::Duration::from_secs(5)).await;

        let events = drain(&core);
        assert_eq!(
            events,
            vec![
                OutputEvent::FullSnapshot {
                    content: "one\n".to_string(),
                },
                OutputEvent::FullSnapshot {
                    content: "one\ntwo\n".to_string(),
                },
                OutputEvent::Exit { code: 0 },
            ]
        );
        assert_eq!(core.status(), SessionStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prompting_job_receives_submitted_input() {
        let core = Arc::new(SessionCore::new(64));
        let launcher = InProcessLauncher::new(factory_for(|| Box::new(EchoJob)));
        let handle = launcher
            .start(&spec(), Arc::clone(&core))
            .expect("start job");
        core.mark_running();

        handle.write_input("y".to_string()).await.expect("queue input");
        core.wait_terminal(tokio::time::Duration::from_secs(5)).await;

        let events = drain(&core);
        let Some(OutputEvent::FullSnapshot { content }) = events.get(events.len() - 2) else {
            panic!("expected a snapshot before the exit event: {events:?}");
        };
        assert!(content.contains("received y"), "transcript was {content:?}");
        assert_eq!(events.last(), Some(&OutputEvent::Exit { code: 0 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_flag_stops_a_cooperative_job() {
        let core = Arc::new(SessionCore::new(64));
        let launcher = InProcessLauncher::new(factory_for(|| Box::new(StubbornlyPoliteJob)));
        let handle = launcher
            .start(&spec(), Arc::clone(&core))
            .expect("start job");
        core.mark_running();

        handle.kill().await;
        core.wait_terminal(tokio::time::Duration::from_secs(5)).await;

        let events = drain(&core);
        assert_eq!(
            events.last(),
            Some(&OutputEvent::Exit {
                code: CANCELLED_EXIT_CODE,
            })
        );
        assert_eq!(core.status(), SessionStatus::Killed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_job_is_recovered_into_the_stream() {
        let core = Arc::new(SessionCore::new(64));
        let launcher = InProcessLauncher::new(Arc::new(|_spec: &ExecSpec| {
            struct PanickingJob;
            impl Job for PanickingJob {
                fn run(self: Box<Self>, _console: &mut JobConsole) -> Result<i32, JobError> {
                    panic!("boom");
                }
            }
            Ok(Box::new(PanickingJob) as Box<dyn Job>)
        }));
        let _handle = launcher
            .start(&spec(), Arc::clone(&core))
            .expect("start job");
        core.mark_running();
        core.wait_terminal(tokio::time::Duration::from_secs(5)).await;

        let events = drain(&core);
        assert!(
            matches!(events.first(), Some(OutputEvent::ErrorLine { .. })),
            "expected an error line, got {events:?}"
        );
        assert_eq!(events.last(), Some(&OutputEvent::Exit { code: 1 }));
        assert_eq!(core.status(), SessionStatus::Error);
    }
}
