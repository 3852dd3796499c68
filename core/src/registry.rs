use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use runbridge_protocol::ExecuteParams;
use runbridge_protocol::SessionId;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::DuplicatePolicy;
use crate::config::RegistryConfig;
use crate::error::SessionError;
use crate::session::ReaderLease;
use crate::session::Session;
use crate::session::SessionCore;
use crate::supervisor::ExecSpec;
use crate::supervisor::Launcher;

const REAP_INTERVAL: Duration = Duration::from_secs(5);
/// Margin on top of the grace period before a kill call stops waiting for
/// the terminal state.
const KILL_WAIT_MARGIN: Duration = Duration::from_secs(2);

/// Central map from session id to session state. Owned by the server's
/// composition root and passed by reference to handlers; its lifecycle spans
/// process start to shutdown, and shutdown kills every live session.
///
/// The inner mutex guards map mutation only and is never held across I/O.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    config: RegistryConfig,
    launcher: Launcher,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Ids with an execute in flight but not yet inserted, so two racing
    /// creates can never both launch a job for the same id.
    starting: HashSet<SessionId>,
}

impl SessionRegistry {
    pub fn new(launcher: Launcher, config: RegistryConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            config,
            launcher,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Validates the request, applies the duplicate policy, launches the job
    /// and registers the session. The returned session is already `running`
    /// with the announcement record queued.
    pub async fn execute(&self, params: &ExecuteParams) -> Result<Arc<Session>, SessionError> {
        let spec = validate(params)?;
        let session_id = params.session_id.clone();

        let superseded = {
            let Ok(mut state) = self.state.lock() else {
                return Err(SessionError::spawn(std::io::Error::other(
                    "registry poisoned",
                )));
            };
            if state.starting.contains(&session_id) {
                return Err(SessionError::AlreadyRunning { session_id });
            }
            let existing_live = state
                .sessions
                .get(&session_id)
                .map(|existing| !existing.status().is_terminal());
            let superseded = match existing_live {
                Some(true) => match self.config.duplicate_policy {
                    DuplicatePolicy::Reject => {
                        return Err(SessionError::AlreadyRunning { session_id });
                    }
                    DuplicatePolicy::Supersede => state.sessions.remove(&session_id),
                },
                Some(false) => {
                    // Stale terminal session; a fresh execute replaces it.
                    state.sessions.remove(&session_id);
                    None
                }
                None => None,
            };
            state.starting.insert(session_id.clone());
            superseded
        };

        if let Some(old) = superseded {
            tracing::info!(session_id = %session_id, "superseding live execution");
            old.kill().await;
        }

        let core = Arc::new(SessionCore::new(self.config.queue_capacity));
        core.push_system(format!("Executing: {}", spec.command_line()));

        let started = self
            .launcher
            .start(&spec, Arc::clone(&core), self.config.grace_period)
            .await;
        let handle = match started {
            Ok(handle) => handle,
            Err(err) => {
                if let Ok(mut state) = self.state.lock() {
                    state.starting.remove(&session_id);
                }
                tracing::error!(session_id = %session_id, error = %err, "failed to launch job");
                return Err(err);
            }
        };
        core.mark_running();

        let session = Arc::new(Session::new(
            session_id.clone(),
            self.launcher.mode(),
            core,
            handle,
            self.config.reader_policy,
            self.config.grace_period + KILL_WAIT_MARGIN,
        ));
        if let Ok(mut state) = self.state.lock() {
            state.starting.remove(&session_id);
            state.sessions.insert(session_id.clone(), Arc::clone(&session));
        }
        tracing::info!(
            session_id = %session_id,
            mode = %self.launcher.mode(),
            command = %spec.command_line(),
            "execution started"
        );
        Ok(session)
    }

    pub fn lookup(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.sessions.get(session_id).cloned())
    }

    /// Forwards interactive input to a running session.
    pub async fn send_input(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<(), SessionError> {
        let session = self
            .lookup(session_id)
            .ok_or_else(|| SessionError::NoSuchSession {
                session_id: session_id.clone(),
            })?;
        session.send_input(text).await
    }

    /// Terminates a session's job. Idempotent once the session exists;
    /// unknown ids are an error.
    pub async fn kill(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let session = self
            .lookup(session_id)
            .ok_or_else(|| SessionError::NoSuchSession {
                session_id: session_id.clone(),
            })?;
        session.kill().await;
        Ok(())
    }

    /// Claims the stream of an existing session for a (re)connecting reader.
    pub fn attach_reader(&self, session_id: &SessionId) -> Result<ReaderLease, SessionError> {
        let session = self
            .lookup(session_id)
            .ok_or_else(|| SessionError::NoSuchSession {
                session_id: session_id.clone(),
            })?;
        session.attach_reader()
    }

    /// Removes a session record. Only terminal sessions are removed; returns
    /// whether a record was dropped.
    pub fn remove(&self, session_id: &SessionId) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let terminal = state
            .sessions
            .get(session_id)
            .is_some_and(|session| session.status().is_terminal());
        if terminal {
            state.sessions.remove(session_id);
        }
        terminal
    }

    pub fn live_session_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .sessions
                    .values()
                    .filter(|session| !session.status().is_terminal())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Kills every live session. Called by the composition root on shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let Ok(state) = self.state.lock() else {
                return;
            };
            state.sessions.values().cloned().collect()
        };
        for session in sessions {
            session.kill().await;
        }
    }

    /// Background garbage collection: kills idle unread sessions and drops
    /// terminal records once their retention lapsed.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.reap_once().await;
            }
        })
    }

    async fn reap_once(&self) {
        let now = Instant::now();
        let mut to_kill = Vec::new();
        let mut to_remove = Vec::new();
        {
            let Ok(state) = self.state.lock() else {
                return;
            };
            for (session_id, session) in &state.sessions {
                let core = session.core();
                if session.status().is_terminal() {
                    let expired = core
                        .terminated_at()
                        .is_some_and(|at| now.duration_since(at) >= self.config.terminal_retention);
                    if expired && !core.reader_attached() {
                        to_remove.push(session_id.clone());
                    }
                } else if !core.reader_attached()
                    && now.duration_since(core.last_activity()) >= self.config.idle_timeout
                {
                    to_kill.push(Arc::clone(session));
                }
            }
        }

        for session in to_kill {
            tracing::info!(session_id = %session.id(), "reaping idle session");
            session.kill().await;
        }
        if !to_remove.is_empty() {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            for session_id in to_remove {
                tracing::debug!(session_id = %session_id, "dropping terminal session record");
                state.sessions.remove(&session_id);
            }
        }
    }
}

fn validate(params: &ExecuteParams) -> Result<ExecSpec, SessionError> {
    if params.session_id.is_blank() {
        return Err(SessionError::validation("Missing session_id"));
    }
    let path = params.path.trim();
    if path.is_empty() {
        return Err(SessionError::validation("Missing path"));
    }
    if path.contains('\0') {
        return Err(SessionError::validation("Invalid execution path"));
    }
    let args = if params.args.trim().is_empty() {
        Vec::new()
    } else {
        shlex::split(&params.args)
            .ok_or_else(|| SessionError::validation("Invalid execution arguments"))?
    };
    if args.iter().any(|arg| arg.contains('\0')) {
        return Err(SessionError::validation("Invalid execution arguments"));
    }
    Ok(ExecSpec {
        path: path.to_string(),
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderPolicy;
    use crate::supervisor::Job;
    use crate::supervisor::JobConsole;
    use crate::supervisor::JobError;
    use pretty_assertions::assert_eq;

    struct SleepyJob;

    impl Job for SleepyJob {
        fn run(self: Box<Self>, console: &mut JobConsole) -> Result<i32, JobError> {
            console.print("working");
            loop {
                if console.cancelled() {
                    return Err(JobError::Cancelled);
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }

    struct QuickJob;

    impl Job for QuickJob {
        fn run(self: Box<Self>, console: &mut JobConsole) -> Result<i32, JobError> {
            console.print("done");
            Ok(0)
        }
    }

    fn registry_with(config: RegistryConfig, quick: bool) -> Arc<SessionRegistry> {
        let factory: crate::supervisor::JobFactory = Arc::new(move |_spec: &ExecSpec| {
            if quick {
                Ok(Box::new(QuickJob) as Box<dyn Job>)
            } else {
                Ok(Box::new(SleepyJob) as Box<dyn Job>)
            }
        });
        Arc::new(SessionRegistry::new(Launcher::in_process(factory), config))
    }

    fn execute_params(session_id: &str) -> ExecuteParams {
        ExecuteParams {
            path: "/tmp/x".to_string(),
            args: "--debug".to_string(),
            session_id: SessionId::new(session_id),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn validation_rejects_blank_path_and_id() {
        let registry = registry_with(RegistryConfig::default(), true);

        let missing_path = ExecuteParams {
            path: "  ".to_string(),
            args: String::new(),
            session_id: SessionId::new("s1"),
        };
        assert!(matches!(
            registry.execute(&missing_path).await,
            Err(SessionError::Validation { .. })
        ));

        let missing_id = ExecuteParams {
            path: "/tmp/x".to_string(),
            args: String::new(),
            session_id: SessionId::new("   "),
        };
        assert!(matches!(
            registry.execute(&missing_id).await,
            Err(SessionError::Validation { .. })
        ));
        assert_eq!(registry.live_session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn validation_rejects_unparseable_args() {
        let registry = registry_with(RegistryConfig::default(), true);
        let params = ExecuteParams {
            path: "/tmp/x".to_string(),
            args: "--flag 'unterminated".to_string(),
            session_id: SessionId::new("s1"),
        };
        assert!(matches!(
            registry.execute(&params).await,
            Err(SessionError::Validation { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reject_policy_refuses_a_duplicate_live_id() {
        let config = RegistryConfig {
            duplicate_policy: DuplicatePolicy::Reject,
            ..RegistryConfig::default()
        };
        let registry = registry_with(config, false);

        let first = registry
            .execute(&execute_params("s1"))
            .await
            .expect("first execute");
        let second = registry.execute(&execute_params("s1")).await;
        assert!(matches!(
            second,
            Err(SessionError::AlreadyRunning { .. })
        ));

        first.kill().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn supersede_policy_replaces_the_live_run() {
        let registry = registry_with(RegistryConfig::default(), false);

        let first = registry
            .execute(&execute_params("s1"))
            .await
            .expect("first execute");
        let second = registry
            .execute(&execute_params("s1"))
            .await
            .expect("supersede execute");

        assert!(first.status().is_terminal(), "old run must be killed");
        assert!(!second.status().is_terminal());
        assert_eq!(registry.live_session_count(), 1);

        second.kill().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_is_idempotent_and_input_errors_afterwards() {
        let registry = registry_with(RegistryConfig::default(), false);
        let session_id = SessionId::new("s1");

        registry
            .execute(&execute_params("s1"))
            .await
            .expect("execute");
        registry.kill(&session_id).await.expect("first kill");
        registry.kill(&session_id).await.expect("second kill");

        assert!(matches!(
            registry.send_input(&session_id, "y").await,
            Err(SessionError::NotRunning { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_ids_are_reported() {
        let registry = registry_with(RegistryConfig::default(), true);
        let session_id = SessionId::new("ghost");

        assert!(matches!(
            registry.kill(&session_id).await,
            Err(SessionError::NoSuchSession { .. })
        ));
        assert!(matches!(
            registry.send_input(&session_id, "y").await,
            Err(SessionError::NoSuchSession { .. })
        ));
        assert!(matches!(
            registry.attach_reader(&session_id),
            Err(SessionError::NoSuchSession { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminated_id_can_be_reused() {
        let registry = registry_with(RegistryConfig::default(), true);

        let first = registry
            .execute(&execute_params("s1"))
            .await
            .expect("first execute");
        first
            .core()
            .wait_terminal(Duration::from_secs(5))
            .await;

        let second = registry
            .execute(&execute_params("s1"))
            .await
            .expect("re-execute");
        assert!(!Arc::ptr_eq(&first, &second), "expected a fresh session");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reject_reader_policy_refuses_second_stream() {
        let config = RegistryConfig {
            reader_policy: ReaderPolicy::Reject,
            ..RegistryConfig::default()
        };
        let registry = registry_with(config, false);
        let session_id = SessionId::new("s1");

        registry
            .execute(&execute_params("s1"))
            .await
            .expect("execute");
        let lease = registry.attach_reader(&session_id).expect("first reader");
        assert!(matches!(
            registry.attach_reader(&session_id),
            Err(SessionError::StreamBusy { .. })
        ));
        drop(lease);
        registry
            .attach_reader(&session_id)
            .expect("reader after detach");

        registry.kill(&session_id).await.expect("kill");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_kills_every_live_session() {
        let registry = registry_with(RegistryConfig::default(), false);
        let a = registry
            .execute(&execute_params("a"))
            .await
            .expect("execute a");
        let b = registry
            .execute(&execute_params("b"))
            .await
            .expect("execute b");

        registry.shutdown().await;
        assert!(a.status().is_terminal());
        assert!(b.status().is_terminal());
        assert_eq!(registry.live_session_count(), 0);
    }
}
