use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use runbridge_protocol::OutputOrigin;
use runbridge_protocol::SessionId;
use tokio::sync::Notify;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::ExecMode;
use crate::config::ReaderPolicy;
use crate::error::SessionError;
use crate::events::OutputEvent;
use crate::events::SnapshotFingerprint;
use crate::queue::EventQueue;
use crate::queue::PopOutcome;
use crate::supervisor::JobHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Killed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Killed | SessionStatus::Error
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Killed => write!(f, "killed"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// State shared between a session's producer tasks and its reader. Producers
/// hold an `Arc<SessionCore>` rather than the session itself so a detached
/// supervisor task never keeps the whole session alive.
pub(crate) struct SessionCore {
    queue: EventQueue,
    status: Mutex<SessionStatus>,
    last_snapshot: Mutex<Option<SnapshotFingerprint>>,
    exit_emitted: AtomicBool,
    kill_requested: AtomicBool,
    last_activity: Mutex<Instant>,
    terminated_at: Mutex<Option<Instant>>,
    terminal_notify: Notify,
    reader_epoch: AtomicU64,
    reader_live: AtomicBool,
}

impl SessionCore {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            queue: EventQueue::new(queue_capacity),
            status: Mutex::new(SessionStatus::Pending),
            last_snapshot: Mutex::new(None),
            exit_emitted: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            terminated_at: Mutex::new(None),
            terminal_notify: Notify::new(),
            reader_epoch: AtomicU64::new(0),
            reader_live: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.status
            .lock()
            .map(|status| *status)
            .unwrap_or(SessionStatus::Error)
    }

    fn set_status(&self, next: SessionStatus) {
        if let Ok(mut status) = self.status.lock()
            && !status.is_terminal()
        {
            *status = next;
        }
    }

    pub(crate) fn mark_running(&self) {
        self.set_status(SessionStatus::Running);
    }

    pub(crate) fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|at| *at)
            .unwrap_or_else(|_| Instant::now())
    }

    pub(crate) fn terminated_at(&self) -> Option<Instant> {
        self.terminated_at.lock().ok().and_then(|at| *at)
    }

    pub(crate) fn reader_attached(&self) -> bool {
        self.reader_live.load(Ordering::SeqCst)
    }

    pub(crate) fn kill_was_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn try_pop(&self) -> crate::queue::PopOutcome {
        self.queue.try_pop()
    }

    pub(crate) fn push_system(&self, message: String) {
        self.touch();
        self.queue.push(OutputEvent::System { message });
    }

    pub(crate) fn push_fragment(&self, origin: OutputOrigin, content: String) {
        self.touch();
        self.queue.push(OutputEvent::Fragment { origin, content });
    }

    /// Queues a full re-rendering unless it fingerprints identically to the
    /// last one delivered. Returns whether the snapshot was queued.
    pub(crate) fn push_snapshot(&self, content: String) -> bool {
        let fingerprint = SnapshotFingerprint::of(&content);
        {
            let Ok(mut last) = self.last_snapshot.lock() else {
                return false;
            };
            if *last == Some(fingerprint) {
                return false;
            }
            *last = Some(fingerprint);
        }
        self.touch();
        self.queue.push(OutputEvent::FullSnapshot { content });
        true
    }

    pub(crate) fn push_error(&self, message: String) {
        self.touch();
        self.queue.push(OutputEvent::ErrorLine { message });
    }

    /// Queues the terminal exit event exactly once and moves the session to
    /// its terminal state. Later calls are ignored, whichever producer path
    /// raced here first wins.
    pub(crate) fn push_exit(&self, code: i32, terminal: SessionStatus) {
        if self.exit_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_status(terminal);
        if let Ok(mut at) = self.terminated_at.lock() {
            *at = Some(Instant::now());
        }
        self.queue.push(OutputEvent::Exit { code });
        self.terminal_notify.notify_waiters();
    }

    pub(crate) async fn wait_terminal(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.terminal_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.status().is_terminal() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return,
            }
        }
    }
}

/// Returned by `ReaderLease::next_event` when a newer reader displaced this
/// one. Not a failure; the encoder simply ends its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDetached;

/// Exclusive claim on a session's event stream. Dropping the lease detaches
/// the reader and clears the snapshot fingerprint so the next reader gets a
/// fresh resynchronizing snapshot.
pub struct ReaderLease {
    core: Arc<SessionCore>,
    epoch: u64,
}

impl ReaderLease {
    /// Waits for the next event. `Ok(None)` means the stream is complete (the
    /// exit event was already returned); `Err(StreamDetached)` means another
    /// reader took over.
    pub async fn next_event(&mut self) -> Result<Option<OutputEvent>, StreamDetached> {
        loop {
            if self.core.reader_epoch.load(Ordering::SeqCst) != self.epoch {
                return Err(StreamDetached);
            }
            let notified = self.core.queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.core.queue.try_pop() {
                PopOutcome::Event(event) => {
                    self.core.touch();
                    return Ok(Some(event));
                }
                PopOutcome::Drained => return Ok(None),
                PopOutcome::Empty => {
                    if self.core.reader_epoch.load(Ordering::SeqCst) != self.epoch {
                        return Err(StreamDetached);
                    }
                    notified.await;
                }
            }
        }
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        if self.core.reader_epoch.load(Ordering::SeqCst) == self.epoch {
            self.core.reader_live.store(false, Ordering::SeqCst);
            if let Ok(mut last) = self.core.last_snapshot.lock() {
                *last = None;
            }
            self.core.touch();
        }
    }
}

/// Server-side record correlating a client-visible id with one live or
/// terminated job execution.
pub struct Session {
    id: SessionId,
    mode: ExecMode,
    created_at: Instant,
    core: Arc<SessionCore>,
    handle: Box<dyn JobHandle>,
    reader_policy: ReaderPolicy,
    kill_wait: Duration,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        mode: ExecMode,
        core: Arc<SessionCore>,
        handle: Box<dyn JobHandle>,
        reader_policy: ReaderPolicy,
        kill_wait: Duration,
    ) -> Self {
        Self {
            id,
            mode,
            created_at: Instant::now(),
            core,
            handle,
            reader_policy,
            kill_wait,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether backpressure has coalesced any of this session's output.
    pub fn is_degraded(&self) -> bool {
        self.core.queue.is_degraded()
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// Forwards one line of interactive input to the running job.
    pub async fn send_input(&self, text: &str) -> Result<(), SessionError> {
        if self.core.status() != SessionStatus::Running {
            return Err(SessionError::NotRunning {
                session_id: self.id.clone(),
            });
        }
        self.handle.write_input(text.to_string()).await?;
        self.core.touch();
        Ok(())
    }

    /// Terminates the job and finalizes the stream. Idempotent: killing an
    /// already-terminated session is a no-op and emits nothing further.
    pub async fn kill(&self) {
        if self.core.status().is_terminal() {
            return;
        }
        if self.core.kill_requested.swap(true, Ordering::SeqCst) {
            // Another caller is already tearing this session down; just wait
            // for the terminal state alongside it.
            self.core.wait_terminal(self.kill_wait).await;
            return;
        }
        tracing::info!(session_id = %self.id, "kill requested");
        self.core
            .push_error("Process terminated by user".to_string());
        self.handle.kill().await;
        self.core.wait_terminal(self.kill_wait).await;
    }

    /// Claims the stream for a new reader according to the configured policy.
    pub fn attach_reader(&self) -> Result<ReaderLease, SessionError> {
        if self.reader_policy == ReaderPolicy::Reject && self.core.reader_attached() {
            return Err(SessionError::StreamBusy {
                session_id: self.id.clone(),
            });
        }
        let epoch = self.core.reader_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.core.reader_live.store(true, Ordering::SeqCst);
        // Wake any displaced reader parked on the queue so it observes the
        // epoch change promptly.
        self.core.queue.notify_waiters();
        Ok(ReaderLease {
            core: Arc::clone(&self.core),
            epoch,
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_never_leaves_a_terminal_state() {
        let core = SessionCore::new(16);
        core.mark_running();
        assert_eq!(core.status(), SessionStatus::Running);
        core.push_exit(0, SessionStatus::Completed);
        core.set_status(SessionStatus::Running);
        assert_eq!(core.status(), SessionStatus::Completed);
    }

    #[test]
    fn exit_is_emitted_exactly_once() {
        let core = SessionCore::new(16);
        core.mark_running();
        core.push_exit(0, SessionStatus::Completed);
        core.push_exit(143, SessionStatus::Killed);

        let mut exits = Vec::new();
        while let PopOutcome::Event(event) = core.queue.try_pop() {
            if let OutputEvent::Exit { code } = event {
                exits.push(code);
            }
        }
        assert_eq!(exits, vec![0]);
        assert_eq!(core.status(), SessionStatus::Completed);
    }

    #[test]
    fn identical_snapshots_collapse_to_one() {
        let core = SessionCore::new(16);
        assert!(core.push_snapshot("body".to_string()));
        assert!(!core.push_snapshot("body".to_string()));
        assert!(core.push_snapshot("body grew".to_string()));
    }

    #[test]
    fn detach_resets_snapshot_dedup() {
        let core = Arc::new(SessionCore::new(16));
        assert!(core.push_snapshot("body".to_string()));

        let epoch = core.reader_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        core.reader_live.store(true, Ordering::SeqCst);
        drop(ReaderLease {
            core: Arc::clone(&core),
            epoch,
        });

        // A reconnecting client must get a fresh snapshot even if the
        // producer re-renders the same body.
        assert!(core.push_snapshot("body".to_string()));
    }
}
