use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use runbridge_protocol::OutputOrigin;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::session::SessionCore;
use crate::session::SessionStatus;
use crate::supervisor::EXIT_CODE_SIGNAL_BASE;
use crate::supervisor::ExecSpec;
use crate::supervisor::JobHandle;

const READ_CHUNK_SIZE: usize = 8192;
/// Output is line-buffered; a line longer than this is flushed early so a
/// silent job cannot stall the stream.
const FLUSH_THRESHOLD_BYTES: usize = 512;
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Runs the job as an isolated OS process with redirected standard streams.
pub struct SubprocessLauncher;

struct SubprocessHandle {
    input_tx: mpsc::Sender<String>,
    kill_token: CancellationToken,
}

#[async_trait]
impl JobHandle for SubprocessHandle {
    async fn write_input(&self, line: String) -> Result<(), SessionError> {
        self.input_tx
            .send(line)
            .await
            .map_err(|_| SessionError::InputClosed)
    }

    async fn kill(&self) {
        self.kill_token.cancel();
    }
}

impl SubprocessLauncher {
    pub(crate) async fn start(
        &self,
        spec: &ExecSpec,
        core: Arc<SessionCore>,
        grace_period: Duration,
    ) -> Result<Box<dyn JobHandle>, SessionError> {
        let mut command = Command::new(&spec.path);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(SessionError::spawn)?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::spawn(std::io::Error::other("stdout pipe unavailable")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::spawn(std::io::Error::other("stderr pipe unavailable")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::spawn(std::io::Error::other("stdin pipe unavailable")))?;

        let stdout_task = tokio::spawn(pump_output(
            BufReader::new(stdout),
            OutputOrigin::Stdout,
            Arc::clone(&core),
        ));
        let stderr_task = tokio::spawn(pump_output(
            BufReader::new(stderr),
            OutputOrigin::Stderr,
            Arc::clone(&core),
        ));

        let (input_tx, mut input_rx) = mpsc::channel::<String>(INPUT_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(async move {
            while let Some(line) = input_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let kill_token = CancellationToken::new();
        tokio::spawn(supervise(
            child,
            pid,
            core,
            grace_period,
            kill_token.clone(),
            stdout_task,
            stderr_task,
            writer_task,
        ));

        Ok(Box::new(SubprocessHandle {
            input_tx,
            kill_token,
        }))
    }
}

/// Owns the child for its whole life: waits for natural exit or a kill
/// request, drains the readers so the exit event is the last thing queued,
/// then reaps.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    core: Arc<SessionCore>,
    grace_period: Duration,
    kill_token: CancellationToken,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_token.cancelled() => {
            terminate_gracefully(pid);
            match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(?pid, "job ignored graceful signal, force-killing");
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(error = ?err, "force kill failed");
                    }
                    child.wait().await
                }
            }
        }
    };

    // Readers run until pipe EOF, which the child's death guarantees; waiting
    // on them keeps every fragment ahead of the exit event.
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    writer_task.abort();

    match status {
        Ok(status) => {
            let terminal = if core.kill_was_requested() {
                SessionStatus::Killed
            } else {
                SessionStatus::Completed
            };
            core.push_exit(exit_code_of(status), terminal);
        }
        Err(err) => {
            tracing::error!(error = ?err, "failed to reap job process");
            core.push_error(format!("Job process lost: {err}"));
            core.push_exit(-1, SessionStatus::Error);
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_CODE_SIGNAL_BASE + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn terminate_gracefully(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_pid: Option<u32>) {}

async fn pump_output<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    origin: OutputOrigin,
    core: Arc<SessionCore>,
) {
    let mut pending = String::new();
    let mut tmp = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) => break,
            Ok(n) => {
                for ch in String::from_utf8_lossy(&tmp[..n]).chars() {
                    pending.push(ch);
                    if ch == '\n' || pending.len() > FLUSH_THRESHOLD_BYTES {
                        core.push_fragment(origin, std::mem::take(&mut pending));
                    }
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(error = ?err, ?origin, "output read error");
                break;
            }
        }
    }
    if !pending.is_empty() {
        core.push_fragment(origin, pending);
    }
}
