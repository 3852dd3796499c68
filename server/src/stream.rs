use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures::Stream;
use runbridge_core::ReaderLease;
use runbridge_core::SessionRegistry;
use runbridge_protocol::SessionId;
use runbridge_protocol::StreamRecord;

/// Tracks whether the stream ended on its own terms. Dropping an armed guard
/// means the client went away mid-stream: the encoder detaches without
/// killing the job unless the deployment asked for kill-on-disconnect.
pub(crate) struct StreamGuard {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    kill_on_disconnect: bool,
    armed: bool,
}

impl StreamGuard {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        session_id: SessionId,
        kill_on_disconnect: bool,
    ) -> Self {
        Self {
            registry,
            session_id,
            kill_on_disconnect,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(session_id = %self.session_id, "client detached mid-stream");
        if self.kill_on_disconnect {
            let registry = Arc::clone(&self.registry);
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                if let Err(err) = registry.kill(&session_id).await {
                    tracing::debug!(session_id = %session_id, error = %err, "disconnect kill skipped");
                }
            });
        }
    }
}

/// Drains the session's queue into SSE events, one wire record each, ending
/// after the terminal exit record. Keepalives are emitted on idle so proxies
/// keep the connection open.
pub(crate) fn session_stream(
    mut lease: ReaderLease,
    mut guard: StreamGuard,
    keepalive_interval: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        loop {
            match tokio::time::timeout(keepalive_interval, lease.next_event()).await {
                Ok(Ok(Some(event))) => {
                    let record = event.into_record();
                    let terminal = record.is_terminal();
                    match Event::default().json_data(&record) {
                        Ok(sse) => yield Ok::<Event, Infallible>(sse),
                        Err(err) => {
                            tracing::error!(error = %err, "failed to encode stream record");
                            break;
                        }
                    }
                    if terminal {
                        guard.disarm();
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    // Queue already drained past its exit by an earlier
                    // reader; nothing left to replay.
                    guard.disarm();
                    break;
                }
                Ok(Err(_detached)) => {
                    tracing::debug!("stream displaced by a newer reader");
                    guard.disarm();
                    break;
                }
                Err(_idle) => match Event::default().json_data(&StreamRecord::Keepalive) {
                    Ok(sse) => yield Ok::<Event, Infallible>(sse),
                    Err(_) => break,
                },
            }
        }
    }
}
