use runbridge_protocol::OutputOrigin;
use runbridge_protocol::StreamRecord;
use sha2::Digest;
use sha2::Sha256;

/// One unit of output queued between a session's producer and its single
/// active reader. Strict FIFO per session, end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    System { message: String },
    Fragment { origin: OutputOrigin, content: String },
    FullSnapshot { content: String },
    ErrorLine { message: String },
    Exit { code: i32 },
}

impl OutputEvent {
    pub fn is_exit(&self) -> bool {
        matches!(self, OutputEvent::Exit { .. })
    }

    pub fn into_record(self) -> StreamRecord {
        match self {
            OutputEvent::System { message } => StreamRecord::System { data: message },
            OutputEvent::Fragment { origin, content } => StreamRecord::Html {
                data: content,
                origin,
            },
            OutputEvent::FullSnapshot { content } => StreamRecord::HtmlFull { data: content },
            OutputEvent::ErrorLine { message } => StreamRecord::Error { data: message },
            OutputEvent::Exit { code } => StreamRecord::Exit { code },
        }
    }
}

/// Cheap identity for a full-state snapshot: content length plus a digest of
/// a bounded head/tail sample. Producers that re-render identical state every
/// tick collapse to one delivered snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotFingerprint {
    len: u64,
    digest: [u8; 32],
}

const SAMPLE_BYTES: usize = 1024;

impl SnapshotFingerprint {
    pub fn of(content: &str) -> Self {
        let bytes = content.as_bytes();
        let mut hasher = Sha256::new();
        hasher.update(&bytes[..bytes.len().min(SAMPLE_BYTES)]);
        if bytes.len() > SAMPLE_BYTES {
            hasher.update(&bytes[bytes.len() - SAMPLE_BYTES..]);
        }
        Self {
            len: bytes.len() as u64,
            digest: hasher.finalize().into(),
        }
    }
}
