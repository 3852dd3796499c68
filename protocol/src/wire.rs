use serde::Deserialize;
use serde::Serialize;

/// One record on the server-push stream. Each record is serialized as a
/// single JSON object on its own `data:` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord {
    /// Announcement emitted before any job output, e.g. the command line
    /// about to run.
    System { data: String },
    /// An incremental chunk of formatted output.
    Html { data: String, origin: OutputOrigin },
    /// A complete re-rendering of the accumulated output, used to
    /// resynchronize a client.
    HtmlFull { data: String },
    /// A line that should render distinctly as an error.
    Error { data: String },
    /// Terminal record carrying the job's completion status. Always the last
    /// record of a stream.
    Exit { code: i32 },
    /// Emitted on idle streams so proxies do not drop the connection.
    Keepalive,
}

impl StreamRecord {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamRecord::Exit { .. })
    }
}

/// Which of the job's output channels a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOrigin {
    Stdout,
    Stderr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn fragment_record_wire_shape() {
        let record = StreamRecord::Html {
            data: "<pre>hello</pre>".to_string(),
            origin: OutputOrigin::Stdout,
        };
        let value = serde_json::to_value(&record).expect("serialize record");
        assert_eq!(
            value,
            json!({"type": "html", "data": "<pre>hello</pre>", "origin": "stdout"})
        );
    }

    #[test]
    fn snapshot_and_exit_wire_shapes() {
        let snapshot = StreamRecord::HtmlFull {
            data: "full body".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&snapshot).expect("serialize snapshot"),
            json!({"type": "html_full", "data": "full body"})
        );

        let exit = StreamRecord::Exit { code: 0 };
        assert_eq!(
            serde_json::to_value(&exit).expect("serialize exit"),
            json!({"type": "exit", "code": 0})
        );
        assert!(exit.is_terminal());
    }

    #[test]
    fn keepalive_round_trips() {
        let parsed: StreamRecord =
            serde_json::from_value(json!({"type": "keepalive"})).expect("parse keepalive");
        assert_eq!(parsed, StreamRecord::Keepalive);
        assert!(!parsed.is_terminal());
    }
}
