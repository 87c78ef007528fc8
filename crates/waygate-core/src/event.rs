//! The per-run event stream.
//!
//! Every run produces an ordered sequence of [`ExecutionEvent`]s, whether it
//! executes in the local runtime or in an attached browser. Stdout and
//! stderr chunks may be coalesced by transports but are never reordered
//! within a stream; `exit` and `error` are terminal.

use serde::{Deserialize, Serialize};

/// Resource usage reported with a terminal `exit` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunUsage {
    /// Wall-clock time consumed by the run, in milliseconds.
    pub wall_ms: u64,
    /// Peak guest memory, in bytes, when the engine reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_bytes: Option<u64>,
}

/// Failure categories surfaced to clients.
///
/// These are gateway-level kinds, never host-language type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The request was malformed (e.g. missing `code`).
    Validation,
    /// A network or filesystem guard refused the operation.
    PolicyDenied,
    /// The run exceeded its wall-clock deadline.
    Timeout,
    /// A stdout/stderr buffer overflowed its limit.
    OutputLimitExceeded,
    /// The bundler or a mount build failed.
    DepsResolutionFailed,
    /// The browser path was chosen but no executor is attached.
    NoExecutorAttached,
    /// Programmer error or infrastructure fault.
    Internal,
}

impl ErrorKind {
    /// Stable string form used in logs and wire payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PolicyDenied => "policyDenied",
            Self::Timeout => "timeout",
            Self::OutputLimitExceeded => "outputLimitExceeded",
            Self::DepsResolutionFailed => "depsResolutionFailed",
            Self::NoExecutorAttached => "noExecutorAttached",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event in a run's ordered stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    /// Lifecycle progress marker (`building`, `dispatched`, `running`).
    Progress {
        /// Phase label.
        phase: String,
    },
    /// A chunk of standard output.
    Stdout {
        /// Raw bytes, base64 on the wire.
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    /// A chunk of standard error.
    Stderr {
        /// Raw bytes, base64 on the wire.
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    /// Terminal: the run finished.
    Exit {
        /// Process-style exit code (0 success, 124 timeout, 137 memory).
        code: i32,
        /// Resource usage for the run.
        #[serde(default)]
        usage: RunUsage,
    },
    /// Terminal: the run failed before or outside guest execution.
    Error {
        /// Failure category.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
}

impl ExecutionEvent {
    /// Whether this event terminates its run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit { .. } | Self::Error { .. })
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_round_trips_as_base64() {
        let ev = ExecutionEvent::Stdout {
            bytes: b"hello\n".to_vec(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"stdout\""));
        assert!(json.contains("aGVsbG8K"));

        let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn exit_is_terminal() {
        let ev = ExecutionEvent::Exit {
            code: 0,
            usage: RunUsage::default(),
        };
        assert!(ev.is_terminal());
        assert!(
            !ExecutionEvent::Progress {
                phase: "running".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn error_kind_wire_form_is_camel_case() {
        let ev = ExecutionEvent::Error {
            kind: ErrorKind::OutputLimitExceeded,
            message: "stdout limit".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("outputLimitExceeded"));
    }

    #[test]
    fn exit_parses_without_usage() {
        let ev: ExecutionEvent = serde_json::from_str(r#"{"type":"exit","code":1}"#).unwrap();
        assert_eq!(
            ev,
            ExecutionEvent::Exit {
                code: 1,
                usage: RunUsage::default()
            }
        );
    }
}
