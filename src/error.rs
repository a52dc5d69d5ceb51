use thiserror::Error;

/// Error kinds surfaced by the engine, its replay driver, and its snapshot codec.
///
/// Each variant maps to a stable process exit code (see [`EngineError::exit_code`])
/// so a CLI front end can translate a failure into the documented exit envelope
/// without re-deriving the mapping itself.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("bad config: {0}")]
    BadConfig(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("bad snapshot: {0}")]
    BadSnapshot(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Stable exit code for CLI/process boundaries, following the teacher's
    /// convention of giving each error kind a fixed numeric identity.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::BadConfig(_) => 2,
            EngineError::BadInput(_) => 2,
            EngineError::InvariantViolation(_) => 3,
            EngineError::PolicyViolation(_) => 4,
            EngineError::IoError(_) | EngineError::BadSnapshot(_) => 5,
            EngineError::Cancelled => 6,
        }
    }

    /// Stable kind tag for structured error envelopes (e.g. `{"kind": ...}`).
    pub fn kind_tag(&self) -> &'static str {
        match self {
            EngineError::BadConfig(_) => "bad_config",
            EngineError::BadInput(_) => "bad_input",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::PolicyViolation(_) => "policy_violation",
            EngineError::IoError(_) => "io_error",
            EngineError::BadSnapshot(_) => "bad_snapshot",
            EngineError::Cancelled => "cancelled",
        }
    }

    /// A machine-stable remediation hint, present only for the kinds the
    /// error design names as carrying one (`BadInput`, `PolicyViolation`).
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            EngineError::BadInput(_) => {
                Some("check the operation stream header and row values against the op,key,value contract")
            }
            EngineError::PolicyViolation(_) => {
                Some("relax the configured policy/limit or request an operation this policy allows")
            }
            _ => None,
        }
    }

    /// The structured JSON error envelope emitted on stderr when the driver
    /// runs in structured-output mode: `{kind, detail, hint}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind_tag(),
            "detail": self.to_string(),
            "hint": self.hint(),
        })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        EngineError::BadSnapshot(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        EngineError::BadSnapshot(err.to_string())
    }
}
