//! Execution result and error taxonomy for sandbox sessions

use crate::host::ActingIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Typed failure of a sandbox session or of a single capability call
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxError {
    /// The watchdog stopped guest computation
    #[error("Script terminated due to timeout after {timeout_ms}ms")]
    TimeoutExceeded {
        /// Budget that was exceeded
        timeout_ms: u64,
    },

    /// The session hit its HTTP request cap
    #[error("Tool made too many HTTP requests (limit {limit})")]
    QuotaExceeded {
        /// Configured cap
        limit: u32,
    },

    /// The guest threw, or failed to parse or evaluate
    #[error("{message}")]
    ScriptError {
        /// Message of the guest exception
        message: String,
    },

    /// A capability received arguments of the wrong shape
    #[error("Invalid parameters: {message}")]
    InvalidParameters {
        /// What was wrong
        message: String,
    },

    /// The host collaborator behind a capability failed
    #[error("{capability} failed: {message}")]
    CapabilityError {
        /// Capability name
        capability: String,
        /// Collaborator error
        message: String,
    },
}

impl SandboxError {
    /// Create a script error
    pub fn script(message: impl Into<String>) -> Self {
        SandboxError::ScriptError {
            message: message.into(),
        }
    }

    /// Create an invalid-parameters error
    pub fn invalid(message: impl Into<String>) -> Self {
        SandboxError::InvalidParameters {
            message: message.into(),
        }
    }

    /// Create a capability error
    pub fn capability(capability: impl ToString, message: impl Into<String>) -> Self {
        SandboxError::CapabilityError {
            capability: capability.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::TimeoutExceeded { .. } => "timeout_exceeded",
            SandboxError::QuotaExceeded { .. } => "quota_exceeded",
            SandboxError::ScriptError { .. } => "script_error",
            SandboxError::InvalidParameters { .. } => "invalid_parameters",
            SandboxError::CapabilityError { .. } => "capability_error",
        }
    }

    /// Whether the orchestrator may reasonably retry the invocation.
    ///
    /// Only collaborator failures are transient; everything else is a
    /// property of the script or its inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::CapabilityError { .. })
    }
}

/// Terminal outcome of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// `invoke` returned normally
    Success {
        /// Marshalled return value
        value: Value,
    },

    /// The session failed
    Error {
        /// Typed failure
        error: SandboxError,
    },
}

/// Provenance metadata for tracing and replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProvenance {
    /// Unique id of the session
    pub session_id: String,

    /// Tool name
    pub tool_name: String,

    /// Truncated SHA-256 of the serialized parameters
    pub parameters_hash: String,

    /// When the session started
    pub started_at: DateTime<Utc>,

    /// Wall-clock duration of the whole session
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// HTTP requests attempted (including a refused one)
    pub http_requests: u32,

    /// Identity the invocation was attributed to
    pub acting_identity: ActingIdentity,

    /// Persona nesting depth of this session
    pub nesting_depth: u32,
}

/// The single result of a [`crate::sandbox::ToolRunner`] session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Success value or typed error
    pub outcome: Outcome,

    /// Value passed to `chain.setCustomRaw`, if any
    pub custom_raw: Option<Value>,

    /// Output of the guest's `details()` after a successful invoke
    pub details: Option<String>,

    /// Provenance metadata
    pub provenance: ExecutionProvenance,
}

impl ExecutionResult {
    /// Check if the session succeeded
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Check if the session failed
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error { .. })
    }

    /// Get the value if successful
    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Success { value } => Some(value),
            Outcome::Error { .. } => None,
        }
    }

    /// Get the error if failed
    pub fn error(&self) -> Option<&SandboxError> {
        match &self.outcome {
            Outcome::Error { error } => Some(error),
            Outcome::Success { .. } => None,
        }
    }

    /// Convert into a plain `Result`
    pub fn into_result(self) -> Result<Value, SandboxError> {
        match self.outcome {
            Outcome::Success { value } => Ok(value),
            Outcome::Error { error } => Err(error),
        }
    }
}
