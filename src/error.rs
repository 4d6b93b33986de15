//! Error taxonomy shared by all subsystems.
//!
//! Library code returns typed `GcError`s; the CLI layer wraps them with
//! `anyhow` context and maps them onto the JSON error envelope via
//! [`GcError::code`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GcError>;

#[derive(Debug, Error)]
pub enum GcError {
    /// Malformed input, undefined variable after substitution, failed
    /// backend autodetection.
    #[error("configuration error: {0}")]
    Config(String),

    /// Parameter-name collision, tracking-status collision, malformed
    /// sub-space.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Submission/purge failure, sandbox creation or deletion failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Unexecutable command or child spawn failure.
    #[error("process error: {0}")]
    Process(String),

    /// A bounded wait exceeded its deadline. Always recoverable: the
    /// caller decides between retry and failure.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Persistent-store I/O failure (job records, adapter mapping).
    #[error("job store error: {msg}")]
    Job {
        msg: String,
        #[source]
        source: std::io::Error,
    },
}

impl GcError {
    pub fn job(msg: impl Into<String>, source: std::io::Error) -> Self {
        GcError::Job {
            msg: msg.into(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GcError::Timeout(_))
    }

    /// Stable machine-readable code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GcError::Config(_) => "config_error",
            GcError::Parameter(_) => "parameter_error",
            GcError::Backend(_) => "backend_error",
            GcError::Process(_) => "process_error",
            GcError::Timeout(_) => "timeout",
            GcError::Job { .. } => "job_store_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_recoverable() {
        assert!(GcError::Timeout("t".into()).is_timeout());
        assert!(!GcError::Backend("b".into()).is_timeout());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(GcError::Config("x".into()).code(), "config_error");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(GcError::job("write job_0.txt", io).code(), "job_store_error");
    }
}
