// ABOUTME: Error taxonomy for the sandbox lifecycle engine
// ABOUTME: Separates validation, hook, runtime, timeout and transition failures

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::Phase;
use crate::runtime::ClientError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error returned by engine and handle transitions.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The specification is invalid; raised before any runtime call.
    /// Always recoverable by fixing the request.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A user or default hook failed; the transition stopped at that point.
    #[error("{edge} hook failed: {source}")]
    Hook {
        edge: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The runtime client failed an operation. Fatal for the transition;
    /// the phase is left at the last completed step.
    #[error("runtime {op} failed: {source}")]
    Runtime {
        op: &'static str,
        #[source]
        source: ClientError,
    },

    /// The readiness probe did not succeed in time; the handle stays in
    /// `Started` so the caller may retry without recreating the sandbox.
    #[error("sandbox not ready after {waited:?}")]
    ReadyTimeout { waited: Duration },

    /// The runtime did not confirm a stop within the grace period.
    #[error("sandbox did not stop within {waited:?}")]
    StopTimeout { waited: Duration },

    /// Any transition attempted after `terminate` completed.
    #[error("sandbox already terminated")]
    AlreadyTerminated,

    /// The transition is not legal from the current phase.
    #[error("cannot {action} a sandbox in phase {from}")]
    InvalidTransition { from: Phase, action: &'static str },
}

/// Specification problems detected before talking to the runtime.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid port declaration '{0}'")]
    Port(String),

    /// Every invalid mount is collected and reported in one error so the
    /// caller sees the full list instead of the first failure.
    #[error("{} invalid mount(s): {}", .0.len(), render_mount_errors(.0))]
    Mounts(Vec<MountError>),

    #[error("specification declares an image build but no image builder is configured")]
    NoImageBuilder,

    #[error("specification has neither an image nor an image build")]
    MissingImage,
}

impl ValidationError {
    /// Underlying mount failures, if this is the aggregated mount variant.
    pub fn mount_errors(&self) -> &[MountError] {
        match self {
            ValidationError::Mounts(errors) => errors,
            _ => &[],
        }
    }
}

/// A single invalid mount declaration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountError {
    #[error("image mount sub-path '{path}' must be relative to the image root")]
    AbsoluteSubPath { path: String },

    #[error("image mount sub-path '{path}' escapes the image root")]
    EscapingSubPath { path: String },

    #[error("bind mount host path '{path}' must be absolute")]
    RelativeHostPath { path: String },
}

fn render_mount_errors(errors: &[MountError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_errors_are_reported_jointly() {
        let err = ValidationError::Mounts(vec![
            MountError::AbsoluteSubPath {
                path: "/var/www".to_string(),
            },
            MountError::EscapingSubPath {
                path: "../var/www".to_string(),
            },
        ]);

        let rendered = err.to_string();
        assert!(rendered.contains("2 invalid mount(s)"));
        assert!(rendered.contains("/var/www"));
        assert!(rendered.contains("../var/www"));
        assert_eq!(err.mount_errors().len(), 2);
    }

    #[test]
    fn test_engine_error_preserves_runtime_source() {
        let err = EngineError::Runtime {
            op: "create",
            source: ClientError::Api("boom".to_string()),
        };
        assert!(err.to_string().contains("create"));
        assert!(err.to_string().contains("boom"));
    }
}
