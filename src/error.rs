//! Error types
//!
//! Most of the pipeline never returns an error: unavailable data degrades to
//! empty records. These types cover the few places where a failure has to be
//! named, either to be recorded in the report or to abort a run.

use std::time::Duration;
use thiserror::Error;

/// Failure of one backend command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("debugger backend crashed while running '{command}': {reason}")]
    Crashed { command: String, reason: String },

    #[error("command '{command}' timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("no recorded output for command '{0}'")]
    NotRecorded(String),
}

impl BackendError {
    pub fn command(&self) -> &str {
        match self {
            BackendError::Crashed { command, .. } | BackendError::TimedOut { command, .. } => {
                command
            }
            BackendError::NotRecorded(command) => command,
        }
    }
}

/// Failure of the object-introspection capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntrospectionError {
    #[error("object at {0:#x} is not inspectable")]
    NotInspectable(u64),

    #[error("introspection is not available: {0}")]
    Unavailable(String),
}

/// Failure of a whole analysis run
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("invalid analyzer configuration: {0}")]
    InvalidConfig(String),

    #[error("stage '{stage}' requires '{field}' which no earlier stage produces")]
    StageOrder { stage: String, field: String },

    #[error("analysis panicked: {0}")]
    Panicked(String),
}

/// Errors loading configuration files
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_command() {
        let err = BackendError::TimedOut {
            command: "dumpheap -stat".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.command(), "dumpheap -stat");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_introspection_error_display() {
        let err = IntrospectionError::NotInspectable(0x1000);
        assert_eq!(err.to_string(), "object at 0x1000 is not inspectable");
    }
}
