//! Error types for fixture-foundry.
//!
//! Adapters talk to the outside world with `anyhow::Result`; everything that
//! crosses the public API is folded into [`Error`] so callers can tell a
//! health-check timeout from an engine failure or a broken deployment.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for fixture-foundry operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ContainerStart(#[from] ContainerStartError),

    #[error(transparent)]
    NetworkConflict(#[from] NetworkConflict),

    #[error("failed to acquire network {name}: {source:#}")]
    Network {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error("container runtime unavailable: {0:#}")]
    RuntimeUnavailable(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// True when acquisition failed because a readiness probe never passed.
    pub fn is_health_check_timeout(&self) -> bool {
        matches!(
            self,
            Error::ContainerStart(ContainerStartError::Timeout(_))
        )
    }
}

/// A container could not be brought to the ready state.
#[derive(Error, Debug)]
pub enum ContainerStartError {
    #[error("container runtime failed to {stage} container from {image}: {source:#}")]
    Engine {
        image: String,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Timeout(#[from] HealthCheckTimeout),
}

impl ContainerStartError {
    pub fn engine(image: &str, stage: &'static str, source: anyhow::Error) -> Self {
        Self::Engine {
            image: image.to_string(),
            stage,
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[derive(Error, Debug, Clone)]
#[error(
    "{resource} not ready after {timeout:?} (probe: {probe}, polled every {interval:?}, {attempts} attempts{})",
    last_error_suffix(.last_error)
)]
pub struct HealthCheckTimeout {
    pub resource: String,
    pub probe: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub attempts: u32,
    pub last_error: Option<String>,
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(", last error: {err}"),
        None => String::new(),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("network {name} already exists with driver {driver}, expected bridge")]
pub struct NetworkConflict {
    pub name: String,
    pub driver: String,
}

/// Step of a stack's lifecycle that the automation API rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperation {
    Select,
    Configure,
    Up,
    Destroy,
    Remove,
}

impl fmt::Display for StackOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Select => "select",
            Self::Configure => "configure",
            Self::Up => "up",
            Self::Destroy => "destroy",
            Self::Remove => "remove",
        };
        f.write_str(op)
    }
}

#[derive(Error, Debug)]
#[error("stack {stack} failed during {operation}: {diagnostics}")]
pub struct DeploymentError {
    pub stack: String,
    pub operation: StackOperation,
    /// Provider output as reported by the automation API.
    pub diagnostics: String,
    #[source]
    pub source: anyhow::Error,
}

impl DeploymentError {
    pub fn new(stack: impl Into<String>, operation: StackOperation, source: anyhow::Error) -> Self {
        Self {
            stack: stack.into(),
            operation,
            diagnostics: format!("{source:#}"),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_check_timeout_names_resource_and_budget() {
        let err = HealthCheckTimeout {
            resource: "container pg-1234".into(),
            probe: "tcp 5432".into(),
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(500),
            attempts: 4,
            last_error: Some("connection refused".into()),
        };

        let msg = err.to_string();
        assert!(msg.contains("container pg-1234"));
        assert!(msg.contains("2s"));
        assert!(msg.contains("tcp 5432"));
        assert!(msg.ends_with("last error: connection refused)"));
    }

    #[test]
    fn timeout_is_distinguished_from_engine_failure() {
        let timeout: Error = ContainerStartError::from(HealthCheckTimeout {
            resource: "x".into(),
            probe: "y".into(),
            timeout: Duration::from_secs(1),
            interval: Duration::from_secs(1),
            attempts: 1,
            last_error: None,
        })
        .into();
        let engine: Error =
            ContainerStartError::engine("img", "create", anyhow::anyhow!("boom")).into();

        assert!(timeout.is_health_check_timeout());
        assert!(!engine.is_health_check_timeout());
        assert!(engine.to_string().contains("failed to create container from img"));
    }

    #[test]
    fn deployment_error_carries_diagnostics() {
        let source = anyhow::anyhow!("error: aws:lambda:Function creation failed")
            .context("pulumi up exited with status 255");
        let err = DeploymentError::new("organization/api/test", StackOperation::Up, source);

        assert_eq!(err.operation, StackOperation::Up);
        assert!(err.diagnostics.contains("creation failed"));
        assert!(err.to_string().starts_with("stack organization/api/test failed during up"));
    }
}
