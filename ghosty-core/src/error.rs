//! Error types for Ghosty operations

use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrator::{ActivationStep, SessionState};

/// Failures of the interface identity layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Required tool is not installed: {0}")]
    ToolUnavailable(String),

    #[error("Network interface not found: {0}")]
    NotFound(String),

    #[error("No original hardware address recorded for {0}")]
    NoRecord(String),

    #[error("Invalid hardware address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bring {interface} down: {reason}")]
    InterfaceDownFailed { interface: String, reason: String },

    #[error("Failed to change hardware address of {interface}: {reason}")]
    AddressChangeFailed { interface: String, reason: String },

    #[error("Failed to bring {interface} up: {reason}")]
    InterfaceUpFailed { interface: String, reason: String },
}

/// Failures of the tunnel client session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Tunnel client is not installed: {0}")]
    ToolUnavailable(String),

    #[error("Tunnel config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Tunnel auth file not found: {}", .0.display())]
    AuthNotFound(PathBuf),

    #[error("No tunnel configuration set")]
    NotConfigured,

    #[error("Tunnel is already connected")]
    AlreadyConnected,

    #[error("Tunnel is not connected")]
    NotConnected,

    #[error("Tunnel client failed to start: {0}")]
    StartupFailed(String),
}

/// Failures of the anonymity network service and circuit rotation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnonymityError {
    #[error("Required tool is not installed: {0}")]
    ToolUnavailable(String),

    #[error("Anonymity service failed to start: {0}")]
    ServiceStartFailed(String),

    #[error("Anonymity service failed to stop: {0}")]
    ServiceStopFailed(String),

    #[error("Anonymity service is not running ({0})")]
    ServiceNotRunning(String),

    #[error("Circuit rotation is already running")]
    AlreadyRunning,

    #[error("Rotation tool failed to start: {0}")]
    RotationStartFailed(String),

    #[error("Anonymity service started but rotation failed: {0}")]
    RotationFailedAfterServiceStart(Box<AnonymityError>),

    #[error("Control port error: {0}")]
    ControlPort(String),
}

impl AnonymityError {
    /// The underlying failure, looking through `RotationFailedAfterServiceStart`
    pub fn root(&self) -> &AnonymityError {
        match self {
            AnonymityError::RotationFailedAfterServiceStart(inner) => inner.root(),
            other => other,
        }
    }
}

/// Configuration loading and validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A failure raised by one of the managers during activation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Anonymity(#[from] AnonymityError),
}

/// Orchestrator failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Cannot start while {0}")]
    Busy(SessionState),

    #[error("{step} failed: {source}")]
    StepFailed {
        step: ActivationStep,
        #[source]
        source: StepError,
    },

    #[error("Activation was interrupted by runtime shutdown")]
    Interrupted,
}

impl ControlError {
    /// The manager error behind a failed step
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            ControlError::StepFailed { source, .. } => Some(source),
            ControlError::Busy(_) | ControlError::Interrupted => None,
        }
    }
}
