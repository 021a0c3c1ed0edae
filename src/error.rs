use std::io;
use thiserror::Error;

/// Errors that end a bridge instance.
///
/// Would-block on the lambda pipes never shows up here; it is reported as
/// [`crate::relay::Pull::Pending`] and retried by the relay. A lambda that
/// exits is not an error either, see [`crate::relay::SessionState::Draining`].
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Failed to spawn lambda `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Device error [{device}]: {reason}")]
    Device { device: String, reason: String },

    #[error("Pipe error: {0}")]
    Pipe(#[source] io::Error),

    #[error("Invalid module arguments: {0}")]
    ModuleArgs(String),
}

impl BridgeError {
    pub fn device(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::Device {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the instance failed before reaching the running state.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Usage(_) | Self::Setup(_) | Self::Spawn { .. } | Self::ModuleArgs(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
