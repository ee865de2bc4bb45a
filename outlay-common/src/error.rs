use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for outlay operations
#[derive(Error, Debug)]
pub enum OutlayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Process execution error: {0}")]
    Process(#[from] ProcessError),

    #[error("Wayland protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Control request failed: {0}")]
    Control(#[from] ControlError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path:?}")]
    FileRead { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse TOML configuration: {message}")]
    TomlParse { message: String },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Failed to include {path:?}: {message}")]
    Include { path: String, message: String },

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Errors raised while turning a matched profile into a configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("output '{head}' doesn't support mode '{width}x{height}@{refresh}'")]
    ModeUnavailable {
        head: String,
        width: i32,
        height: i32,
        refresh: String,
    },

    #[error("head '{head}' is not assigned a profile output")]
    Unassigned { head: String },

    #[error("head {head} is no longer known to the compositor")]
    UnknownHead { head: String },

    #[error("mode for head '{head}' is no longer known to the compositor")]
    UnknownMode { head: String },
}

/// IPC communication errors
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to create IPC socket at {path:?}")]
    SocketCreation { path: PathBuf, source: std::io::Error },

    #[error("Invalid IPC message format")]
    InvalidMessage,

    #[error("Daemon not responding")]
    DaemonUnresponsive,

    #[error("WAYLAND_DISPLAY is not set")]
    NoDisplay,
}

/// Process execution errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Command execution failed: {command:?}")]
    Execution { command: String, source: std::io::Error },
}

/// Wayland protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to connect to the Wayland display: {message}")]
    Connect { message: String },

    #[error("compositor doesn't support wlr-output-management-unstable-v1")]
    Unsupported,

    #[error("output manager finished")]
    ManagerFinished,

    #[error("Wayland dispatch failed: {message}")]
    Dispatch { message: String },
}

/// Failure kinds reported back to control-plane callers
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlError {
    #[error("profile '{0}' not found")]
    ProfileNotFound(String),

    #[error("profile does not match the current output configuration")]
    ProfileNotMatched,

    #[error("profile could not be applied by the compositor")]
    ProfileNotApplied,

    #[error("configuration could not be loaded: {0}")]
    ConfigNotLoaded(String),
}

// Convenience type alias
pub type Result<T> = std::result::Result<T, OutlayError>;

impl From<toml::de::Error> for OutlayError {
    fn from(err: toml::de::Error) -> Self {
        OutlayError::Config(ConfigError::TomlParse {
            message: err.to_string(),
        })
    }
}

// Error reporting utilities
pub trait ErrorReporting {
    fn log_error(&self, context: &str);
    fn user_friendly_message(&self) -> String;
}

impl ErrorReporting for OutlayError {
    fn log_error(&self, context: &str) {
        log::error!("{}: {:?}", context, self);
    }

    fn user_friendly_message(&self) -> String {
        match self {
            OutlayError::Config(ConfigError::FileRead { path, .. }) => {
                format!("Configuration file not found: {:?}", path)
            }
            OutlayError::Config(ConfigError::TomlParse { message }) => {
                format!("Invalid configuration format: {}", message)
            }
            OutlayError::Protocol(ProtocolError::Unsupported) => {
                "The compositor doesn't support wlr-output-management-unstable-v1".to_string()
            }
            OutlayError::Ipc(IpcError::DaemonUnresponsive) => {
                "outlay daemon is not responding. Please restart the daemon.".to_string()
            }
            OutlayError::Control(err) => err.user_friendly_message(),
            _ => self.to_string(),
        }
    }
}

impl ControlError {
    pub fn user_friendly_message(&self) -> String {
        match self {
            ControlError::ProfileNotFound(_) => "Profile not found".to_string(),
            ControlError::ProfileNotMatched => {
                "Profile does not match the current output configuration".to_string()
            }
            ControlError::ProfileNotApplied => {
                "Profile could not be applied by the compositor".to_string()
            }
            ControlError::ConfigNotLoaded(message) => {
                format!("Configuration could not be loaded: {}", message)
            }
        }
    }
}

impl From<ApplyError> for ControlError {
    fn from(_err: ApplyError) -> Self {
        ControlError::ProfileNotApplied
    }
}
