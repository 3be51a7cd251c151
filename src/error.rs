//! Error types for the diskmaker daemon
//!
//! Provides structured error types for device enumeration, identity
//! resolution, filtering, claiming and result publication.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the discovery engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Enumeration Errors
    // =========================================================================
    #[error("Command {command} failed (exit code {code:?}): {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Block device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Could not parse any of the {rows} lsblk entries")]
    NoParsableRows { rows: usize },

    // =========================================================================
    // Identity Errors
    // =========================================================================
    #[error("Could not evaluate symlink {path}: {reason}")]
    SymlinkEval { path: String, reason: String },

    #[error("Error listing files matching {pattern}: {reason}")]
    Glob { pattern: String, reason: String },

    // =========================================================================
    // Filter Errors
    // =========================================================================
    #[error("Filter {filter} failed for device {device}: {reason}")]
    FilterEvaluation {
        filter: String,
        device: String,
        reason: String,
    },

    #[error("Device has no kernel name: {0}")]
    EmptyKernelName(String),

    // =========================================================================
    // Claim Errors
    // =========================================================================
    #[error("Device busy: {device}")]
    DeviceBusy { device: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Host tools and the API server recover on their own
            Error::CommandFailed { .. }
            | Error::Enumeration(_)
            | Error::NoParsableRows { .. }
            | Error::Kube(_) => ErrorAction::RequeueWithBackoff,

            // Another process holds the device, check again next cycle
            Error::DeviceBusy { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            Error::Configuration(_) | Error::YamlParse(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::CommandFailed { .. } | Error::Kube(_) | Error::DeviceBusy { .. }
        )
    }
}

/// Result type alias for the discovery engine
pub type Result<T> = std::result::Result<T, Error>;
