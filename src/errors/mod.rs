pub mod handlers;

use std::time::Duration;
use thiserror::Error;

pub use handlers::{LockRetry, RetryFailure, RetryPolicy};

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("Disk image error: {0}")]
    DiskImage(#[from] DiskImageError),

    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Class not found: {class_id}")]
    ClassNotFound { class_id: String },

    #[error("VM {vmid} is not part of class {class_id}")]
    VmNotInClass { class_id: String, vmid: u32 },

    #[error("Class {class_id} is {state}, cannot start {requested}")]
    InvalidState {
        class_id: String,
        state: String,
        requested: String,
    },

    #[error("Clone of {name} failed: {message}")]
    CloneFailed { name: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Error, Debug, Clone)]
pub enum HypervisorError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {upid} failed: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },
}

// Substrings the hypervisor uses when a VM or its config file is held by another operation.
const LOCK_MARKERS: &[&str] = &["locked", "can't lock", "cannot lock", "busy"];

pub fn looks_like_lock_contention(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    LOCK_MARKERS.iter().any(|marker| message.contains(marker))
}

impl HypervisorError {
    /// Lock contention is the only failure class worth retrying.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            HypervisorError::Api { message, .. } => looks_like_lock_contention(message),
            HypervisorError::TaskFailed { exit_status, .. } => {
                looks_like_lock_contention(exit_status)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for HypervisorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            HypervisorError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            HypervisorError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            HypervisorError::Transport(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum DiskImageError {
    #[error("`{command}` exited with {status:?}: {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Image already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("No online nodes available for placement")]
    NoNodesOnline,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Conflicting update for class {0}")]
    Conflict(String),
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_messages_are_retryable() {
        let err = HypervisorError::Api {
            status: 500,
            message: "can't lock file '/var/lock/qemu-server/lock-9000.conf' - got timeout"
                .to_string(),
        };
        assert!(err.is_lock_contention());

        let err = HypervisorError::TaskFailed {
            upid: "UPID:pve1:0001".to_string(),
            exit_status: "VM 9000 is locked (clone)".to_string(),
        };
        assert!(err.is_lock_contention());
    }

    #[test]
    fn validation_messages_are_terminal() {
        let err = HypervisorError::Api {
            status: 400,
            message: "invalid vmid".to_string(),
        };
        assert!(!err.is_lock_contention());
        assert!(!HypervisorError::NotFound("VM 1".to_string()).is_lock_contention());
        assert!(!HypervisorError::Timeout {
            operation: "clone".to_string(),
            after: Duration::from_secs(1),
        }
        .is_lock_contention());
    }
}
