//! Error types for the reconciliation engine.

use thiserror::Error;

use crate::store::ControlLevel;

/// Failures reported by the configuration store or the desired-state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Proxy settings are not controllable")]
    NotControllable,

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of one apply-and-verify run. All of them are caught at the apply
/// queue and turned into a visible error; none stop the queue.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{}", control_message(.0))]
    ControlLevelDenied(ControlLevel),

    #[error("Port must be an integer from 1 to 65535 (got {0:?})")]
    InvalidPort(String),

    #[error(
        "Proxy settings did not converge to SOCKS5 localhost:{port}{} (last observed: {last_observed})",
        dns_suffix(.dns)
    )]
    ApplyNotConverged {
        port: u16,
        dns: bool,
        last_observed: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Store(StoreError),
}

fn control_message(level: &ControlLevel) -> &'static str {
    match level {
        ControlLevel::ControlledByOther => "Proxy is controlled by another application.",
        ControlLevel::NotControllable | ControlLevel::Controllable => {
            "Proxy settings are not controllable."
        }
    }
}

fn dns_suffix(dns: &bool) -> &'static str {
    if *dns { ", DNS" } else { "" }
}

impl From<StoreError> for ReconcileError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::PermissionDenied(detail) => Self::PermissionDenied(detail),
            StoreError::NotControllable => Self::ControlLevelDenied(ControlLevel::NotControllable),
            other => Self::Store(other),
        }
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
