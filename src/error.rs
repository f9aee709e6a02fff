//! Error taxonomy for the capture pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionState;

/// Error type for camera session and capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The user refused hardware access.
    #[error("camera permission denied")]
    PermissionDenied,
    /// No permission decision has been made yet.
    #[error("camera permission has not been granted yet")]
    PermissionRequired,
    /// Device enumeration was refused or no device is present.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The platform failed to open the device.
    #[error("failed to open device: {0}")]
    DeviceOpen(String),
    /// The device went away.
    #[error("device disconnected")]
    DeviceDisconnected,
    /// Fatal device error.
    #[error("device error: {0}")]
    Device(String),
    /// Capture session could not be configured.
    #[error("session configuration failed: {0}")]
    Configuration(String),
    /// A still request failed.
    #[error("still capture failed: {0}")]
    Capture(String),
    /// Writing a captured frame to storage failed.
    #[error("failed to persist frame to {}: {source}", path.display())]
    Persistence {
        /// Destination that could not be written.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// Operation attempted outside a state that permits it.
    #[error("operation not valid while {0}")]
    NotReady(SessionState),
    /// Malformed configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
