//! Still-Cam: a single-camera still capture pipeline.
//!
//! A [`CaptureCoordinator`] opens a camera when the preview surface is ready,
//! runs a live preview, and on a user trigger captures one still after a
//! short delay and writes it to the cache directory. The camera platform is
//! abstracted behind [`CameraPlatform`], with a V4L2 backend for real
//! hardware and a scripted mock for tests.

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod lock;
pub mod registry;
pub mod session;
pub mod sink;
pub mod storage;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use config::CaptureConfig;
pub use coordinator::{CaptureCoordinator, CaptureEvent, EventReceiver};
pub use device::V4l2Platform;
pub use error::{CaptureError, Result};
pub use registry::DeviceRegistry;
pub use session::SessionState;
pub use storage::StorageLocator;
pub use traits::{CameraPlatform, DeviceDescriptor, DeviceId, FourCC, FrameHandle};
