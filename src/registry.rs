//! Read-only queries over the platform's capture devices.

use tracing::debug;

use crate::error::{CaptureError, Result};
use crate::traits::{CameraPlatform, DeviceDescriptor, DeviceId, SurfaceDescriptor};

/// Enumerates devices and picks output sizes. Holds no state of its own.
#[derive(Debug)]
pub struct DeviceRegistry<'a, P> {
    platform: &'a P,
}

impl<'a, P: CameraPlatform> DeviceRegistry<'a, P> {
    /// Query `platform`.
    pub const fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// List available devices. An empty list means no device is present.
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.platform.enumerate().map_err(|err| match err {
            CaptureError::DeviceUnavailable(_) => err,
            other => CaptureError::DeviceUnavailable(other.to_string()),
        })?;
        debug!(count = devices.len(), "enumerated capture devices");
        Ok(devices)
    }

    /// Find the device to open: `preferred` if given, otherwise the first one.
    pub fn select(&self, preferred: Option<&DeviceId>) -> Result<DeviceDescriptor> {
        let devices = self.list_devices()?;
        let found = match preferred {
            Some(id) => devices.into_iter().find(|d| &d.id == id),
            None => devices.into_iter().next(),
        };
        found.ok_or_else(|| {
            CaptureError::DeviceUnavailable(preferred.map_or_else(
                || "no capture devices present".to_owned(),
                |id| format!("device {id} not present"),
            ))
        })
    }
}

/// First supported output size whose pixel format the surface accepts.
pub fn best_preview_size(
    descriptor: &DeviceDescriptor,
    surface: &SurfaceDescriptor,
) -> Result<(u32, u32)> {
    descriptor
        .outputs
        .iter()
        .find(|output| output.fourcc == surface.format)
        .map(|output| (output.width, output.height))
        .ok_or_else(|| {
            CaptureError::Configuration(format!(
                "device {} has no {} output for the preview surface",
                descriptor.id, surface.format
            ))
        })
}
