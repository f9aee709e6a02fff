//! Runtime configuration for the capture pipeline.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::traits::{DeviceId, FourCC};

/// Configuration for a [`crate::CaptureCoordinator`].
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    device: Option<DeviceId>,
    format: FourCC,
    capture_delay: Duration,
    lock_timeout: Duration,
    sink_capacity: usize,
    buffer_count: u32,
    cache_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            format: FourCC::MJPG,
            capture_delay: Duration::from_millis(3000),
            lock_timeout: Duration::from_millis(2500),
            sink_capacity: 1,
            buffer_count: 4,
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("still-cam")
}

impl CaptureConfig {
    /// Load configuration from `STILL_CAM_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(device) = env_var("STILL_CAM_DEVICE") {
            config.device = Some(DeviceId(device));
        }
        if let Some(format) = env_var("STILL_CAM_FORMAT") {
            config.format = FourCC::parse(&format).ok_or_else(|| {
                CaptureError::Config(format!("STILL_CAM_FORMAT must be 4 characters, got {format:?}"))
            })?;
        }
        if let Some(ms) = env_var("STILL_CAM_CAPTURE_DELAY_MS") {
            config.capture_delay = parse_millis("STILL_CAM_CAPTURE_DELAY_MS", &ms)?;
        }
        if let Some(ms) = env_var("STILL_CAM_LOCK_TIMEOUT_MS") {
            config.lock_timeout = parse_millis("STILL_CAM_LOCK_TIMEOUT_MS", &ms)?;
        }
        if let Some(dir) = env_var("STILL_CAM_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Open this device instead of the first enumerated one.
    #[must_use]
    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the preview surface and still pixel format.
    #[must_use]
    pub const fn with_format(mut self, format: FourCC) -> Self {
        self.format = format;
        self
    }

    /// Set the delay between a capture trigger and the still request.
    #[must_use]
    pub const fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Set how long an open waits for an in-progress close.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the frame sink capacity.
    #[must_use]
    pub const fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    /// Set the buffer count for the capture stream.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Set the directory stills are written to.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = dir;
        self
    }

    /// Device to open, if pinned.
    pub const fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Preview surface and still pixel format.
    pub const fn format(&self) -> FourCC {
        self.format
    }

    /// Delay between trigger and still request.
    pub const fn capture_delay(&self) -> Duration {
        self.capture_delay
    }

    /// Maximum wait for the device lock on open.
    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Frame sink capacity.
    pub const fn sink_capacity(&self) -> usize {
        self.sink_capacity
    }

    /// Driver buffer count.
    pub const fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    /// Directory stills are written to.
    pub const fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| CaptureError::Config(format!("{name}={value:?}: {err}")))
}
