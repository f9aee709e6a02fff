//! Core types and the platform seam the session state machine drives.
//!
//! The platform API is issue-and-return: opening a device, configuring a
//! session and failed captures all report back through [`DeviceCallbacks`],
//! possibly from a thread other than the caller's. Still frames bypass the
//! callbacks and land directly in the session's [`FrameSink`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::sink::FrameSink;

/// Pixel format representation (e.g., YUYV, MJPG).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// Single-frame JPEG.
    pub const JPEG: Self = Self::new(b"JPEG");

    /// Parse a four character code such as `"MJPG"`.
    pub fn parse(code: &str) -> Option<Self> {
        let bytes: [u8; 4] = code.as_bytes().try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// One supported output configuration of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
}

impl OutputConfig {
    /// Create a new output configuration.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
        }
    }
}

/// Platform identifier of a capture device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// An enumerated capture device. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Platform identifier used to open the device.
    pub id: DeviceId,
    /// Human readable name.
    pub name: String,
    /// Supported outputs, in the order the platform reports them.
    pub outputs: Vec<OutputConfig>,
}

/// Descriptor of the on-screen preview target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    /// Surface width in pixels.
    pub width: u32,
    /// Surface height in pixels.
    pub height: u32,
    /// Pixel format the surface consumes.
    pub format: FourCC,
}

/// Encoding of a delivered frame's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    /// JPEG / Motion-JPEG.
    Jpeg,
    /// Packed YUYV 4:2:2.
    Yuyv,
    /// Anything else, tagged with its pixel format.
    Raw(FourCC),
}

impl FrameEncoding {
    /// Map a pixel format to the encoding of frames produced with it.
    #[must_use]
    pub const fn from_fourcc(fourcc: FourCC) -> Self {
        match &fourcc.0 {
            b"MJPG" | b"JPEG" => Self::Jpeg,
            b"YUYV" => Self::Yuyv,
            _ => Self::Raw(fourcc),
        }
    }

    /// File extension used when persisting frames of this encoding.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Yuyv => "yuv",
            Self::Raw(_) => "raw",
        }
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Encoding of the frame bytes.
    pub encoding: FrameEncoding,
    /// Frame sequence number reported by the device.
    pub sequence: u32,
    /// Wall-clock time the frame was captured.
    pub captured_at: DateTime<Utc>,
}

/// A captured still frame.
///
/// Deliberately not `Clone`: a frame has exactly one owner at a time, moving
/// from the device thread into the [`FrameSink`] and on to persistence.
#[derive(Debug)]
pub struct FrameHandle {
    /// Encoded frame bytes, opaque to this crate.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Kind of capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Repeating preview stream.
    Preview,
    /// One-shot still.
    Still,
}

/// Where a request's frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    /// The preview surface.
    Preview(SurfaceDescriptor),
    /// The session's frame sink.
    StillSink,
}

/// Autofocus policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfMode {
    /// Continuous focus tuned for a live stream.
    ContinuousVideo,
    /// Continuous focus tuned for stills.
    ContinuousPicture,
}

/// Auto-exposure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeMode {
    /// Auto-exposure on.
    On,
}

/// Device parameters for one request. Rebuilt whenever the targets change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequestTemplate {
    /// Preview or still.
    pub kind: RequestKind,
    /// Output targets.
    pub targets: Vec<OutputTarget>,
    /// Autofocus mode.
    pub af_mode: AfMode,
    /// Auto-exposure mode.
    pub ae_mode: AeMode,
}

impl CaptureRequestTemplate {
    /// Repeating preview request targeting `surface`.
    #[must_use]
    pub fn preview(surface: SurfaceDescriptor) -> Self {
        Self {
            kind: RequestKind::Preview,
            targets: vec![OutputTarget::Preview(surface)],
            af_mode: AfMode::ContinuousVideo,
            ae_mode: AeMode::On,
        }
    }

    /// Single still request targeting the frame sink.
    #[must_use]
    pub fn still() -> Self {
        Self {
            kind: RequestKind::Still,
            targets: vec![OutputTarget::StillSink],
            af_mode: AfMode::ContinuousPicture,
            ae_mode: AeMode::On,
        }
    }
}

/// Outputs a capture session is created with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Preview stream output.
    pub preview: OutputConfig,
    /// Still output.
    pub still: OutputConfig,
    /// Destination for still frames.
    pub sink: Arc<FrameSink>,
    /// Number of driver buffers to allocate.
    pub buffer_count: u32,
}

/// Asynchronous notification from a device or session.
pub enum DeviceEvent<D: CameraDevice> {
    /// The device finished opening.
    Opened(D),
    /// The device could not be opened.
    OpenFailed(String),
    /// The device disappeared.
    Disconnected,
    /// Fatal device error.
    Error(String),
    /// The capture session is ready for requests.
    SessionConfigured(D::Session),
    /// The capture session could not be configured.
    SessionConfigureFailed(String),
    /// A still request failed without producing a frame.
    CaptureFailed(String),
}

impl<D: CameraDevice> fmt::Debug for DeviceEvent<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(device) => write!(f, "Opened({})", device.id()),
            Self::OpenFailed(reason) => write!(f, "OpenFailed({reason})"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Error(reason) => write!(f, "Error({reason})"),
            Self::SessionConfigured(_) => f.write_str("SessionConfigured"),
            Self::SessionConfigureFailed(reason) => write!(f, "SessionConfigureFailed({reason})"),
            Self::CaptureFailed(reason) => write!(f, "CaptureFailed({reason})"),
        }
    }
}

/// Thread-safe emitter handed to the platform with every asynchronous call.
pub struct DeviceCallbacks<D: CameraDevice> {
    emit: Arc<dyn Fn(DeviceEvent<D>) + Send + Sync>,
}

impl<D: CameraDevice> Clone for DeviceCallbacks<D> {
    fn clone(&self) -> Self {
        Self {
            emit: Arc::clone(&self.emit),
        }
    }
}

impl<D: CameraDevice> DeviceCallbacks<D> {
    /// Wrap an event handler.
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(DeviceEvent<D>) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    /// Deliver an event.
    pub fn emit(&self, event: DeviceEvent<D>) {
        (self.emit)(event);
    }
}

/// Access to the platform's capture devices.
pub trait CameraPlatform: Send + 'static {
    /// Device type produced by [`CameraPlatform::open`].
    type Device: CameraDevice;

    /// Enumerate available devices. An empty list is not an error.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Start opening a device. The outcome arrives through `callbacks`.
    fn open(&mut self, id: &DeviceId, callbacks: DeviceCallbacks<Self::Device>) -> Result<()>;
}

/// An open capture device.
pub trait CameraDevice: Sized + Send + 'static {
    /// Session type produced by [`CameraDevice::create_session`].
    type Session: CaptureSession;

    /// Identifier the device was opened with.
    fn id(&self) -> &DeviceId;

    /// Start configuring a capture session. The outcome arrives through
    /// `callbacks`.
    fn create_session(&mut self, config: SessionConfig, callbacks: DeviceCallbacks<Self>)
        -> Result<()>;

    /// Release the device.
    fn close(&mut self);
}

/// A configured capture session.
pub trait CaptureSession: Send + 'static {
    /// Replace the repeating request.
    fn set_repeating_request(&mut self, template: &CaptureRequestTemplate) -> Result<()>;

    /// Cancel the repeating request.
    fn stop_repeating(&mut self) -> Result<()>;

    /// Issue a single still request. The frame is delivered to the session's
    /// sink; a failure arrives as [`DeviceEvent::CaptureFailed`].
    fn capture(&mut self, template: &CaptureRequestTemplate) -> Result<()>;

    /// Tear the session down.
    fn close(&mut self);
}
