//! V4L2 platform backend using the v4l crate.
//!
//! Each configured session streams through an mmap buffer queue on its own
//! thread. Preview frames are counted and dropped; when a still is requested
//! the next frame is copied out and delivered to the session's
//! [`FrameSink`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::context::Node;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CaptureError, Result};
use crate::sink::FrameSink;
use crate::traits::{
    CameraDevice, CameraPlatform, CaptureRequestTemplate, CaptureSession, DeviceCallbacks,
    DeviceDescriptor, DeviceEvent, DeviceId, FrameEncoding, FrameHandle, FrameMetadata,
    OutputConfig, SessionConfig,
};

/// `errno` reported once a USB camera is unplugged.
const ENODEV: i32 = 19;

/// Video4Linux2 capture devices under `/dev/video*`.
#[derive(Debug, Default)]
pub struct V4l2Platform;

impl V4l2Platform {
    /// Create the platform.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CameraPlatform for V4l2Platform {
    type Device = V4l2Camera;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(Node::index);

        let mut devices = Vec::new();
        for node in nodes {
            let path = node.path();
            let device = match Device::with_path(path) {
                Ok(device) => device,
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(CaptureError::DeviceUnavailable(format!(
                        "{}: {err}",
                        path.display()
                    )));
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping video node");
                    continue;
                }
            };

            let caps = match device.query_caps() {
                Ok(caps) => caps,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping video node");
                    continue;
                }
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }

            devices.push(DeviceDescriptor {
                id: DeviceId(path.display().to_string()),
                name: caps.card,
                outputs: supported_outputs(&device),
            });
        }
        Ok(devices)
    }

    fn open(&mut self, id: &DeviceId, callbacks: DeviceCallbacks<V4l2Camera>) -> Result<()> {
        match Device::with_path(&id.0) {
            Ok(device) => {
                info!(device = %id, "V4L2 device opened");
                callbacks.emit(DeviceEvent::Opened(V4l2Camera {
                    id: id.clone(),
                    device: Arc::new(device),
                }));
            }
            Err(err) => callbacks.emit(DeviceEvent::OpenFailed(format!("{id}: {err}"))),
        }
        Ok(())
    }
}

/// Every pixel format and frame size the driver reports, in driver order.
fn supported_outputs(device: &Device) -> Vec<OutputConfig> {
    let Ok(formats) = device.enum_formats() else {
        return Vec::new();
    };

    let mut outputs = Vec::new();
    for format in formats {
        let Ok(sizes) = device.enum_framesizes(format.fourcc) else {
            continue;
        };
        for size in sizes {
            let (width, height) = frame_size(&size.size);
            outputs.push(OutputConfig::new(width, height, format.fourcc.into()));
        }
    }
    outputs
}

/// Discrete sizes as-is, stepwise ranges by their maximum.
const fn frame_size(size: &FrameSizeEnum) -> (u32, u32) {
    match size {
        FrameSizeEnum::Discrete(discrete) => (discrete.width, discrete.height),
        FrameSizeEnum::Stepwise(stepwise) => (stepwise.max_width, stepwise.max_height),
    }
}

/// An open V4L2 capture device.
pub struct V4l2Camera {
    id: DeviceId,
    device: Arc<Device>,
}

impl V4l2Camera {
    /// Apply `requested` and report what the driver actually chose.
    fn negotiate(&self, requested: OutputConfig) -> io::Result<OutputConfig> {
        let mut format = self.device.format()?;
        format.width = requested.width;
        format.height = requested.height;
        format.fourcc = requested.fourcc.into();

        let actual = self.device.set_format(&format)?;
        Ok(OutputConfig::new(
            actual.width,
            actual.height,
            actual.fourcc.into(),
        ))
    }
}

impl CameraDevice for V4l2Camera {
    type Session = V4l2Session;

    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn create_session(&mut self, config: SessionConfig, callbacks: DeviceCallbacks<Self>) -> Result<()> {
        if config.preview != config.still {
            debug!(
                preview = ?config.preview,
                still = ?config.still,
                "single-stream device; preview shares the still format"
            );
        }

        match self.negotiate(config.still) {
            Ok(actual) if actual == config.still => {
                info!(
                    width = actual.width,
                    height = actual.height,
                    format = %actual.fourcc,
                    "V4L2 format negotiated"
                );
                callbacks.emit(DeviceEvent::SessionConfigured(V4l2Session {
                    device: Arc::clone(&self.device),
                    output: actual,
                    buffer_count: config.buffer_count,
                    sink: config.sink,
                    callbacks: callbacks.clone(),
                    flags: Arc::default(),
                    streaming: None,
                }));
            }
            Ok(actual) => callbacks.emit(DeviceEvent::SessionConfigureFailed(format!(
                "driver substituted {}x{} {} for {}x{} {}",
                actual.width,
                actual.height,
                actual.fourcc,
                config.still.width,
                config.still.height,
                config.still.fourcc
            ))),
            Err(err) => callbacks.emit(DeviceEvent::SessionConfigureFailed(err.to_string())),
        }
        Ok(())
    }

    fn close(&mut self) {
        // The descriptor closes once the last session thread lets go of it.
        debug!(device = %self.id, "V4L2 device closed");
    }
}

#[derive(Default)]
struct StreamFlags {
    stop: AtomicBool,
    still_requested: AtomicBool,
}

/// A configured V4L2 stream.
pub struct V4l2Session {
    device: Arc<Device>,
    output: OutputConfig,
    buffer_count: u32,
    sink: Arc<FrameSink>,
    callbacks: DeviceCallbacks<V4l2Camera>,
    flags: Arc<StreamFlags>,
    streaming: Option<JoinHandle<()>>,
}

impl CaptureSession for V4l2Session {
    fn set_repeating_request(&mut self, template: &CaptureRequestTemplate) -> Result<()> {
        self.stop_repeating()?;
        debug!(
            af_mode = ?template.af_mode,
            ae_mode = ?template.ae_mode,
            "starting preview stream; device runs its own auto modes"
        );

        self.flags = Arc::default();
        let stream = StreamThread {
            device: Arc::clone(&self.device),
            output: self.output,
            buffer_count: self.buffer_count,
            sink: Arc::clone(&self.sink),
            callbacks: self.callbacks.clone(),
            flags: Arc::clone(&self.flags),
        };
        let handle = thread::Builder::new()
            .name("v4l2-stream".to_owned())
            .spawn(move || stream.run())
            .map_err(|err| CaptureError::Configuration(err.to_string()))?;
        self.streaming = Some(handle);
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<()> {
        if let Some(handle) = self.streaming.take() {
            self.flags.stop.store(true, Ordering::Release);
            if handle.join().is_err() {
                warn!("stream thread panicked");
            }
        }
        Ok(())
    }

    fn capture(&mut self, template: &CaptureRequestTemplate) -> Result<()> {
        if self.streaming.is_none() {
            return Err(CaptureError::Capture("stream is not running".to_owned()));
        }
        if self.flags.still_requested.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::Capture("a still is already pending".to_owned()));
        }
        debug!(af_mode = ?template.af_mode, "still requested from stream");
        Ok(())
    }

    fn close(&mut self) {
        if let Err(err) = self.stop_repeating() {
            warn!(error = %err, "failed to stop stream");
        }
    }
}

struct StreamThread {
    device: Arc<Device>,
    output: OutputConfig,
    buffer_count: u32,
    sink: Arc<FrameSink>,
    callbacks: DeviceCallbacks<V4l2Camera>,
    flags: Arc<StreamFlags>,
}

impl StreamThread {
    fn run(self) {
        let mut stream =
            match Stream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count) {
                Ok(stream) => stream,
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            };

        let mut previews: u64 = 0;
        while !self.flags.stop.load(Ordering::Acquire) {
            let (buf, meta) = match stream.next() {
                Ok(frame) => frame,
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            };

            if self.flags.still_requested.swap(false, Ordering::AcqRel) {
                let used = usize::try_from(meta.bytesused)
                    .ok()
                    .and_then(|len| buf.get(..len))
                    .unwrap_or(buf);
                self.sink.deliver(FrameHandle {
                    data: used.to_vec(),
                    metadata: FrameMetadata {
                        width: self.output.width,
                        height: self.output.height,
                        encoding: FrameEncoding::from_fourcc(self.output.fourcc),
                        sequence: meta.sequence,
                        captured_at: Utc::now(),
                    },
                });
            } else {
                previews += 1;
            }
        }
        debug!(previews, "stream stopped");
    }

    fn fail(&self, err: &io::Error) {
        if self.flags.stop.load(Ordering::Acquire) {
            debug!(error = %err, "stream error after stop");
            return;
        }
        if self.flags.still_requested.swap(false, Ordering::AcqRel) {
            self.callbacks
                .emit(DeviceEvent::CaptureFailed(err.to_string()));
        }
        if is_disconnect(err) {
            self.callbacks.emit(DeviceEvent::Disconnected);
        } else {
            self.callbacks.emit(DeviceEvent::Error(err.to_string()));
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ENODEV)
}
