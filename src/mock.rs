//! Scripted platform for testing without hardware.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{CaptureError, Result};
use crate::sink::FrameSink;
use crate::traits::{
    CameraDevice, CameraPlatform, CaptureRequestTemplate, CaptureSession, DeviceCallbacks,
    DeviceDescriptor, DeviceEvent, DeviceId, FourCC, FrameEncoding, FrameHandle, FrameMetadata,
    OutputConfig, SessionConfig,
};

/// How the mock answers an open request.
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    /// Emit `Opened` immediately.
    Succeed,
    /// Emit `OpenFailed` with the given reason.
    Fail(String),
    /// Emit nothing until [`MockControl::complete_open`].
    Pending,
}

/// How the mock answers a session configuration request.
#[derive(Debug, Clone)]
pub enum ConfigureBehavior {
    /// Emit `SessionConfigured` immediately.
    Succeed,
    /// Emit `SessionConfigureFailed` with the given reason.
    Fail(String),
}

/// How the mock answers a still request.
#[derive(Debug, Clone)]
pub enum StillBehavior {
    /// Deliver these bytes to the sink immediately.
    Deliver(Vec<u8>),
    /// Emit `CaptureFailed` with the given reason.
    Fail(String),
    /// Deliver nothing until [`MockControl::deliver_held_still`].
    Hold,
}

struct PendingOpen {
    id: DeviceId,
    callbacks: DeviceCallbacks<MockDevice>,
    configure: ConfigureBehavior,
    still: StillBehavior,
}

#[derive(Default)]
struct MockState {
    opens: usize,
    live_devices: usize,
    device_closes: usize,
    sessions_created: usize,
    session_closes: usize,
    repeating_requests: usize,
    repeating_stops: usize,
    still_requests: usize,
    sequence: u32,
    pending_open: Option<PendingOpen>,
    callbacks: Option<DeviceCallbacks<MockDevice>>,
    held_sink: Option<Arc<FrameSink>>,
}

/// Shared view into what the mock platform has been asked to do, and a
/// handle for injecting device-side events from the test.
#[derive(Clone, Default)]
pub struct MockControl(Arc<Mutex<MockState>>);

impl MockControl {
    /// Open requests received.
    pub fn opens(&self) -> usize {
        self.0.lock().opens
    }

    /// Devices handed out and not yet closed.
    pub fn live_devices(&self) -> usize {
        self.0.lock().live_devices
    }

    /// Device closes.
    pub fn device_closes(&self) -> usize {
        self.0.lock().device_closes
    }

    /// Session creation requests.
    pub fn sessions_created(&self) -> usize {
        self.0.lock().sessions_created
    }

    /// Session closes.
    pub fn session_closes(&self) -> usize {
        self.0.lock().session_closes
    }

    /// Repeating requests issued.
    pub fn repeating_requests(&self) -> usize {
        self.0.lock().repeating_requests
    }

    /// Repeating requests stopped.
    pub fn repeating_stops(&self) -> usize {
        self.0.lock().repeating_stops
    }

    /// Still requests issued.
    pub fn still_requests(&self) -> usize {
        self.0.lock().still_requests
    }

    /// Finish an open started with [`OpenBehavior::Pending`].
    pub fn complete_open(&self) {
        let pending = self.0.lock().pending_open.take();
        if let Some(open) = pending {
            let device = self.new_device(open.id, &open.callbacks, open.configure, open.still);
            open.callbacks.emit(DeviceEvent::Opened(device));
        }
    }

    /// Report the device as disconnected.
    pub fn disconnect(&self) {
        let callbacks = self.0.lock().callbacks.clone();
        if let Some(callbacks) = callbacks {
            callbacks.emit(DeviceEvent::Disconnected);
        }
    }

    /// Report a fatal device error.
    pub fn fail(&self, reason: &str) {
        let callbacks = self.0.lock().callbacks.clone();
        if let Some(callbacks) = callbacks {
            callbacks.emit(DeviceEvent::Error(reason.to_owned()));
        }
    }

    /// Deliver a still held by [`StillBehavior::Hold`].
    pub fn deliver_held_still(&self, data: Vec<u8>) {
        let sink = self.0.lock().held_sink.take();
        if let Some(sink) = sink {
            sink.deliver(self.frame(data));
        }
    }

    fn new_device(
        &self,
        id: DeviceId,
        callbacks: &DeviceCallbacks<MockDevice>,
        configure: ConfigureBehavior,
        still: StillBehavior,
    ) -> MockDevice {
        let mut state = self.0.lock();
        state.live_devices += 1;
        state.callbacks = Some(callbacks.clone());
        drop(state);
        MockDevice {
            id,
            control: self.clone(),
            configure,
            still,
            closed: false,
        }
    }

    fn frame(&self, data: Vec<u8>) -> FrameHandle {
        let sequence = {
            let mut state = self.0.lock();
            state.sequence += 1;
            state.sequence
        };
        FrameHandle {
            data,
            metadata: FrameMetadata {
                width: 640,
                height: 480,
                encoding: FrameEncoding::Jpeg,
                sequence,
                captured_at: Utc::now(),
            },
        }
    }
}

/// Mock platform with one device by default.
pub struct MockPlatform {
    devices: Vec<DeviceDescriptor>,
    refuse_enumeration: bool,
    open: OpenBehavior,
    configure: ConfigureBehavior,
    still: StillBehavior,
    control: MockControl,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Create a mock platform exposing a single MJPG/YUYV camera.
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceDescriptor {
                id: DeviceId::from("mock:0"),
                name: "Mock Camera".to_owned(),
                outputs: vec![
                    OutputConfig::new(640, 480, FourCC::MJPG),
                    OutputConfig::new(640, 480, FourCC::YUYV),
                ],
            }],
            refuse_enumeration: false,
            open: OpenBehavior::Succeed,
            configure: ConfigureBehavior::Succeed,
            still: StillBehavior::Deliver(vec![0xFF, 0xD8, 0xFF, 0xD9]),
            control: MockControl::default(),
        }
    }

    /// Replace the enumerated devices.
    #[must_use]
    pub fn with_devices(mut self, devices: Vec<DeviceDescriptor>) -> Self {
        self.devices = devices;
        self
    }

    /// Make enumeration fail.
    #[must_use]
    pub const fn refusing_enumeration(mut self) -> Self {
        self.refuse_enumeration = true;
        self
    }

    /// Set the open behavior.
    #[must_use]
    pub fn with_open(mut self, open: OpenBehavior) -> Self {
        self.open = open;
        self
    }

    /// Set the session configuration behavior.
    #[must_use]
    pub fn with_configure(mut self, configure: ConfigureBehavior) -> Self {
        self.configure = configure;
        self
    }

    /// Set the still capture behavior.
    #[must_use]
    pub fn with_still(mut self, still: StillBehavior) -> Self {
        self.still = still;
        self
    }

    /// Handle for inspecting and driving the mock.
    pub fn control(&self) -> MockControl {
        self.control.clone()
    }
}

impl CameraPlatform for MockPlatform {
    type Device = MockDevice;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if self.refuse_enumeration {
            return Err(CaptureError::DeviceUnavailable(
                "enumeration refused".to_owned(),
            ));
        }
        Ok(self.devices.clone())
    }

    fn open(&mut self, id: &DeviceId, callbacks: DeviceCallbacks<MockDevice>) -> Result<()> {
        self.control.0.lock().opens += 1;
        match &self.open {
            OpenBehavior::Succeed => {
                let device = self.control.new_device(
                    id.clone(),
                    &callbacks,
                    self.configure.clone(),
                    self.still.clone(),
                );
                callbacks.emit(DeviceEvent::Opened(device));
            }
            OpenBehavior::Fail(reason) => callbacks.emit(DeviceEvent::OpenFailed(reason.clone())),
            OpenBehavior::Pending => {
                self.control.0.lock().pending_open = Some(PendingOpen {
                    id: id.clone(),
                    callbacks,
                    configure: self.configure.clone(),
                    still: self.still.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Device handed out by [`MockPlatform`].
pub struct MockDevice {
    id: DeviceId,
    control: MockControl,
    configure: ConfigureBehavior,
    still: StillBehavior,
    closed: bool,
}

impl CameraDevice for MockDevice {
    type Session = MockSession;

    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn create_session(&mut self, config: SessionConfig, callbacks: DeviceCallbacks<Self>) -> Result<()> {
        self.control.0.lock().sessions_created += 1;
        match &self.configure {
            ConfigureBehavior::Succeed => callbacks.emit(DeviceEvent::SessionConfigured(MockSession {
                control: self.control.clone(),
                sink: config.sink,
                still: self.still.clone(),
                callbacks: callbacks.clone(),
                closed: false,
            })),
            ConfigureBehavior::Fail(reason) => {
                callbacks.emit(DeviceEvent::SessionConfigureFailed(reason.clone()));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.control.0.lock();
            state.device_closes += 1;
            state.live_devices = state.live_devices.saturating_sub(1);
        }
    }
}

/// Session handed out by [`MockDevice`].
pub struct MockSession {
    control: MockControl,
    sink: Arc<FrameSink>,
    still: StillBehavior,
    callbacks: DeviceCallbacks<MockDevice>,
    closed: bool,
}

impl CaptureSession for MockSession {
    fn set_repeating_request(&mut self, _template: &CaptureRequestTemplate) -> Result<()> {
        self.control.0.lock().repeating_requests += 1;
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<()> {
        self.control.0.lock().repeating_stops += 1;
        Ok(())
    }

    fn capture(&mut self, _template: &CaptureRequestTemplate) -> Result<()> {
        self.control.0.lock().still_requests += 1;
        match &self.still {
            StillBehavior::Deliver(data) => self.sink.deliver(self.control.frame(data.clone())),
            StillBehavior::Fail(reason) => {
                self.callbacks.emit(DeviceEvent::CaptureFailed(reason.clone()));
            }
            StillBehavior::Hold => {
                self.control.0.lock().held_sink = Some(Arc::clone(&self.sink));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.control.0.lock().session_closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    type Events = Arc<Mutex<VecDeque<DeviceEvent<MockDevice>>>>;

    fn recorder() -> (Events, DeviceCallbacks<MockDevice>) {
        let events: Events = Arc::default();
        let sink = Arc::clone(&events);
        (events, DeviceCallbacks::new(move |event| sink.lock().push_back(event)))
    }

    #[test]
    fn test_mock_platform_enumerates_one_device() {
        let platform = MockPlatform::new();
        let devices = platform.enumerate().expect("enumerate should succeed");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].outputs[0].fourcc, FourCC::MJPG);
    }

    #[test]
    fn test_mock_open_emits_opened_and_tracks_liveness() {
        let mut platform = MockPlatform::new();
        let control = platform.control();
        let (events, callbacks) = recorder();

        platform
            .open(&DeviceId::from("mock:0"), callbacks)
            .expect("open should succeed");
        assert_eq!(control.opens(), 1);
        assert_eq!(control.live_devices(), 1);

        let event = events.lock().pop_front();
        let Some(DeviceEvent::Opened(mut device)) = event else {
            unreachable!("expected Opened");
        };
        device.close();
        device.close();
        assert_eq!(control.live_devices(), 0);
        assert_eq!(control.device_closes(), 1);
    }

    #[test]
    fn test_mock_pending_open() {
        let mut platform = MockPlatform::new().with_open(OpenBehavior::Pending);
        let control = platform.control();
        let (events, callbacks) = recorder();

        platform
            .open(&DeviceId::from("mock:0"), callbacks)
            .expect("open should succeed");
        assert!(events.lock().is_empty());

        control.complete_open();
        assert!(matches!(
            events.lock().pop_front(),
            Some(DeviceEvent::Opened(_))
        ));
    }

    #[test]
    fn test_mock_session_delivers_still_to_sink() {
        let mut platform = MockPlatform::new().with_still(StillBehavior::Deliver(vec![7; 10]));
        let control = platform.control();
        let (events, callbacks) = recorder();
        platform
            .open(&DeviceId::from("mock:0"), callbacks.clone())
            .expect("open should succeed");
        let Some(DeviceEvent::Opened(mut device)) = events.lock().pop_front() else {
            unreachable!("expected Opened");
        };

        let sink = Arc::new(FrameSink::new(1));
        let config = SessionConfig {
            preview: OutputConfig::new(640, 480, FourCC::MJPG),
            still: OutputConfig::new(640, 480, FourCC::MJPG),
            sink: Arc::clone(&sink),
            buffer_count: 2,
        };
        device
            .create_session(config, callbacks)
            .expect("create_session should succeed");
        let Some(DeviceEvent::SessionConfigured(mut session)) = events.lock().pop_front() else {
            unreachable!("expected SessionConfigured");
        };

        session
            .capture(&CaptureRequestTemplate::still())
            .expect("capture should succeed");
        let frame = sink.take().expect("frame should be delivered");
        assert_eq!(frame.data, vec![7; 10]);
        assert_eq!(control.still_requests(), 1);
    }
}
