//! Camera session state machine.
//!
//! [`SessionController`] owns the device handle, the capture session and the
//! preview template. It is single-writer: every method runs on the
//! coordinator's background context, and platform callbacks reach it only as
//! [`DeviceEvent`]s routed back through that context's queue. Only the
//! open/close boundary takes the [`ExclusiveDeviceLock`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::lock::ExclusiveDeviceLock;
use crate::registry::{best_preview_size, DeviceRegistry};
use crate::sink::FrameSink;
use crate::traits::{
    CameraDevice, CameraPlatform, CaptureRequestTemplate, CaptureSession, DeviceCallbacks,
    DeviceDescriptor, DeviceEvent, FrameHandle, OutputConfig, SessionConfig, SurfaceDescriptor,
};

/// Lifecycle state of the camera session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No device held.
    Closed,
    /// Waiting for the platform to open the device.
    Opening,
    /// Device open; preview running or being configured.
    Previewing,
    /// A still request is in flight.
    Capturing,
    /// Tearing down.
    Closing,
    /// Fatal device error; resources are being force-released.
    Error(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("Closed"),
            Self::Opening => f.write_str("Opening"),
            Self::Previewing => f.write_str("Previewing"),
            Self::Capturing => f.write_str("Capturing"),
            Self::Closing => f.write_str("Closing"),
            Self::Error(reason) => write!(f, "Error({reason})"),
        }
    }
}

/// Inputs to the transition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Caller asked to open the device.
    OpenDevice,
    /// Platform reported the device open.
    DeviceOpened,
    /// Platform could not open the device.
    DeviceOpenFailed,
    /// Device went away.
    DeviceDisconnected,
    /// Capture session ready.
    SessionConfigured,
    /// Capture session configuration failed.
    SessionConfigFailed,
    /// Caller asked for a still.
    CaptureStill,
    /// The still frame arrived.
    FrameDelivered,
    /// The still request failed.
    CaptureFailed,
    /// Caller asked to close.
    Close,
    /// Session and device released.
    CloseCompleted,
    /// Fatal device error.
    DeviceError(String),
}

impl SessionState {
    /// Next state for `event`, or `None` if the pair is not legal.
    pub fn transition(&self, event: &SessionEvent) -> Option<Self> {
        use SessionEvent as E;

        match (self, event) {
            (_, E::DeviceError(reason)) => Some(Self::Error(reason.clone())),
            (Self::Closed, E::OpenDevice) => Some(Self::Opening),
            (Self::Opening, E::DeviceOpened) => Some(Self::Previewing),
            (Self::Opening, E::DeviceOpenFailed)
            | (Self::Opening | Self::Previewing | Self::Capturing, E::DeviceDisconnected) => {
                Some(Self::Closed)
            }
            (Self::Previewing, E::SessionConfigured | E::SessionConfigFailed)
            | (Self::Capturing, E::FrameDelivered | E::CaptureFailed) => Some(Self::Previewing),
            (Self::Previewing, E::CaptureStill) => Some(Self::Capturing),
            (Self::Closed, E::Close) => Some(Self::Closed),
            (_, E::Close) => Some(Self::Closing),
            (Self::Closing | Self::Error(_), E::CloseCompleted) => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Outcome of the hardware-access permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    /// Not asked yet.
    #[default]
    Unknown,
    /// Access granted.
    Granted,
    /// Access refused.
    Denied,
}

/// Routes a generation-tagged device event back to the controller's owner.
pub type EventRouter<D> = Arc<dyn Fn(u64, DeviceEvent<D>) + Send + Sync>;

type SessionOf<P> = <<P as CameraPlatform>::Device as CameraDevice>::Session;

/// Drives one device through open, preview, capture and close.
pub struct SessionController<P: CameraPlatform> {
    platform: P,
    config: CaptureConfig,
    state: SessionState,
    published: Arc<RwLock<SessionState>>,
    lock: Arc<ExclusiveDeviceLock>,
    lock_owned: bool,
    permission: Permission,
    router: EventRouter<P::Device>,
    generation: u64,
    descriptor: Option<DeviceDescriptor>,
    device: Option<P::Device>,
    session: Option<SessionOf<P>>,
    session_pending: bool,
    surface: Option<SurfaceDescriptor>,
    preview_template: Option<CaptureRequestTemplate>,
    still_in_flight: Option<CaptureRequestTemplate>,
    sink: Arc<FrameSink>,
}

impl<P: CameraPlatform> SessionController<P> {
    /// Create a closed controller.
    ///
    /// `router` receives every platform callback tagged with the generation
    /// it was issued under; feed them back through
    /// [`SessionController::on_device_event`]. `published` mirrors the
    /// current state for readers on other threads.
    pub fn new(
        platform: P,
        config: CaptureConfig,
        sink: Arc<FrameSink>,
        lock: Arc<ExclusiveDeviceLock>,
        router: EventRouter<P::Device>,
        published: Arc<RwLock<SessionState>>,
    ) -> Self {
        *published.write() = SessionState::Closed;
        Self {
            platform,
            config,
            state: SessionState::Closed,
            published,
            lock,
            lock_owned: false,
            permission: Permission::Unknown,
            router,
            generation: 0,
            descriptor: None,
            device: None,
            session: None,
            session_pending: false,
            surface: None,
            preview_template: None,
            still_in_flight: None,
            sink,
        }
    }

    /// Current state.
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Whether a device handle is held.
    pub const fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Whether a configured capture session is held.
    pub const fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// The repeating preview template, once a session has been requested.
    pub const fn preview_template(&self) -> Option<&CaptureRequestTemplate> {
        self.preview_template.as_ref()
    }

    /// Record the result of the permission prompt.
    pub fn set_permission(&mut self, permission: Permission) {
        debug!(?permission, "permission updated");
        self.permission = permission;
    }

    /// Release everything and hand the platform back.
    pub fn into_platform(mut self) -> P {
        self.release_resources();
        self.platform
    }

    /// Closed -> Opening: take the device lock and ask the platform to open
    /// the configured (or first) device.
    pub fn open_device(&mut self) -> Result<()> {
        let next = self.next_state(&SessionEvent::OpenDevice)?;
        match self.permission {
            Permission::Granted => {}
            Permission::Denied => return Err(CaptureError::PermissionDenied),
            Permission::Unknown => return Err(CaptureError::PermissionRequired),
        }

        let descriptor = DeviceRegistry::new(&self.platform).select(self.config.device())?;

        let timeout = self.config.lock_timeout();
        if !self.lock.try_acquire_for(timeout) {
            return Err(CaptureError::DeviceOpen(format!(
                "timed out after {timeout:?} waiting for the device lock"
            )));
        }
        self.lock_owned = true;

        self.generation += 1;
        let callbacks = self.callbacks();
        let id = descriptor.id.clone();
        self.descriptor = Some(descriptor);
        self.set_state(next);
        info!(device = %id, "opening device");

        if let Err(err) = self.platform.open(&id, callbacks) {
            self.descriptor = None;
            self.release_lock();
            self.set_state(SessionState::Closed);
            return Err(match err {
                CaptureError::DeviceOpen(_) => err,
                other => CaptureError::DeviceOpen(other.to_string()),
            });
        }
        Ok(())
    }

    /// Target `surface` with the preview. Deferred while opening; a no-op
    /// while a session exists or is being configured.
    pub fn begin_preview(&mut self, surface: SurfaceDescriptor) -> Result<()> {
        self.surface = Some(surface);
        match self.state {
            SessionState::Opening => {
                debug!("preview deferred until the device opens");
                Ok(())
            }
            SessionState::Previewing | SessionState::Capturing => {
                if self.session.is_some() || self.session_pending {
                    return Ok(());
                }
                self.create_session()
            }
            _ => Err(CaptureError::NotReady(self.state.clone())),
        }
    }

    /// Previewing -> Capturing: issue one still request. Rejected, not
    /// queued, while another still is in flight or once permission has been
    /// withdrawn.
    pub fn capture_still(&mut self) -> Result<()> {
        let next = self.next_state(&SessionEvent::CaptureStill)?;
        if self.permission != Permission::Granted {
            return Err(CaptureError::PermissionDenied);
        }
        let template = CaptureRequestTemplate::still();
        let Some(session) = self.session.as_mut() else {
            return Err(CaptureError::NotReady(self.state.clone()));
        };

        session.capture(&template).map_err(|err| match err {
            CaptureError::Capture(_) => err,
            other => CaptureError::Capture(other.to_string()),
        })?;
        debug!("still request issued");

        self.still_in_flight = Some(template);
        self.set_state(next);
        Ok(())
    }

    /// Take the delivered still from the sink.
    ///
    /// Frames that arrive while no still is in flight are discarded here.
    pub fn take_still_frame(&mut self) -> Option<FrameHandle> {
        let frame = self.sink.take()?;
        if self.state != SessionState::Capturing || self.still_in_flight.is_none() {
            warn!(
                sequence = frame.metadata.sequence,
                state = %self.state,
                "discarding unsolicited still frame"
            );
            return None;
        }
        Some(frame)
    }

    /// Capturing -> Previewing once the delivered frame has been persisted
    /// or discarded.
    pub fn finish_still(&mut self) {
        if let Some(next) = self.state.transition(&SessionEvent::FrameDelivered) {
            self.still_in_flight = None;
            self.set_state(next);
        }
    }

    /// Close the session, then the device, under the device lock. Valid from
    /// every state; closing a closed controller does nothing.
    pub fn close(&mut self) -> Result<()> {
        let next = self.next_state(&SessionEvent::Close)?;
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.set_state(next);

        // A pending open already holds the lock on our behalf.
        if !self.lock_owned {
            self.lock.acquire();
            self.lock_owned = true;
        }
        info!("closing capture session and device");
        self.release_resources();

        let next = self.next_state(&SessionEvent::CloseCompleted)?;
        self.set_state(next);
        Ok(())
    }

    /// Apply a platform callback issued under `generation`.
    ///
    /// Failures come back as the error the caller should surface; events
    /// that do not apply in the current state are logged and dropped.
    pub fn on_device_event(&mut self, generation: u64, event: DeviceEvent<P::Device>) -> Result<()> {
        if generation != self.generation {
            Self::dispose_stale(generation, event);
            return Ok(());
        }
        debug!(?event, state = %self.state, "device event");

        match event {
            DeviceEvent::Opened(device) => self.on_opened(device),
            DeviceEvent::OpenFailed(reason) => {
                let Some(next) = self.accept(&SessionEvent::DeviceOpenFailed) else {
                    return Ok(());
                };
                self.descriptor = None;
                self.release_lock();
                self.set_state(next);
                Err(CaptureError::DeviceOpen(reason))
            }
            DeviceEvent::Disconnected => {
                let Some(next) = self.accept(&SessionEvent::DeviceDisconnected) else {
                    return Ok(());
                };
                warn!("device disconnected");
                self.release_resources();
                self.set_state(next);
                Err(CaptureError::DeviceDisconnected)
            }
            DeviceEvent::Error(reason) => {
                error!(%reason, "device error");
                if let Some(next) = self.accept(&SessionEvent::DeviceError(reason.clone())) {
                    self.set_state(next);
                }
                self.release_resources();
                if let Some(next) = self.accept(&SessionEvent::CloseCompleted) {
                    self.set_state(next);
                }
                Err(CaptureError::Device(reason))
            }
            DeviceEvent::SessionConfigured(session) => self.on_session_configured(session),
            DeviceEvent::SessionConfigureFailed(reason) => {
                let Some(next) = self.accept(&SessionEvent::SessionConfigFailed) else {
                    return Ok(());
                };
                self.session_pending = false;
                self.set_state(next);
                Err(CaptureError::Configuration(reason))
            }
            DeviceEvent::CaptureFailed(reason) => {
                let Some(next) = self.accept(&SessionEvent::CaptureFailed) else {
                    return Ok(());
                };
                self.still_in_flight = None;
                self.set_state(next);
                Err(CaptureError::Capture(reason))
            }
        }
    }

    fn on_opened(&mut self, mut device: P::Device) -> Result<()> {
        let Some(next) = self.accept(&SessionEvent::DeviceOpened) else {
            device.close();
            return Ok(());
        };
        info!(device = %device.id(), "device opened");
        self.device = Some(device);
        self.release_lock();
        self.set_state(next);

        if self.surface.is_some() {
            self.create_session()?;
        }
        Ok(())
    }

    fn on_session_configured(&mut self, mut session: SessionOf<P>) -> Result<()> {
        if self.session.is_some() {
            warn!("closing duplicate capture session");
            session.close();
            return Ok(());
        }
        let Some(next) = self.accept(&SessionEvent::SessionConfigured) else {
            session.close();
            return Ok(());
        };
        self.session_pending = false;

        let issued = match self.preview_template.as_ref() {
            Some(template) => session.set_repeating_request(template),
            None => Err(CaptureError::Configuration(
                "no preview template for the new session".to_owned(),
            )),
        };
        self.session = Some(session);
        self.set_state(next);

        issued.map_err(|err| match err {
            CaptureError::Configuration(_) => err,
            other => CaptureError::Configuration(other.to_string()),
        })?;
        debug!("repeating preview request issued");
        Ok(())
    }

    fn create_session(&mut self) -> Result<()> {
        let callbacks = self.callbacks();
        let (Some(surface), Some(descriptor)) = (self.surface, self.descriptor.as_ref()) else {
            return Err(CaptureError::NotReady(self.state.clone()));
        };

        let (width, height) = best_preview_size(descriptor, &surface)?;
        let template = CaptureRequestTemplate::preview(SurfaceDescriptor {
            width,
            height,
            format: surface.format,
        });
        let config = SessionConfig {
            preview: OutputConfig::new(width, height, surface.format),
            still: OutputConfig::new(width, height, self.config.format()),
            sink: Arc::clone(&self.sink),
            buffer_count: self.config.buffer_count(),
        };

        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::NotReady(self.state.clone()));
        };
        info!(width, height, format = %surface.format, "creating capture session");
        device
            .create_session(config, callbacks)
            .map_err(|err| match err {
                CaptureError::Configuration(_) => err,
                other => CaptureError::Configuration(other.to_string()),
            })?;

        self.preview_template = Some(template);
        self.session_pending = true;
        Ok(())
    }

    /// Close session, then device; drop pending frames and release the lock.
    /// Bumps the generation so callbacks already in flight are disposed of.
    fn release_resources(&mut self) {
        self.generation += 1;
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.stop_repeating() {
                warn!(%err, "failed to stop the repeating request");
            }
            session.close();
        }
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        let discarded = self.sink.clear();
        if discarded > 0 {
            warn!(discarded, "discarded undelivered still frames");
        }
        self.still_in_flight = None;
        self.session_pending = false;
        self.preview_template = None;
        self.descriptor = None;
        self.release_lock();
    }

    fn dispose_stale(generation: u64, event: DeviceEvent<P::Device>) {
        match event {
            DeviceEvent::Opened(mut device) => {
                warn!(generation, device = %device.id(), "closing device opened after close");
                device.close();
            }
            DeviceEvent::SessionConfigured(mut session) => {
                warn!(generation, "closing session configured after close");
                session.close();
            }
            other => debug!(generation, event = ?other, "ignoring stale device event"),
        }
    }

    fn callbacks(&self) -> DeviceCallbacks<P::Device> {
        let router = Arc::clone(&self.router);
        let generation = self.generation;
        DeviceCallbacks::new(move |event| router(generation, event))
    }

    fn release_lock(&mut self) {
        if self.lock_owned {
            self.lock.release();
            self.lock_owned = false;
        }
    }

    fn next_state(&self, event: &SessionEvent) -> Result<SessionState> {
        self.state
            .transition(event)
            .ok_or_else(|| CaptureError::NotReady(self.state.clone()))
    }

    fn accept(&self, event: &SessionEvent) -> Option<SessionState> {
        let next = self.state.transition(event);
        if next.is_none() {
            warn!(?event, state = %self.state, "ignoring device event in this state");
        }
        next
    }

    fn set_state(&mut self, next: SessionState) {
        if next != self.state {
            info!(from = %self.state, to = %next, "session state");
            *self.published.write() = next.clone();
            self.state = next;
        }
    }
}
