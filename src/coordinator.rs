//! UI-facing façade over the session state machine.
//!
//! [`CaptureCoordinator`] owns a background thread named `camera-background`
//! running a single-threaded tokio runtime. Surface and permission signals
//! from the UI, device callbacks from the platform and the capture timer all
//! become [`Command`]s on one queue, processed one at a time, so the
//! [`SessionController`] has exactly one writer. Outcomes flow back to the UI
//! as [`CaptureEvent`]s.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::lock::ExclusiveDeviceLock;
use crate::session::{EventRouter, Permission, SessionController, SessionState};
use crate::sink::FrameSink;
use crate::storage::{FrameStore, StorageLocator};
use crate::traits::{CameraDevice, CameraPlatform, DeviceEvent, SurfaceDescriptor};

/// Observable outcome reported to the UI layer.
#[derive(Debug)]
pub enum CaptureEvent {
    /// A still was persisted.
    CaptureComplete(StorageLocator),
    /// A still request failed or could not be persisted.
    CaptureFailed(String),
    /// The device could not be opened.
    DeviceOpenError(String),
    /// The device went away; the session is closed.
    DeviceDisconnected,
    /// The capture session could not be configured.
    ConfigurationError(String),
    /// Hardware access was refused.
    PermissionDenied,
    /// Hardware access has not been asked for yet.
    PermissionRequired,
    /// No usable device.
    DeviceUnavailable(String),
    /// Fatal device error; the session is closed.
    DeviceError(String),
}

impl From<CaptureError> for CaptureEvent {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => Self::PermissionDenied,
            CaptureError::PermissionRequired => Self::PermissionRequired,
            CaptureError::DeviceUnavailable(reason) => Self::DeviceUnavailable(reason),
            CaptureError::DeviceOpen(reason) => Self::DeviceOpenError(reason),
            CaptureError::DeviceDisconnected => Self::DeviceDisconnected,
            CaptureError::Device(reason) => Self::DeviceError(reason),
            CaptureError::Configuration(reason) | CaptureError::Config(reason) => {
                Self::ConfigurationError(reason)
            }
            CaptureError::Capture(reason) => Self::CaptureFailed(reason),
            err @ (CaptureError::Persistence { .. } | CaptureError::NotReady(_)) => {
                Self::CaptureFailed(err.to_string())
            }
        }
    }
}

/// Receiving end of the coordinator's event stream.
pub type EventReceiver = UnboundedReceiver<CaptureEvent>;

enum Command<D: CameraDevice> {
    PermissionResult(bool),
    SurfaceReady(SurfaceDescriptor),
    SurfaceUpdated,
    SurfaceDestroyed,
    ScheduleCapture,
    FireCapture(u64),
    FrameAvailable,
    Device(u64, DeviceEvent<D>),
    Shutdown,
}

enum WorkerSlot<P: CameraPlatform> {
    Running {
        commands: UnboundedSender<Command<P::Device>>,
        thread: JoinHandle<P>,
    },
    Stopped(Option<P>),
}

/// Drives one camera from surface-ready to persisted still.
pub struct CaptureCoordinator<P: CameraPlatform> {
    config: CaptureConfig,
    events: UnboundedSender<CaptureEvent>,
    state: Arc<RwLock<SessionState>>,
    capture_pending: Arc<AtomicBool>,
    lock: Arc<ExclusiveDeviceLock>,
    store: Arc<FrameStore>,
    permission: Permission,
    worker: WorkerSlot<P>,
}

impl<P: CameraPlatform> CaptureCoordinator<P> {
    /// Start the background context for `platform`.
    pub fn new(platform: P, config: CaptureConfig) -> Result<(Self, EventReceiver)> {
        let (events, receiver) = mpsc::unbounded_channel();
        let store = Arc::new(FrameStore::new(config.cache_dir().clone()));
        let mut coordinator = Self {
            config,
            events,
            state: Arc::new(RwLock::new(SessionState::Closed)),
            capture_pending: Arc::new(AtomicBool::new(false)),
            lock: Arc::new(ExclusiveDeviceLock::new()),
            store,
            permission: Permission::Unknown,
            worker: WorkerSlot::Stopped(None),
        };
        coordinator.spawn(platform)?;
        Ok((coordinator, receiver))
    }

    /// Current session state as last published by the background context.
    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Result of the hardware-access prompt. A refusal while the device is
    /// open closes it.
    pub fn on_permission_result(&mut self, granted: bool) {
        self.permission = if granted {
            Permission::Granted
        } else {
            Permission::Denied
        };
        info!(granted, "permission result");
        self.send(Command::PermissionResult(granted));
    }

    /// The preview surface is ready: open the device and start the preview.
    /// Restarts the background context after a teardown.
    pub fn on_surface_ready(&mut self, width: u32, height: u32) {
        if let WorkerSlot::Stopped(platform) = &mut self.worker {
            let Some(platform) = platform.take() else {
                self.emit(CaptureEvent::DeviceUnavailable(
                    "camera platform lost with the previous background context".to_owned(),
                ));
                return;
            };
            if let Err(err) = self.spawn(platform) {
                self.emit(err.into());
                return;
            }
            info!("background context restarted");
        }

        let surface = SurfaceDescriptor {
            width,
            height,
            format: self.config.format(),
        };
        self.send(Command::SurfaceReady(surface));
    }

    /// The preview surface changed size or format.
    pub fn on_surface_updated(&self) {
        self.send(Command::SurfaceUpdated);
    }

    /// The preview surface is gone. The device stays open.
    pub fn on_surface_destroyed(&self) {
        self.send(Command::SurfaceDestroyed);
    }

    /// The user pressed the capture button.
    ///
    /// Schedules a still after the configured delay. Rejected with
    /// [`CaptureError::NotReady`] unless previewing with no capture pending.
    pub fn on_capture_trigger(&self) -> Result<()> {
        let state = self.state();
        if state != SessionState::Previewing {
            return Err(CaptureError::NotReady(state));
        }
        if self
            .capture_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotReady(SessionState::Capturing));
        }

        let WorkerSlot::Running { commands, .. } = &self.worker else {
            self.capture_pending.store(false, Ordering::Release);
            return Err(CaptureError::NotReady(SessionState::Closed));
        };
        if commands.send(Command::ScheduleCapture).is_err() {
            self.capture_pending.store(false, Ordering::Release);
            return Err(CaptureError::NotReady(SessionState::Closed));
        }
        debug!("capture trigger accepted");
        Ok(())
    }

    /// Close the session and device, cancel any scheduled capture and stop
    /// the background context. Safe to call repeatedly or before any open.
    pub fn on_teardown(&mut self) {
        let slot = std::mem::replace(&mut self.worker, WorkerSlot::Stopped(None));
        self.worker = match slot {
            WorkerSlot::Running { commands, thread } => {
                if commands.send(Command::Shutdown).is_err() {
                    debug!("background context already stopped");
                }
                match thread.join() {
                    Ok(platform) => {
                        info!("background context stopped");
                        WorkerSlot::Stopped(Some(platform))
                    }
                    Err(_) => {
                        error!("background context panicked");
                        WorkerSlot::Stopped(None)
                    }
                }
            }
            stopped @ WorkerSlot::Stopped(_) => stopped,
        };
        self.capture_pending.store(false, Ordering::Release);
        *self.state.write() = SessionState::Closed;
    }

    fn spawn(&mut self, platform: P) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| {
                CaptureError::Device(format!("failed to start background context: {err}"))
            })?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let sink = Arc::new(FrameSink::new(self.config.sink_capacity()));
        let frames = commands.clone();
        sink.set_listener(move || {
            // The worker may already be gone during shutdown.
            let _ = frames.send(Command::FrameAvailable);
        });
        let routed = commands.clone();
        let router: EventRouter<P::Device> = Arc::new(move |generation, event| {
            let _ = routed.send(Command::Device(generation, event));
        });

        let mut controller = SessionController::new(
            platform,
            self.config.clone(),
            sink,
            Arc::clone(&self.lock),
            router,
            Arc::clone(&self.state),
        );
        controller.set_permission(self.permission);

        let worker = Worker {
            controller,
            store: Arc::clone(&self.store),
            commands: commands.clone(),
            events: self.events.clone(),
            capture_pending: Arc::clone(&self.capture_pending),
            capture_delay: self.config.capture_delay(),
            surface: None,
            timer: None,
            next_token: 0,
        };

        let thread = thread::Builder::new()
            .name("camera-background".to_owned())
            .spawn(move || runtime.block_on(worker.run(receiver)))
            .map_err(|err| {
                CaptureError::Device(format!("failed to start background context: {err}"))
            })?;

        self.worker = WorkerSlot::Running { commands, thread };
        Ok(())
    }

    fn send(&self, command: Command<P::Device>) {
        match &self.worker {
            WorkerSlot::Running { commands, .. } => {
                if commands.send(command).is_err() {
                    warn!("background context is gone; command dropped");
                }
            }
            WorkerSlot::Stopped(_) => debug!("background context stopped; command ignored"),
        }
    }

    fn emit(&self, event: CaptureEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

impl<P: CameraPlatform> Drop for CaptureCoordinator<P> {
    fn drop(&mut self) {
        self.on_teardown();
    }
}

struct ScheduledCapture {
    token: u64,
    task: tokio::task::JoinHandle<()>,
}

/// State owned by the background context.
struct Worker<P: CameraPlatform> {
    controller: SessionController<P>,
    store: Arc<FrameStore>,
    commands: UnboundedSender<Command<P::Device>>,
    events: UnboundedSender<CaptureEvent>,
    capture_pending: Arc<AtomicBool>,
    capture_delay: Duration,
    surface: Option<SurfaceDescriptor>,
    timer: Option<ScheduledCapture>,
    next_token: u64,
}

impl<P: CameraPlatform> Worker<P> {
    async fn run(mut self, mut commands: UnboundedReceiver<Command<P::Device>>) -> P {
        debug!("background context running");
        while let Some(command) = commands.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.shutdown();
        self.controller.into_platform()
    }

    fn handle(&mut self, command: Command<P::Device>) -> ControlFlow<()> {
        match command {
            Command::PermissionResult(granted) => self.on_permission_result(granted),
            Command::SurfaceReady(surface) => {
                self.surface = Some(surface);
                self.open_and_preview();
            }
            Command::SurfaceUpdated => debug!("preview surface updated"),
            Command::SurfaceDestroyed => {
                info!("preview surface destroyed");
                self.surface = None;
            }
            Command::ScheduleCapture => self.schedule_capture(),
            Command::FireCapture(token) => self.fire_capture(token),
            Command::FrameAvailable => self.persist_still(),
            Command::Device(generation, event) => {
                if let Err(err) = self.controller.on_device_event(generation, event) {
                    if matches!(err, CaptureError::Capture(_)) {
                        self.capture_pending.store(false, Ordering::Release);
                    }
                    self.report(err);
                }
            }
            Command::Shutdown => return ControlFlow::Break(()),
        }
        self.settle();
        ControlFlow::Continue(())
    }

    fn on_permission_result(&mut self, granted: bool) {
        let permission = if granted {
            Permission::Granted
        } else {
            Permission::Denied
        };
        self.controller.set_permission(permission);

        let open = *self.controller.state() != SessionState::Closed;
        if granted {
            if !open {
                self.open_and_preview();
            }
            return;
        }
        if open || self.surface.is_some() {
            self.emit(CaptureEvent::PermissionDenied);
        }
        if open {
            // A pending capture is abandoned by `settle` once closed.
            info!("permission withdrawn, closing the device");
            if let Err(err) = self.controller.close() {
                warn!(error = %err, "close after permission withdrawal failed");
            }
        }
    }

    fn open_and_preview(&mut self) {
        let Some(surface) = self.surface else {
            return;
        };
        if *self.controller.state() == SessionState::Closed {
            if let Err(err) = self.controller.open_device() {
                self.report(err);
                return;
            }
        }
        if let Err(err) = self.controller.begin_preview(surface) {
            self.report(err);
        }
    }

    fn schedule_capture(&mut self) {
        if !self.capture_pending.load(Ordering::Acquire) {
            debug!("capture abandoned before scheduling");
            return;
        }
        if *self.controller.state() != SessionState::Previewing {
            let state = self.controller.state().clone();
            self.fail_pending(&format!("capture no longer possible while {state}"));
            return;
        }

        self.cancel_timer();
        self.next_token += 1;
        let token = self.next_token;
        let commands = self.commands.clone();
        let delay = self.capture_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::FireCapture(token));
        });
        self.timer = Some(ScheduledCapture { token, task });
        debug!(token, ?delay, "still capture scheduled");
    }

    fn fire_capture(&mut self, token: u64) {
        match self.timer.take() {
            Some(timer) if timer.token == token => {}
            other => {
                self.timer = other;
                debug!(token, "ignoring cancelled capture timer");
                return;
            }
        }
        if let Err(err) = self.controller.capture_still() {
            self.fail_pending(&err.to_string());
        }
    }

    fn persist_still(&mut self) {
        let Some(frame) = self.controller.take_still_frame() else {
            return;
        };
        let persisted = self.store.persist(frame);
        self.controller.finish_still();
        self.capture_pending.store(false, Ordering::Release);

        match persisted {
            Ok(locator) => {
                info!(%locator, "capture complete");
                self.emit(CaptureEvent::CaptureComplete(locator));
            }
            Err(err) => self.report(err),
        }
    }

    /// Abandon a pending capture once the session can no longer serve it.
    fn settle(&mut self) {
        let serving = matches!(
            self.controller.state(),
            SessionState::Previewing | SessionState::Capturing
        );
        if !serving && self.capture_pending.load(Ordering::Acquire) {
            let state = self.controller.state().clone();
            self.fail_pending(&format!("capture abandoned while {state}"));
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        self.cancel_timer();
        if self.capture_pending.swap(false, Ordering::AcqRel) {
            warn!(%reason, "pending capture failed");
            self.emit(CaptureEvent::CaptureFailed(reason.to_owned()));
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            debug!(token = timer.token, "capture timer cancelled");
            timer.task.abort();
        }
    }

    fn shutdown(&mut self) {
        self.cancel_timer();
        self.capture_pending.store(false, Ordering::Release);
        if let Err(err) = self.controller.close() {
            warn!(error = %err, "close during teardown failed");
        }
    }

    fn report(&self, err: CaptureError) {
        if let CaptureError::NotReady(state) = &err {
            debug!(%state, "request not valid in current state");
            return;
        }
        warn!(error = %err, "capture pipeline error");
        self.emit(err.into());
    }

    fn emit(&self, event: CaptureEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}
