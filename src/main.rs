//! Still-cam binary: capture one still from the first V4L2 camera.

use std::time::{Duration, Instant};

use still_cam::{
    CaptureConfig, CaptureCoordinator, CaptureError, CaptureEvent, DeviceRegistry, SessionState,
    V4l2Platform,
};
use tracing_subscriber::EnvFilter;

const PREVIEW_WIDTH: u32 = 1280;
const PREVIEW_HEIGHT: u32 = 720;
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("still_cam=info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> still_cam::Result<()> {
    let config = CaptureConfig::from_env()?;
    let platform = V4l2Platform::new();

    let devices = DeviceRegistry::new(&platform).list_devices()?;
    for device in &devices {
        println!("Device: {} ({})", device.id, device.name);
    }

    let (mut coordinator, mut events) = CaptureCoordinator::new(platform, config)?;
    coordinator.on_permission_result(true);
    coordinator.on_surface_ready(PREVIEW_WIDTH, PREVIEW_HEIGHT);

    let deadline = Instant::now() + OPEN_TIMEOUT;
    while coordinator.state() != SessionState::Previewing {
        if let Ok(event) = events.try_recv() {
            coordinator.on_teardown();
            return Err(failure(event));
        }
        if Instant::now() >= deadline {
            coordinator.on_teardown();
            return Err(CaptureError::DeviceOpen(format!(
                "device not previewing after {OPEN_TIMEOUT:?}"
            )));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    coordinator.on_capture_trigger()?;
    let outcome = loop {
        match events.blocking_recv() {
            Some(CaptureEvent::CaptureComplete(locator)) => break Ok(locator),
            Some(CaptureEvent::ConfigurationError(reason)) => {
                eprintln!("Warning: {reason}");
            }
            Some(event) => break Err(failure(event)),
            None => break Err(CaptureError::Capture("event stream closed".to_owned())),
        }
    };
    coordinator.on_teardown();

    let locator = outcome?;
    println!("Captured: {locator}");
    Ok(())
}

fn failure(event: CaptureEvent) -> CaptureError {
    match event {
        CaptureEvent::CaptureFailed(reason) => CaptureError::Capture(reason),
        CaptureEvent::DeviceOpenError(reason) => CaptureError::DeviceOpen(reason),
        CaptureEvent::DeviceDisconnected => CaptureError::DeviceDisconnected,
        CaptureEvent::ConfigurationError(reason) => CaptureError::Configuration(reason),
        CaptureEvent::PermissionDenied => CaptureError::PermissionDenied,
        CaptureEvent::PermissionRequired => CaptureError::PermissionRequired,
        CaptureEvent::DeviceUnavailable(reason) => CaptureError::DeviceUnavailable(reason),
        CaptureEvent::DeviceError(reason) => CaptureError::Device(reason),
        CaptureEvent::CaptureComplete(locator) => {
            CaptureError::Capture(format!("unexpected completion {locator}"))
        }
    }
}
