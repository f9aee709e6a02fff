//! Bounded hand-off between the device's delivery thread and the consumer.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::traits::FrameHandle;

type Listener = Box<dyn Fn() + Send + Sync>;

/// Buffers the most recent still frames up to a fixed capacity.
///
/// `deliver` never blocks on the consumer, so the device thread is never
/// held up by disk I/O downstream.
pub struct FrameSink {
    capacity: usize,
    frames: Mutex<VecDeque<FrameHandle>>,
    available: Condvar,
    listener: Mutex<Option<Listener>>,
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink")
            .field("capacity", &self.capacity)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl FrameSink {
    /// Create a sink holding at most `capacity` frames (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            listener: Mutex::new(None),
        }
    }

    /// Install the "new frame available" hook, replacing any previous one.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    /// Store a frame, evicting the oldest when full, and wake one consumer.
    pub fn deliver(&self, frame: FrameHandle) {
        {
            let mut frames = self.frames.lock();
            while frames.len() >= self.capacity {
                if let Some(evicted) = frames.pop_front() {
                    warn!(
                        sequence = evicted.metadata.sequence,
                        "frame sink full, evicting oldest frame"
                    );
                }
            }
            debug!(
                sequence = frame.metadata.sequence,
                bytes = frame.data.len(),
                "frame delivered to sink"
            );
            frames.push_back(frame);
            self.available.notify_one();
        }

        if let Some(listener) = self.listener.lock().as_ref() {
            listener();
        }
    }

    /// Take the oldest pending frame without blocking.
    pub fn take(&self) -> Option<FrameHandle> {
        self.frames.lock().pop_front()
    }

    /// Take a frame, waiting at most `timeout` for one to arrive.
    pub fn wait_take(&self, timeout: Duration) -> Option<FrameHandle> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        while frames.is_empty() {
            if self.available.wait_until(&mut frames, deadline).timed_out() {
                break;
            }
        }
        frames.pop_front()
    }

    /// Discard every pending frame. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut frames = self.frames.lock();
        let dropped = frames.len();
        frames.clear();
        if dropped > 0 {
            debug!(dropped, "discarded pending frames");
        }
        dropped
    }

    /// Number of pending frames.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether no frame is pending.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Maximum number of frames held.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
