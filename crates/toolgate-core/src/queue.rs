//! Bounded FIFO queue carrying serialized frames from the upstream reader
//! to the downstream writer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// Queue is at capacity; the frame is handed back for a retry.
    Full(String),
    /// The consumer side is gone; the frame is dropped.
    Closed,
}

/// Mutex-protected single-producer/single-consumer queue. Popping never
/// blocks; a producer that hits the capacity bound retries cooperatively.
pub struct FrameQueue {
    frames: Mutex<VecDeque<String>>,
    capacity: usize,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn try_push(&self, frame: String) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return Err(PushError::Full(frame));
        }
        frames.push_back(frame);
        Ok(())
    }

    /// Pops the oldest frame without waiting.
    pub fn pop(&self) -> Option<String> {
        self.frames.lock().pop_front()
    }

    /// Pops everything currently queued, preserving producer order.
    pub fn drain_ready(&self) -> Vec<String> {
        self.frames.lock().drain(..).collect()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    /// Marks the queue dead for both sides. Queued frames stay poppable so
    /// the consumer may still drain what was produced before the close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
