//! Per-characteristic notification buffers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Byte capacity of a stream buffer.
pub const STREAM_CAPACITY: usize = 8192;
/// Notification capacity of a frame buffer.
pub const FRAME_CAPACITY: usize = 256;

/// How notifications on a characteristic are consumed.
///
/// Pushes never block the event thread. A notification that does not fit is
/// dropped and the next read on that buffer fails with
/// [`ReadError::Overflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Byte queue; reads take exact byte counts across notifications.
    Stream,
    /// One notification per read.
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    Timeout,
    /// Buffer released by a disconnect.
    Closed,
    WrongKind,
    /// A notification was dropped since the last read.
    Overflow,
}

#[derive(Default)]
struct Queue {
    bytes: VecDeque<u8>,
    frames: VecDeque<Vec<u8>>,
    closed: bool,
    overflowed: bool,
}

pub struct NotificationBuffer {
    kind: BufferKind,
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl NotificationBuffer {
    pub fn new(kind: BufferKind) -> Self {
        Self {
            kind,
            queue: Mutex::new(Queue::default()),
            cond: Condvar::new(),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one notification without blocking. False when full or closed;
    /// a full buffer also fails the next read.
    pub fn push(&self, data: &[u8]) -> bool {
        let mut q = self.lock();
        if q.closed {
            return false;
        }
        match self.kind {
            BufferKind::Stream => {
                if q.bytes.len() + data.len() > STREAM_CAPACITY {
                    return self.overflow(q);
                }
                q.bytes.extend(data.iter().copied());
            }
            BufferKind::Frame => {
                if q.frames.len() >= FRAME_CAPACITY {
                    return self.overflow(q);
                }
                q.frames.push_back(data.to_vec());
            }
        }
        self.cond.notify_all();
        true
    }

    fn overflow(&self, mut q: MutexGuard<'_, Queue>) -> bool {
        q.overflowed = true;
        self.cond.notify_all();
        false
    }

    /// Take exactly `n` bytes from a stream buffer.
    pub fn read_exact(&self, n: usize, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        if self.kind != BufferKind::Stream {
            return Err(ReadError::WrongKind);
        }
        let mut q = self.wait_until(timeout, |q| q.bytes.len() >= n)?;
        Ok(q.bytes.drain(..n).collect())
    }

    /// Take the next whole notification from a frame buffer.
    pub fn read_frame(&self, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        if self.kind != BufferKind::Frame {
            return Err(ReadError::WrongKind);
        }
        let mut q = self.wait_until(timeout, |q| !q.frames.is_empty())?;
        q.frames.pop_front().ok_or(ReadError::Timeout)
    }

    fn wait_until<F>(&self, timeout: Duration, ready: F) -> Result<MutexGuard<'_, Queue>, ReadError>
    where
        F: Fn(&Queue) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut q = self.lock();
        loop {
            if q.overflowed {
                q.overflowed = false;
                return Err(ReadError::Overflow);
            }
            if ready(&q) {
                return Ok(q);
            }
            if q.closed {
                return Err(ReadError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReadError::Timeout);
            }
            q = match self.cond.wait_timeout(q, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Bytes or frames currently queued.
    pub fn queued(&self) -> usize {
        let q = self.lock();
        match self.kind {
            BufferKind::Stream => q.bytes.len(),
            BufferKind::Frame => q.frames.len(),
        }
    }

    pub fn clear(&self) {
        let mut q = self.lock();
        q.bytes.clear();
        q.frames.clear();
        q.overflowed = false;
    }

    /// Stop accepting data. Readers drain what is queued, then fail.
    pub fn close(&self) {
        let mut q = self.lock();
        q.closed = true;
        self.cond.notify_all();
    }

    /// Drop queued data and fail current and future readers.
    pub fn release(&self) {
        let mut q = self.lock();
        q.bytes.clear();
        q.frames.clear();
        q.closed = true;
        q.overflowed = false;
        self.cond.notify_all();
    }
}
