//! Fixed-size frame buffer pools.
//!
//! A pool pre-allocates `capacity` slots. [`BufferPool::acquire`] moves a
//! slot's memory into a [`BufferLease`]; the lease becomes a [`FrameBuffer`]
//! once filled. Dropping (or [`FrameBuffer::release`]-ing) either one moves
//! the memory back. Ownership of the lease is the only way to reach the
//! pixels, so a released buffer cannot be used or released again. Each slot
//! also carries a generation counter that is checked on return.

use crate::driver::{BufferHandle, StreamFormat};
use crate::types::{CameraId, ImageView};
use crate::{Result, TrackingError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifies one lending of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferToken {
    pub slot: usize,
    pub generation: u32,
}

enum SlotState {
    Free(Vec<u8>),
    Lent { generation: u32 },
}

struct Slot {
    state: SlotState,
    generation: u32,
    handle: Option<BufferHandle>,
}

/// Pre-allocated buffers of one camera.
pub struct BufferPool {
    camera_id: CameraId,
    format: StreamFormat,
    slots: Mutex<Vec<Slot>>,
    returned: Condvar,
}

impl BufferPool {
    /// Allocate `count` buffers sized for `format`. `handles[i]`, when present,
    /// is the zero-copy export of slot `i`.
    pub fn new(
        camera_id: CameraId,
        format: StreamFormat,
        count: usize,
        handles: Vec<Option<BufferHandle>>,
    ) -> Arc<Self> {
        let size = format.frame_size();
        let slots = (0..count)
            .map(|i| Slot {
                state: SlotState::Free(vec![0u8; size]),
                generation: 0,
                handle: handles.get(i).copied().flatten(),
            })
            .collect();
        Arc::new(Self {
            camera_id,
            format,
            slots: Mutex::new(slots),
            returned: Condvar::new(),
        })
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn available(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| matches!(s.state, SlotState::Free(_)))
            .count()
    }

    /// Take a free slot, or None when every buffer is lent out.
    pub fn acquire(self: &Arc<Self>) -> Option<BufferLease> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|s| matches!(s.state, SlotState::Free(_)))?;
        let slot = &mut slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        let data = match std::mem::replace(&mut slot.state, SlotState::Lent { generation }) {
            SlotState::Free(data) => data,
            SlotState::Lent { .. } => return None,
        };
        Some(BufferLease {
            pool: Arc::clone(self),
            token: BufferToken { slot: index, generation },
            handle: slot.handle,
            data: Some(data),
        })
    }

    /// Like [`acquire`](Self::acquire) but waits up to `timeout` for a buffer to come back.
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<BufferLease> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lease) = self.acquire() {
                return Some(lease);
            }
            let mut slots = self.slots.lock();
            if slots.iter().any(|s| matches!(s.state, SlotState::Free(_))) {
                continue;
            }
            if self.returned.wait_until(&mut slots, deadline).timed_out() {
                return None;
            }
        }
    }

    fn recycle(&self, token: BufferToken, data: Vec<u8>) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(token.slot).ok_or(TrackingError::InvalidBuffer)?;
        match slot.state {
            SlotState::Lent { generation } if generation == token.generation => {
                slot.state = SlotState::Free(data);
                drop(slots);
                self.returned.notify_one();
                Ok(())
            }
            _ => Err(TrackingError::InvalidBuffer),
        }
    }
}

/// Exclusive access to a pool slot being filled by a capture path.
pub struct BufferLease {
    pool: Arc<BufferPool>,
    token: BufferToken,
    handle: Option<BufferHandle>,
    data: Option<Vec<u8>>,
}

impl BufferLease {
    pub fn token(&self) -> BufferToken {
        self.token
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Seal the filled buffer into a deliverable frame.
    pub fn into_frame(self, frame_id: u64, timestamp_s: f64, zero_copy: bool) -> FrameBuffer {
        FrameBuffer {
            handle: if zero_copy { self.handle } else { None },
            lease: self,
            frame_id,
            timestamp_s,
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Err(e) = self.pool.recycle(self.token, data) {
                log::error!(
                    "camera {}: failed to recycle buffer {:?}: {}",
                    self.pool.camera_id,
                    self.token,
                    e
                );
            }
        }
    }
}

/// A captured frame. Exactly one consumer owns it until it is released.
pub struct FrameBuffer {
    lease: BufferLease,
    frame_id: u64,
    timestamp_s: f64,
    handle: Option<BufferHandle>,
}

impl FrameBuffer {
    pub fn camera_id(&self) -> CameraId {
        self.lease.pool.camera_id
    }

    /// Per-camera, strictly increasing.
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_s
    }

    pub fn format(&self) -> StreamFormat {
        self.lease.pool.format
    }

    pub fn token(&self) -> BufferToken {
        self.lease.token
    }

    /// Cross-process handle, present only in zero-copy mode.
    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn data(&self) -> &[u8] {
        self.lease.data()
    }

    pub fn image(&self) -> ImageView<'_> {
        let f = self.lease.pool.format;
        ImageView {
            data: self.lease.data(),
            width: f.width,
            height: f.height,
            stride: f.stride,
            format: f.format,
        }
    }

    /// Return the buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("camera_id", &self.camera_id())
            .field("frame_id", &self.frame_id)
            .field("timestamp_s", &self.timestamp_s)
            .field("token", &self.lease.token)
            .field("zero_copy", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn format() -> StreamFormat {
        StreamFormat {
            width: 8,
            height: 4,
            stride: 8,
            format: PixelFormat::Gray8,
            fps: 30.0,
        }
    }

    #[test]
    fn test_exhaust_and_reuse() {
        let pool = BufferPool::new(0, format(), 2, Vec::new());
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.token().slot, b.token().slot);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        let slot = a.token().slot;
        let frame = a.into_frame(1, 0.0, false);
        frame.release();
        assert_eq!(pool.available(), 1);

        let c = pool.acquire().unwrap();
        assert_eq!(c.token().slot, slot);
        assert_eq!(c.token().generation, 2);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_stale_token_is_rejected() {
        let pool = BufferPool::new(0, format(), 1, Vec::new());
        let lease = pool.acquire().unwrap();
        let stale = BufferToken {
            slot: lease.token().slot,
            generation: lease.token().generation + 7,
        };
        assert!(matches!(
            pool.recycle(stale, vec![0u8; 32]),
            Err(TrackingError::InvalidBuffer)
        ));
        drop(lease);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_acquire_timeout_wakes_on_release() {
        let pool = BufferPool::new(3, format(), 1, Vec::new());
        let lease = pool.acquire().unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire_timeout(Duration::from_secs(2)).is_some())
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(lease);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_zero_copy_handle_only_when_enabled() {
        let handle = BufferHandle { fd: 9, offset: 0, len: 32 };
        let pool = BufferPool::new(0, format(), 1, vec![Some(handle)]);
        let frame = pool.acquire().unwrap().into_frame(1, 0.0, true);
        assert_eq!(frame.handle(), Some(handle));
        assert_eq!(frame.image().data.len(), 32);
        drop(frame);
        let frame = pool.acquire().unwrap().into_frame(2, 0.1, false);
        assert_eq!(frame.handle(), None);
    }
}
