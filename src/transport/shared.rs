//! Shared-buffer transport: frame slots plus an atomic control block
//!
//! The producer owns the only write path. The region holds three frame
//! slots; a publish copies into a slot no reader is looking at, stores the
//! metadata words, then stores `ACTIVE_SLOT`, and only then `FRAME_SEQ` and
//! `STATUS` with release ordering. A consumer polls by loading `STATUS` and
//! `FRAME_SEQ` with acquire ordering and copying out of the active slot with
//! `try_read`. Readers never wait: a slot the producer is recycling reads as
//! "nothing new yet".
//!
//! Control block layout (16 × `u32`):
//!
//! | Slot | Field |
//! |---|---|
//! | 0 | `STATUS` (0 empty, 1 frame ready, 2 failed) |
//! | 1 | `FRAME_SEQ` |
//! | 2 | `WIDTH` |
//! | 3 | `HEIGHT` |
//! | 4 | `STRIDE` |
//! | 5 | `BYTE_LENGTH` |
//! | 6 | `TS_LOW` |
//! | 7 | `TS_HIGH` |
//! | 8 | `PIXEL_FORMAT` (1 RGBA8, 2 BGRA8) |
//! | 9 | `ACTIVE_SLOT` (index of the slot holding `FRAME_SEQ`) |
//!
//! `FRAME_SEQ` is the low 32 bits of the session frame sequence; each slot
//! keeps the full value.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::{
    capture::constants::{MAX_FRAME_BYTES, MAX_REGION_BYTES, SHARED_REGION_MIN_BYTES, payload_bytes},
    error::{CaptureError, CaptureResult},
    model::{Frame, FrameMeta},
};

pub const CONTROL_SLOTS: usize = 16;

pub const SLOT_STATUS: usize = 0;
pub const SLOT_FRAME_SEQ: usize = 1;
pub const SLOT_WIDTH: usize = 2;
pub const SLOT_HEIGHT: usize = 3;
pub const SLOT_STRIDE: usize = 4;
pub const SLOT_BYTE_LENGTH: usize = 5;
pub const SLOT_TS_LOW: usize = 6;
pub const SLOT_TS_HIGH: usize = 7;
pub const SLOT_PIXEL_FORMAT: usize = 8;
pub const SLOT_ACTIVE: usize = 9;

pub const STATUS_EMPTY: u32 = 0;
pub const STATUS_READY: u32 = 1;
pub const STATUS_FAILED: u32 = 2;

/// Frame slots per region: the active one plus two the producer can fill
/// while lagging readers finish copying
const FRAME_SLOTS: usize = 3;

/// Fixed array of atomic words shared by producer and consumer
#[derive(Debug, Default)]
pub struct ControlBlock {
    words: [AtomicU32; CONTROL_SLOTS],
}

impl ControlBlock {
    pub fn load(&self, slot: usize, order: Ordering) -> u32 {
        self.words[slot].load(order)
    }

    fn store(&self, slot: usize, value: u32, order: Ordering) {
        self.words[slot].store(value, order);
    }
}

#[derive(Debug)]
struct FrameSlot {
    seq:   u64,
    meta:  Option<FrameMeta>,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct SharedRegion {
    control:  ControlBlock,
    slots:    [RwLock<FrameSlot>; FRAME_SLOTS],
    capacity: AtomicUsize,
    /// Serializes publishers; readers never touch it
    producer: Mutex<()>,
}

impl SharedRegion {
    /// A slot other than `active`, preferring one no reader holds
    fn spare_slot(&self, active: usize) -> (usize, RwLockWriteGuard<'_, FrameSlot>) {
        for offset in 1..FRAME_SLOTS {
            let index = (active + offset) % FRAME_SLOTS;
            if let Some(slot) = self.slots[index].try_write() {
                return (index, slot);
            }
        }
        // both spares are mid-copy by readers that fell behind
        let index = (active + 1) % FRAME_SLOTS;
        (index, self.slots[index].write())
    }
}

/// Shared frame region and control block
///
/// Cloning yields another handle to the same memory. The worker publishes
/// through one handle; consumers read through [`SharedFrameReader`]s.
#[derive(Debug, Clone)]
pub struct SharedFrameBuffer {
    region: Arc<SharedRegion>,
}

impl SharedFrameBuffer {
    /// Allocates slots of at least 1 MiB, or `frame_bytes` if larger
    ///
    /// `frame_bytes` is `stride * height` and may include row padding.
    ///
    /// # Errors
    ///
    /// [`CaptureError::FrameTooLarge`] if `frame_bytes` exceeds the region
    /// limit.
    pub fn with_capacity(frame_bytes: usize) -> CaptureResult<Self> {
        if frame_bytes > MAX_REGION_BYTES {
            return Err(CaptureError::FrameTooLarge {
                byte_length: frame_bytes,
                limit:       MAX_REGION_BYTES,
            });
        }
        let capacity = frame_bytes.max(SHARED_REGION_MIN_BYTES);
        let slot = || {
            RwLock::new(FrameSlot {
                seq:   0,
                meta:  None,
                bytes: vec![0; capacity],
            })
        };
        Ok(Self {
            region: Arc::new(SharedRegion {
                control:  ControlBlock::default(),
                slots:    [slot(), slot(), slot()],
                capacity: AtomicUsize::new(capacity),
                producer: Mutex::new(()),
            }),
        })
    }

    /// Largest frame the region has held without growing
    pub fn capacity(&self) -> usize {
        self.region.capacity.load(Ordering::Relaxed)
    }

    pub fn control(&self) -> &ControlBlock {
        &self.region.control
    }

    /// Whether two handles share the same memory
    pub fn same_region(&self, other: &SharedFrameBuffer) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Publishes one frame, replacing whatever readers saw before
    ///
    /// A slot grows (never shrinks) when the frame is larger than it.
    ///
    /// # Errors
    ///
    /// [`CaptureError::FrameTooLarge`] if the pixel payload exceeds
    /// [`MAX_FRAME_BYTES`] or `bytes` exceeds the region limit; nothing is
    /// published in that case.
    pub fn publish(&self, seq: u64, meta: &FrameMeta, bytes: &[u8]) -> CaptureResult<()> {
        let payload = payload_bytes(meta.width, meta.height);
        if payload > MAX_FRAME_BYTES {
            return Err(CaptureError::FrameTooLarge {
                byte_length: payload,
                limit:       MAX_FRAME_BYTES,
            });
        }
        if bytes.len() > MAX_REGION_BYTES {
            return Err(CaptureError::FrameTooLarge {
                byte_length: bytes.len(),
                limit:       MAX_REGION_BYTES,
            });
        }

        let region = &*self.region;
        let control = &region.control;
        let _producer = region.producer.lock();
        let active = control.load(SLOT_ACTIVE, Ordering::Relaxed) as usize % FRAME_SLOTS;
        let (index, mut slot) = region.spare_slot(active);
        if slot.bytes.len() < bytes.len() {
            tracing::debug!(from = slot.bytes.len(), to = bytes.len(), "growing shared frame slot");
            slot.bytes.resize(bytes.len(), 0);
            region.capacity.fetch_max(bytes.len(), Ordering::Relaxed);
        }
        slot.bytes[..bytes.len()].copy_from_slice(bytes);
        slot.seq = seq;
        slot.meta = Some(FrameMeta {
            byte_length: bytes.len(),
            ..*meta
        });
        drop(slot);

        control.store(SLOT_WIDTH, meta.width, Ordering::Relaxed);
        control.store(SLOT_HEIGHT, meta.height, Ordering::Relaxed);
        control.store(SLOT_STRIDE, meta.stride, Ordering::Relaxed);
        control.store(SLOT_BYTE_LENGTH, bytes.len() as u32, Ordering::Relaxed);
        control.store(SLOT_TS_LOW, meta.timestamp_ms as u32, Ordering::Relaxed);
        control.store(SLOT_TS_HIGH, (meta.timestamp_ms >> 32) as u32, Ordering::Relaxed);
        control.store(SLOT_PIXEL_FORMAT, meta.pixel_format.code(), Ordering::Relaxed);
        control.store(SLOT_ACTIVE, index as u32, Ordering::Relaxed);
        // publish last
        control.store(SLOT_FRAME_SEQ, seq as u32, Ordering::Release);
        control.store(SLOT_STATUS, STATUS_READY, Ordering::Release);
        Ok(())
    }

    /// Flags the producer as failed; readers stop accepting frames
    pub fn mark_failed(&self) {
        self.region
            .control
            .store(SLOT_STATUS, STATUS_FAILED, Ordering::Release);
    }

    pub fn status(&self) -> u32 {
        self.region.control.load(SLOT_STATUS, Ordering::Acquire)
    }

    pub fn reader(&self) -> SharedFrameReader {
        SharedFrameReader {
            buffer:   self.clone(),
            last_seq: 0,
            dropped:  0,
        }
    }
}

/// A frame taken from a transport, with the number of frames skipped since
/// the previous one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub frame:       Frame,
    /// `max(0, seq - last_seq - 1)`, with `last_seq` starting at 0
    pub queue_depth: u64,
}

/// Consumer side of a [`SharedFrameBuffer`]
#[derive(Debug, Clone)]
pub struct SharedFrameReader {
    buffer:   SharedFrameBuffer,
    last_seq: u64,
    dropped:  u64,
}

impl SharedFrameReader {
    /// Returns the latest frame if its sequence advanced since the last poll
    ///
    /// Never blocks. `None` means "nothing new yet".
    pub fn poll(&mut self) -> Option<ReceivedFrame> {
        let region = &*self.buffer.region;
        let control = &region.control;
        if control.load(SLOT_STATUS, Ordering::Acquire) != STATUS_READY {
            return None;
        }
        if control.load(SLOT_FRAME_SEQ, Ordering::Acquire) == self.last_seq as u32 {
            return None;
        }

        let index = control.load(SLOT_ACTIVE, Ordering::Acquire) as usize % FRAME_SLOTS;
        // held by the producer only when it is already recycling this slot
        let slot = region.slots[index].try_read()?;
        if slot.seq <= self.last_seq {
            return None;
        }
        let meta = slot.meta?;
        let frame = Frame {
            seq:          slot.seq,
            width:        meta.width,
            height:       meta.height,
            stride:       meta.stride,
            pixel_format: meta.pixel_format,
            timestamp_ms: meta.timestamp_ms,
            bytes:        Bytes::copy_from_slice(slot.bytes.get(..meta.byte_length)?),
        };
        drop(slot);

        let queue_depth = frame.seq.saturating_sub(self.last_seq).saturating_sub(1);
        self.dropped += queue_depth;
        self.last_seq = frame.seq;
        tracing::trace!(seq = frame.seq, queue_depth, "shared frame received");
        Some(ReceivedFrame { frame, queue_depth })
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Total frames skipped across all polls
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Whether the producer flagged a failure
    pub fn producer_failed(&self) -> bool {
        self.buffer.status() == STATUS_FAILED
    }
}
