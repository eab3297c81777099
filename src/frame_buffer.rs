// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-window ring buffer for captured frames.
//!
//! Each tracked window owns a fixed-slot ring (3 slots by default) backed
//! either by a range of the shared region or, when shared memory is
//! unavailable, by a private heap allocation. A slot holds one frame:
//! a 36-byte [`FrameSlotHeader`] followed by raw or compressed pixels.
//!
//! Writes never block and never overwrite unread slots; a full ring
//! rejects the frame and the caller counts the drop. `read_index` only
//! advances through [`WindowFrameBuffer::advance_read_index`].

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::protocol::{FrameSlotHeader, DEFAULT_SLOT_COUNT, SLOT_HEADER_SIZE};
use crate::shmem::{SharedAllocation, SharedMemoryAllocator};

/// Fixed ascending slot-size buckets for tranche mode.
pub const TRANCHE_BUCKETS: [usize; 4] = [
    3 * 1024 * 1024,
    8 * 1024 * 1024,
    20 * 1024 * 1024,
    50 * 1024 * 1024,
];

/// Slot sizing policy for a window's ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Slot sized to the raw frame (plus headroom); reallocates whenever
    /// the raw frame size changes. Lowest latency, proportional memory.
    Exact,
    /// Slot snaps up to the smallest tranche bucket that fits the
    /// payload; reallocates only when the payload outgrows the bucket.
    /// Suits compressed frames whose size varies frame to frame.
    Tranche,
}

impl Default for AllocationMode {
    fn default() -> Self {
        AllocationMode::Exact
    }
}

/// Whether `ensure_allocated` changed the buffer's placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// Existing placement still fits.
    Unchanged,
    /// First allocation for this window.
    Allocated,
    /// Placement was replaced; indices were reset and unread frames
    /// discarded.
    Reallocated,
}

impl AllocationOutcome {
    /// True when a notification must be emitted before writing frames.
    pub fn changed(&self) -> bool {
        !matches!(self, AllocationOutcome::Unchanged)
    }
}

/// Why a frame write was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameWriteError {
    /// `ensure_allocated` has not been called for this window yet.
    #[error("buffer not allocated")]
    Unallocated,

    /// The next slot would collide with the read index.
    #[error("ring buffer full")]
    BufferFull,

    /// Payload exceeds the slot capacity.
    #[error("payload of {size} bytes exceeds slot capacity {capacity}")]
    PayloadTooLarge { size: usize, capacity: usize },
}

/// Where a window's buffer placement lives, for the allocation
/// notification sent to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlacement {
    /// Offset into the shared region; 0 for private buffers
    pub offset: u64,
    pub uses_shared_memory: bool,
    pub buffer_size: u64,
    pub slot_size: u64,
    pub slot_count: u32,
}

enum Backing {
    None,
    Shared(SharedAllocation),
    Private(Vec<u8>),
}

/// Ring buffer of frame slots for one window.
pub struct WindowFrameBuffer {
    window_id: u64,
    slot_count: u32,
    slot_size: usize,
    write_index: u32,
    read_index: u32,
    mode: AllocationMode,
    /// Raw frame byte size the current placement was sized for
    /// (exact-mode change detection).
    raw_frame_size: usize,
    backing: Backing,
    allocator: Option<Arc<SharedMemoryAllocator>>,
}

impl WindowFrameBuffer {
    /// Create an empty, unallocated buffer for `window_id`.
    pub fn new(window_id: u64, allocator: Option<Arc<SharedMemoryAllocator>>) -> Self {
        Self::with_slot_count(window_id, DEFAULT_SLOT_COUNT, allocator)
    }

    /// Create with an explicit slot count (minimum 2).
    pub fn with_slot_count(
        window_id: u64,
        slot_count: u32,
        allocator: Option<Arc<SharedMemoryAllocator>>,
    ) -> Self {
        Self {
            window_id,
            slot_count: slot_count.max(2),
            slot_size: 0,
            write_index: 0,
            read_index: 0,
            mode: AllocationMode::Exact,
            raw_frame_size: 0,
            backing: Backing::None,
            allocator,
        }
    }

    pub fn window_id(&self) -> u64 {
        self.window_id
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn mode(&self) -> AllocationMode {
        self.mode
    }

    pub fn write_index(&self) -> u32 {
        self.write_index
    }

    pub fn read_index(&self) -> u32 {
        self.read_index
    }

    /// Number of written-but-unread slots.
    pub fn pending(&self) -> u32 {
        (self.write_index + self.slot_count - self.read_index) % self.slot_count
    }

    /// True when the next write would collide with the read index.
    pub fn is_full(&self) -> bool {
        (self.write_index + 1) % self.slot_count == self.read_index
    }

    pub fn is_empty(&self) -> bool {
        self.write_index == self.read_index
    }

    /// Make sure the ring is sized for the given frame.
    ///
    /// `mode_for_new` is the policy applied if a (re)allocation happens;
    /// an existing placement keeps its own policy until then. On any
    /// change the caller must emit a `WindowBufferAllocated` notification
    /// before writing frame data: reallocation resets both indices and
    /// discards unread frames.
    pub fn ensure_allocated(
        &mut self,
        width: u32,
        height: u32,
        payload_size: usize,
        mode_for_new: AllocationMode,
    ) -> AllocationOutcome {
        let raw_size = width as usize * height as usize * 4;

        let needs_allocation = match &self.backing {
            Backing::None => true,
            _ => match self.mode {
                AllocationMode::Exact => raw_size != self.raw_frame_size,
                AllocationMode::Tranche => payload_size + SLOT_HEADER_SIZE > self.slot_size,
            },
        };
        if !needs_allocation {
            return AllocationOutcome::Unchanged;
        }

        let reallocation = !matches!(self.backing, Backing::None);
        if reallocation {
            debug!(
                "window {} buffer reallocating ({} unread frames discarded)",
                self.window_id,
                self.pending()
            );
        }
        self.release_backing();

        self.mode = mode_for_new;
        self.slot_size = match mode_for_new {
            AllocationMode::Exact => exact_slot_size(raw_size),
            AllocationMode::Tranche => tranche_slot_size(payload_size),
        };
        self.raw_frame_size = raw_size;
        self.write_index = 0;
        self.read_index = 0;

        let total = self.slot_size * self.slot_count as usize;
        self.backing = self.allocate_backing(total);

        if reallocation {
            AllocationOutcome::Reallocated
        } else {
            AllocationOutcome::Allocated
        }
    }

    fn allocate_backing(&self, total: usize) -> Backing {
        if let Some(allocator) = &self.allocator {
            if let Some(allocation) = allocator.allocate(total) {
                return Backing::Shared(allocation);
            }
            debug!(
                "shared allocation of {total} bytes failed for window {}, using private buffer",
                self.window_id
            );
        }
        Backing::Private(vec![0u8; total])
    }

    fn release_backing(&mut self) {
        match std::mem::replace(&mut self.backing, Backing::None) {
            Backing::Shared(allocation) => {
                if let Some(allocator) = &self.allocator {
                    allocator.free(allocation);
                }
            }
            Backing::Private(_) | Backing::None => {}
        }
    }

    /// Current placement for the allocation notification.
    pub fn placement(&self) -> BufferPlacement {
        let (offset, shared) = match &self.backing {
            Backing::Shared(allocation) => (allocation.offset(), true),
            _ => (0, false),
        };
        BufferPlacement {
            offset,
            uses_shared_memory: shared,
            buffer_size: (self.slot_size * self.slot_count as usize) as u64,
            slot_size: self.slot_size as u64,
            slot_count: self.slot_count,
        }
    }

    /// Write one frame (header + payload) into the next slot.
    ///
    /// Returns the slot index on success. Rejects, without blocking or
    /// overwriting, when the ring is full or the payload does not fit.
    pub fn write_frame(
        &mut self,
        header: &FrameSlotHeader,
        payload: &[u8],
    ) -> Result<u32, FrameWriteError> {
        if matches!(self.backing, Backing::None) {
            return Err(FrameWriteError::Unallocated);
        }
        if self.is_full() {
            return Err(FrameWriteError::BufferFull);
        }
        let capacity = self.slot_size - SLOT_HEADER_SIZE;
        if payload.len() > capacity {
            return Err(FrameWriteError::PayloadTooLarge {
                size: payload.len(),
                capacity,
            });
        }

        let index = self.write_index;
        let slot_size = self.slot_size;
        let slot = self.slot_mut(index);
        slot[..SLOT_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        slot[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        debug_assert!(payload.len() + SLOT_HEADER_SIZE <= slot_size);

        self.write_index = (self.write_index + 1) % self.slot_count;
        Ok(index)
    }

    /// Release the oldest unread slot. The sole mutator of `read_index`;
    /// a no-op when the ring is empty.
    pub fn advance_read_index(&mut self) {
        if !self.is_empty() {
            self.read_index = (self.read_index + 1) % self.slot_count;
        }
    }

    /// Contents of one slot (header + payload area).
    pub fn slot(&self, index: u32) -> Option<&[u8]> {
        if index >= self.slot_count {
            return None;
        }
        let start = index as usize * self.slot_size;
        match &self.backing {
            Backing::None => None,
            // SAFETY: the allocation covers slot_count * slot_size bytes
            // and is exclusively owned by this buffer.
            Backing::Shared(allocation) => Some(unsafe {
                std::slice::from_raw_parts(allocation.as_ptr().add(start), self.slot_size)
            }),
            Backing::Private(data) => Some(&data[start..start + self.slot_size]),
        }
    }

    fn slot_mut(&mut self, index: u32) -> &mut [u8] {
        let start = index as usize * self.slot_size;
        match &mut self.backing {
            Backing::None => unreachable!("write_frame checks backing first"),
            // SAFETY: same bounds as `slot`, single owner, &mut self.
            Backing::Shared(allocation) => unsafe {
                std::slice::from_raw_parts_mut(allocation.as_ptr().add(start), self.slot_size)
            },
            Backing::Private(data) => &mut data[start..start + self.slot_size],
        }
    }

    /// Return any shared backing to the allocator.
    pub fn dispose(&mut self) {
        self.release_backing();
        self.slot_size = 0;
        self.raw_frame_size = 0;
        self.write_index = 0;
        self.read_index = 0;
    }
}

impl Drop for WindowFrameBuffer {
    fn drop(&mut self) {
        self.release_backing();
    }
}

fn exact_slot_size(raw_size: usize) -> usize {
    // 25% headroom over the raw frame covers stride padding and the
    // occasional compressed payload larger than expected.
    SLOT_HEADER_SIZE + raw_size + raw_size / 4
}

fn tranche_slot_size(payload_size: usize) -> usize {
    let needed = payload_size + SLOT_HEADER_SIZE;
    TRANCHE_BUCKETS
        .iter()
        .copied()
        .find(|bucket| *bucket >= needed)
        .unwrap_or(TRANCHE_BUCKETS[TRANCHE_BUCKETS.len() - 1])
}
