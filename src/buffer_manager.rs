// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Ownership of per-window frame buffers.
//!
//! One [`WindowFrameBuffer`] exists per live window id. The manager
//! creates buffers lazily on first frame, reclaims them when windows
//! vanish, and applies the configured allocation policy to future
//! (re)allocations. The map lock is held only for the duration of a
//! single operation and never across blocking I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::frame_buffer::{
    AllocationMode, AllocationOutcome, BufferPlacement, FrameWriteError, WindowFrameBuffer,
};
use crate::protocol::FrameSlotHeader;
use crate::shmem::SharedMemoryAllocator;

/// Tracks and owns every window's ring buffer.
pub struct BufferManager {
    buffers: Mutex<HashMap<u64, WindowFrameBuffer>>,
    allocator: Option<Arc<SharedMemoryAllocator>>,
    mode: Mutex<AllocationMode>,
    slot_count: u32,
}

impl BufferManager {
    pub fn new(
        allocator: Option<Arc<SharedMemoryAllocator>>,
        mode: AllocationMode,
        slot_count: u32,
    ) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            allocator,
            mode: Mutex::new(mode),
            slot_count,
        }
    }

    /// True when buffers are carved from the shared region.
    pub fn uses_shared_memory(&self) -> bool {
        self.allocator.is_some()
    }

    /// Policy applied to future allocations. Existing buffers keep their
    /// policy until their own next reallocation.
    pub fn update_buffer_mode(&self, mode: AllocationMode) {
        let mut current = self.mode.lock().unwrap();
        if *current != mode {
            info!("buffer allocation mode changed to {mode:?} for future allocations");
            *current = mode;
        }
    }

    pub fn buffer_mode(&self) -> AllocationMode {
        *self.mode.lock().unwrap()
    }

    /// Make sure `window_id` has a buffer sized for the given frame,
    /// creating it on first use (idempotent per window).
    ///
    /// Returns the allocation outcome plus the resulting placement so the
    /// caller can emit a `WindowBufferAllocated` notification before
    /// writing any frame data into a changed placement.
    pub fn ensure_allocated(
        &self,
        window_id: u64,
        width: u32,
        height: u32,
        payload_size: usize,
    ) -> (AllocationOutcome, BufferPlacement) {
        let mode = self.buffer_mode();
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers.entry(window_id).or_insert_with(|| {
            debug!("creating frame buffer for window {window_id}");
            WindowFrameBuffer::with_slot_count(window_id, self.slot_count, self.allocator.clone())
        });
        let outcome = buffer.ensure_allocated(width, height, payload_size, mode);
        (outcome, buffer.placement())
    }

    /// Write a frame into the window's ring.
    pub fn write_frame(
        &self,
        window_id: u64,
        header: &FrameSlotHeader,
        payload: &[u8],
    ) -> Result<u32, FrameWriteError> {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers
            .get_mut(&window_id)
            .ok_or(FrameWriteError::Unallocated)?;
        buffer.write_frame(header, payload)
    }

    /// Release the oldest unread slot of a window's ring.
    pub fn advance_read_index(&self, window_id: u64) {
        if let Some(buffer) = self.buffers.lock().unwrap().get_mut(&window_id) {
            buffer.advance_read_index();
        }
    }

    /// Number of written-but-unread slots, or `None` for untracked ids.
    pub fn pending_frames(&self, window_id: u64) -> Option<u32> {
        self.buffers
            .lock()
            .unwrap()
            .get(&window_id)
            .map(|b| b.pending())
    }

    /// Dispose of a window's buffer, returning its shared allocation to
    /// the allocator. Safe to call for ids that were never created.
    pub fn remove_buffer(&self, window_id: u64) -> bool {
        let removed = self.buffers.lock().unwrap().remove(&window_id);
        match removed {
            Some(mut buffer) => {
                buffer.dispose();
                debug!("removed frame buffer for window {window_id}");
                true
            }
            None => false,
        }
    }

    /// Dispose of every buffer whose window id is absent from `active`.
    ///
    /// The sole reclaim path for windows that disappeared without an
    /// explicit removal event. Returns the number of buffers removed.
    pub fn cleanup_stale_buffers(&self, active: &HashSet<u64>) -> usize {
        let mut buffers = self.buffers.lock().unwrap();
        let stale: Vec<u64> = buffers
            .keys()
            .copied()
            .filter(|id| !active.contains(id))
            .collect();
        for id in &stale {
            if let Some(mut buffer) = buffers.remove(id) {
                buffer.dispose();
            }
        }
        if !stale.is_empty() {
            debug!("reclaimed {} stale window buffer(s)", stale.len());
        }
        stale.len()
    }

    /// Ids of currently tracked windows.
    pub fn tracked_windows(&self) -> Vec<u64> {
        self.buffers.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PixelFormat, SlotFlags, DEFAULT_SLOT_COUNT};
    use crate::shmem::{SharedMemoryConfig, REGION_RESERVED};
    use std::sync::atomic::{AtomicU32, Ordering};

    static REGION_SEQ: AtomicU32 = AtomicU32::new(0);

    fn shared_allocator(size: usize) -> Arc<SharedMemoryAllocator> {
        let seq = REGION_SEQ.fetch_add(1, Ordering::Relaxed);
        let config = SharedMemoryConfig {
            path: std::env::temp_dir().join(format!(
                "winrun-bufmgr-test-{}-{seq}",
                std::process::id()
            )),
            minimum_size: size,
            create: true,
        };
        Arc::new(SharedMemoryAllocator::initialize(&config).expect("map test region"))
    }

    fn header(window_id: u64, payload_len: usize) -> FrameSlotHeader {
        FrameSlotHeader {
            window_id,
            frame_number: 1,
            width: 16,
            height: 16,
            stride: 64,
            pixel_format: PixelFormat::Bgra32,
            data_size: payload_len as u32,
            flags: SlotFlags::KEY_FRAME,
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let manager = BufferManager::new(None, AllocationMode::Exact, DEFAULT_SLOT_COUNT);
        let (first, placement_a) = manager.ensure_allocated(1, 320, 200, 320 * 200 * 4);
        assert_eq!(first, AllocationOutcome::Allocated);
        let (second, placement_b) = manager.ensure_allocated(1, 320, 200, 320 * 200 * 4);
        assert_eq!(second, AllocationOutcome::Unchanged);
        assert_eq!(placement_a, placement_b);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn remove_is_safe_for_unknown_windows() {
        let manager = BufferManager::new(None, AllocationMode::Exact, DEFAULT_SLOT_COUNT);
        assert!(!manager.remove_buffer(42));
        manager.ensure_allocated(42, 64, 64, 64 * 64 * 4);
        assert!(manager.remove_buffer(42));
        assert!(manager.is_empty());
    }

    #[test]
    fn cleanup_returns_shared_allocation_for_reuse() {
        let allocator = shared_allocator(16 * 1024 * 1024);
        let manager = BufferManager::new(
            Some(allocator.clone()),
            AllocationMode::Exact,
            DEFAULT_SLOT_COUNT,
        );

        let (outcome, placement) = manager.ensure_allocated(7, 320, 200, 320 * 200 * 4);
        assert!(outcome.changed());
        assert!(placement.uses_shared_memory);
        let used_with_buffer = allocator.used_size();
        assert!(used_with_buffer > 0);

        // Two pending unread frames when the window vanishes.
        let payload = vec![0u8; 1024];
        manager.write_frame(7, &header(7, payload.len()), &payload).unwrap();
        manager.write_frame(7, &header(7, payload.len()), &payload).unwrap();
        assert_eq!(manager.pending_frames(7), Some(2));

        let removed = manager.cleanup_stale_buffers(&HashSet::new());
        assert_eq!(removed, 1);
        assert_eq!(allocator.used_size(), 0);

        // The same-size allocation succeeds again without growing usage.
        let (outcome, _) = manager.ensure_allocated(8, 320, 200, 320 * 200 * 4);
        assert_eq!(outcome, AllocationOutcome::Allocated);
        assert_eq!(allocator.used_size(), used_with_buffer);
        assert!(allocator.used_size() + allocator.available_size()
            == allocator.total_size() - REGION_RESERVED);
    }

    #[test]
    fn cleanup_keeps_active_windows() {
        let manager = BufferManager::new(None, AllocationMode::Exact, DEFAULT_SLOT_COUNT);
        manager.ensure_allocated(1, 64, 64, 64 * 64 * 4);
        manager.ensure_allocated(2, 64, 64, 64 * 64 * 4);
        let active: HashSet<u64> = [1u64].into_iter().collect();
        assert_eq!(manager.cleanup_stale_buffers(&active), 1);
        assert_eq!(manager.tracked_windows(), vec![1]);
    }

    #[test]
    fn mode_change_applies_to_future_allocations_only() {
        let manager = BufferManager::new(None, AllocationMode::Exact, DEFAULT_SLOT_COUNT);
        manager.ensure_allocated(1, 320, 200, 64 * 1024);

        manager.update_buffer_mode(AllocationMode::Tranche);

        // Existing buffer keeps its exact-mode placement until its own
        // next reallocation...
        let (outcome, _) = manager.ensure_allocated(1, 320, 200, 64 * 1024);
        assert_eq!(outcome, AllocationOutcome::Unchanged);

        // ...a resize reallocates under the new policy.
        let (outcome, placement) = manager.ensure_allocated(1, 640, 400, 64 * 1024);
        assert_eq!(outcome, AllocationOutcome::Reallocated);
        assert_eq!(placement.slot_size as usize, crate::frame_buffer::TRANCHE_BUCKETS[0]);

        // New windows allocate under the new policy immediately.
        let (_, placement) = manager.ensure_allocated(2, 320, 200, 64 * 1024);
        assert_eq!(placement.slot_size as usize, crate::frame_buffer::TRANCHE_BUCKETS[0]);
    }

    #[test]
    fn write_without_buffer_is_rejected() {
        let manager = BufferManager::new(None, AllocationMode::Exact, DEFAULT_SLOT_COUNT);
        assert_eq!(
            manager.write_frame(9, &header(9, 4), &[0u8; 4]),
            Err(FrameWriteError::Unallocated)
        );
    }
}
