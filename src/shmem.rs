// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared memory region and free-list allocator.
//!
//! The guest maps one fixed-size region (IVSHMEM-style file) and carves
//! per-window frame buffers out of it. The host maps the same region
//! independently and reconstructs buffer placement purely from the
//! offsets carried in `WindowBufferAllocated` notifications, so all
//! addressing here is offset-based.
//!
//! The first 4 KiB are reserved and hold the region header; the free
//! list covers the rest. Allocation is first-fit with 64-byte alignment
//! and never blocks or grows the region. Adjacent free ranges are
//! coalesced on free.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

use log::{debug, warn};
use memmap2::MmapMut;

use crate::protocol::{RegionHeader, PROTOCOL_VERSION, REGION_HEADER_SIZE};

/// Reserved block at the start of the region (holds the 64-byte header).
pub const REGION_RESERVED: usize = 4096;

/// Allocation granularity; requests round up to this alignment.
pub const ALLOC_ALIGNMENT: usize = 64;

/// Configuration for the shared region backing file.
#[derive(Debug, Clone)]
pub struct SharedMemoryConfig {
    /// Path to the shared memory device or file
    pub path: PathBuf,
    /// Minimum usable region size in bytes
    pub minimum_size: usize,
    /// Create (and size) the file if missing; otherwise an existing
    /// region is required
    pub create: bool,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/shm/winrun-frames"),
            minimum_size: 256 * 1024 * 1024,
            create: true,
        }
    }
}

/// A byte range carved out of the shared region.
///
/// Owned by exactly one per-window frame buffer at a time; returned to
/// the allocator's free list on reallocation or window removal.
#[derive(Debug)]
pub struct SharedAllocation {
    offset: u64,
    size: usize,
    ptr: NonNull<u8>,
}

// SAFETY: the pointer targets the mapped region, which outlives every
// allocation (buffers hold an Arc to the allocator), and each range has a
// single owner.
unsafe impl Send for SharedAllocation {}

impl SharedAllocation {
    /// Offset of this range within the region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of this range in bytes (after alignment rounding).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw pointer to the start of the range.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: u64,
    size: usize,
}

#[derive(Debug)]
struct FreeState {
    /// Free ranges ordered by offset; never overlapping.
    ranges: Vec<FreeRange>,
    /// Bytes currently handed out.
    used: usize,
}

/// Free-list allocator over one mapped shared memory region.
pub struct SharedMemoryAllocator {
    base: NonNull<u8>,
    len: usize,
    state: Mutex<FreeState>,
    /// Keeps the mapping alive; the base pointer stays valid while this
    /// field is held.
    _mmap: MmapMut,
}

// SAFETY: all mutation of the region goes through `SharedAllocation`
// ranges with single owners or through the header stamp at init; the
// free list itself is mutex-protected.
unsafe impl Send for SharedMemoryAllocator {}
unsafe impl Sync for SharedMemoryAllocator {}

impl SharedMemoryAllocator {
    /// Map the region described by `config`.
    ///
    /// Fails closed: a missing, undersized, or unmappable region logs a
    /// warning and returns `None`, and callers fall back to private heap
    /// allocation.
    pub fn initialize(config: &SharedMemoryConfig) -> Option<Self> {
        match Self::try_initialize(config) {
            Ok(allocator) => {
                debug!(
                    "shared region mapped: {} ({} bytes, {} usable)",
                    config.path.display(),
                    allocator.len,
                    allocator.len - REGION_RESERVED
                );
                Some(allocator)
            }
            Err(e) => {
                warn!(
                    "shared memory unavailable at {} ({e}), using private buffers",
                    config.path.display()
                );
                None
            }
        }
    }

    fn try_initialize(config: &SharedMemoryConfig) -> io::Result<Self> {
        if config.minimum_size < REGION_RESERVED * 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("minimum size {} is too small", config.minimum_size),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.create)
            .open(&config.path)?;

        let existing = file.metadata()?.len() as usize;
        if config.create {
            if existing < config.minimum_size {
                file.set_len(config.minimum_size as u64)?;
            }
        } else if existing < config.minimum_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "region is {existing} bytes, need at least {}",
                    config.minimum_size
                ),
            ));
        }

        let len = file.metadata()?.len() as usize;
        // SAFETY: the file is exclusively owned by this agent for writing;
        // the host maps it read-only.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        if config.create {
            let header = RegionHeader {
                version: PROTOCOL_VERSION,
                total_size: len as u64,
                ..Default::default()
            };
            mmap[..REGION_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        } else if RegionHeader::from_bytes(&mmap[..REGION_HEADER_SIZE]).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region header magic/version mismatch",
            ));
        }

        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mapping returned null"))?;

        Ok(Self {
            base,
            len,
            state: Mutex::new(FreeState {
                ranges: vec![FreeRange {
                    offset: REGION_RESERVED as u64,
                    size: len - REGION_RESERVED,
                }],
                used: 0,
            }),
            _mmap: mmap,
        })
    }

    /// Allocate a zero-filled range of at least `size` bytes.
    ///
    /// First-fit over the free list; the chosen block is split when
    /// oversized. Returns `None` when no block fits; never blocks and
    /// never grows the region.
    pub fn allocate(&self, size: usize) -> Option<SharedAllocation> {
        if size == 0 {
            return None;
        }
        let aligned = align_up(size, ALLOC_ALIGNMENT);

        let offset = {
            let mut state = self.state.lock().unwrap();
            let index = state.ranges.iter().position(|r| r.size >= aligned)?;
            let range = &mut state.ranges[index];
            let offset = range.offset;
            if range.size == aligned {
                state.ranges.remove(index);
            } else {
                range.offset += aligned as u64;
                range.size -= aligned;
            }
            state.used += aligned;
            offset
        };

        // SAFETY: the range was just removed from the free list, so no
        // other allocation aliases it; offset + aligned <= len by the
        // free-list invariant.
        let ptr = unsafe {
            let p = self.base.as_ptr().add(offset as usize);
            std::ptr::write_bytes(p, 0, aligned);
            NonNull::new_unchecked(p)
        };

        Some(SharedAllocation {
            offset,
            size: aligned,
            ptr,
        })
    }

    /// Return a range to the free list, merging with adjacent free
    /// ranges.
    pub fn free(&self, allocation: SharedAllocation) {
        let mut state = self.state.lock().unwrap();
        state.used = state.used.saturating_sub(allocation.size);

        let index = state
            .ranges
            .partition_point(|r| r.offset < allocation.offset);
        state.ranges.insert(
            index,
            FreeRange {
                offset: allocation.offset,
                size: allocation.size,
            },
        );

        // Merge with the following range, then the preceding one.
        if index + 1 < state.ranges.len() {
            let next = state.ranges[index + 1];
            let current = &mut state.ranges[index];
            if current.offset + current.size as u64 == next.offset {
                current.size += next.size;
                state.ranges.remove(index + 1);
            }
        }
        if index > 0 {
            let current = state.ranges[index];
            let prev = &mut state.ranges[index - 1];
            if prev.offset + prev.size as u64 == current.offset {
                prev.size += current.size;
                state.ranges.remove(index);
            }
        }
    }

    /// Translate a region offset into an absolute pointer.
    pub fn offset_to_pointer(&self, offset: u64) -> Option<*mut u8> {
        if (offset as usize) < self.len {
            // SAFETY: bounds-checked against the mapping length.
            Some(unsafe { self.base.as_ptr().add(offset as usize) })
        } else {
            None
        }
    }

    /// Translate an absolute pointer back into a region offset.
    pub fn pointer_to_offset(&self, ptr: *const u8) -> Option<u64> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        if addr >= base && addr < base + self.len {
            Some((addr - base) as u64)
        } else {
            None
        }
    }

    /// Total size of the mapped region.
    pub fn total_size(&self) -> usize {
        self.len
    }

    /// Bytes currently handed out to live allocations.
    pub fn used_size(&self) -> usize {
        self.state.lock().unwrap().used
    }

    /// Bytes available for allocation.
    pub fn available_size(&self) -> usize {
        self.state.lock().unwrap().ranges.iter().map(|r| r.size).sum()
    }

    /// Number of discrete free ranges (fragmentation indicator).
    pub fn free_range_count(&self) -> usize {
        self.state.lock().unwrap().ranges.len()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
