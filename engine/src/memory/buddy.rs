// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The medium-allocation path: a buddy allocator over 4 MiB chunks.
//!
//! Each chunk reserves a contiguous 4 MiB span and tracks it as blocks of
//! `1024 * 2^layer` bytes, identified by `{layer, index}` where the byte
//! offset is `block size * index`. Allocation bisects the smallest
//! sufficient free block down to the requested layer; freeing pushes the
//! block back and then repeatedly merges it with its buddy (same layer,
//! index pair differing in the lowest bit) back into parent blocks. Only the
//! pages spanning the caller's requested size are committed, so the padding
//! up to the block's power-of-two size costs address space, not memory.
//!
//! A single spin lock serializes each chunk; allocations skip to the next
//! chunk on contention, frees have to wait for the chunk that owns the
//! address.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::sys;

use super::SMALL_MEMORY_BOUNDARY;

const MAX_BLOCK_COUNT: usize = 4096;
const SMALLEST_BLOCK_SIZE: usize = SMALL_MEMORY_BOUNDARY * 2;
const CHUNK_SIZE: usize = MAX_BLOCK_COUNT * SMALLEST_BLOCK_SIZE;
/// Largest block size served by the buddy allocator: half a chunk, so a
/// chunk never degenerates into a single allocation.
pub(super) const MEDIUM_MEMORY_BOUNDARY: usize = CHUNK_SIZE / 2;
const CHUNK_COUNT: usize = 1024;

/// See [`super::slab`]; same election sentinel, this time for the chunk
/// directory pointer.
const INITIALIZING: usize = 0x1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct BuddyBlock {
    /// Index in units of this block's own size; up to `MAX_BLOCK_COUNT` at
    /// the bottom layer.
    index: u16,
    layer: u8,
}

#[repr(C)]
struct BuddyChunk {
    /// Null until the chunk's span is reserved under its lock. Atomic
    /// because the free path range-checks chunks it hasn't locked.
    memory: AtomicPtr<u8>,
    allocated: [BuddyBlock; MAX_BLOCK_COUNT],
    free: [BuddyBlock; MAX_BLOCK_COUNT],
    allocated_count: u32,
    free_count: u32,
    locked: AtomicU32,
}

/// The chunk directory: `CHUNK_COUNT` chunks worth of bookkeeping, living in
/// pages committed on first use so the zeroed bookkeeping doesn't sit in the
/// binary.
static CHUNKS: AtomicPtr<BuddyChunk> = AtomicPtr::new(core::ptr::null_mut());

fn chunk_directory() -> *mut BuddyChunk {
    let chunks = CHUNKS.load(Ordering::Acquire);
    if chunks.is_null()
        && CHUNKS
            .compare_exchange(
                core::ptr::null_mut(),
                INITIALIZING as *mut BuddyChunk,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_ok()
    {
        let platform = sys::platform();
        let directory_bytes = size_of::<BuddyChunk>() * CHUNK_COUNT;
        let page_count = directory_bytes.div_ceil(platform.page_size());
        let chunks = platform.reserve_pages(page_count);
        assert!(!chunks.is_null(), "failed to reserve the buddy directory");
        platform.commit_pages(chunks, page_count);
        // Freshly committed pages are zeroed: null memory pointers, zero
        // counts, unlocked locks. Exactly an empty directory.
        let chunks = chunks as *mut BuddyChunk;
        CHUNKS.store(chunks, Ordering::Release);
        return chunks;
    }

    loop {
        let chunks = CHUNKS.load(Ordering::Acquire);
        if chunks as usize > INITIALIZING {
            return chunks;
        }
        core::hint::spin_loop();
    }
}

fn layer_size(layer: u8) -> usize {
    SMALLEST_BLOCK_SIZE << layer
}

fn layer_for_size(size: usize) -> u8 {
    let mut layer = (size.ilog2() - SMALLEST_BLOCK_SIZE.ilog2()) as u8;
    if layer_size(layer) < size {
        layer += 1;
    }
    layer
}

fn top_layer() -> u8 {
    layer_for_size(CHUNK_SIZE)
}

/// The first layer whose blocks are whole pages, i.e. safe to decommit
/// without touching a neighbouring block's memory.
fn page_layer() -> u8 {
    layer_for_size(sys::platform().page_size())
}

/// Decommits the pages spanning a block. Only called for blocks of
/// [`page_layer`] or above, whose offsets are always page-aligned.
///
/// ### Safety
///
/// The chunk's lock must be held and the block must be free in it.
unsafe fn decommit_block(chunk: *mut BuddyChunk, block: BuddyBlock) {
    let platform = sys::platform();
    let page_size = platform.page_size();
    let size = layer_size(block.layer);
    let address =
        unsafe { (*chunk).memory.load(Ordering::Relaxed) as usize } + size * block.index as usize;
    debug_assert_eq!(0, address % page_size);
    platform.decommit_pages(address as *mut u8, size / page_size);
}

pub(super) fn allocate(block_size: usize) -> *mut u8 {
    profiling::function_scope!();
    let chunks = chunk_directory();
    let platform = sys::platform();
    let page_size = platform.page_size();
    let requested_layer = layer_for_size(block_size);

    let mut chunk_index = 0;
    while chunk_index < CHUNK_COUNT {
        // Safety: chunk_index < CHUNK_COUNT keeps this inside the directory.
        let chunk = unsafe { chunks.add(chunk_index) };
        // Safety: `locked` is an atomic; borrowing it shared is always fine.
        let lock = unsafe { &(*chunk).locked };
        if lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Contended chunks are skipped instead of stalling here while
            // the holder splits blocks; wrap around rather than giving up,
            // a locked chunk may free up space.
            if chunk_index == CHUNK_COUNT - 1 {
                chunk_index = 0;
            } else {
                chunk_index += 1;
            }
            continue;
        }

        // The rest of the chunk is owned by the lock. All field accesses
        // below go through the raw pointer under that ownership.
        unsafe {
            if (*chunk).memory.load(Ordering::Relaxed).is_null() {
                (*chunk).free[0] = BuddyBlock {
                    index: 0,
                    layer: top_layer(),
                };
                (*chunk).free_count = 1;
                let memory = platform.reserve_pages(CHUNK_SIZE / page_size);
                assert!(!memory.is_null(), "failed to reserve a buddy chunk");
                // Release so the free path's unlocked range check only sees
                // the span after the free list above is in place.
                (*chunk).memory.store(memory, Ordering::Release);
            }

            // Smallest free block that can hold the request.
            let mut closest: Option<usize> = None;
            let mut closest_layer = u8::MAX;
            for i in 0..(*chunk).free_count as usize {
                let block = (*chunk).free[i];
                if block.layer >= requested_layer && block.layer < closest_layer {
                    closest_layer = block.layer;
                    closest = Some(i);
                }
            }

            if let Some(mut block_index) = closest {
                let mut block = (*chunk).free[block_index];

                // Bisect down to the requested layer, keeping the lower
                // half and leaving the new siblings in the free list.
                while block.layer > requested_layer {
                    let free_count = (*chunk).free_count as usize;
                    (*chunk).free[block_index] = (*chunk).free[free_count - 1];
                    (*chunk).free_count -= 1;

                    let free_count = (*chunk).free_count as usize;
                    (*chunk).free[free_count] = BuddyBlock {
                        index: block.index * 2,
                        layer: block.layer - 1,
                    };
                    (*chunk).free[free_count + 1] = BuddyBlock {
                        index: block.index * 2 + 1,
                        layer: block.layer - 1,
                    };
                    block_index = free_count;
                    block = (*chunk).free[free_count];
                    (*chunk).free_count += 2;
                }

                let free_count = (*chunk).free_count as usize;
                (*chunk).free[block_index] = (*chunk).free[free_count - 1];
                (*chunk).free_count -= 1;

                let allocated_count = (*chunk).allocated_count as usize;
                (*chunk).allocated[allocated_count] = block;
                (*chunk).allocated_count += 1;

                let offset = layer_size(block.layer) * block.index as usize;
                let address = (*chunk).memory.load(Ordering::Relaxed) as usize + offset;

                // Commit only what the caller asked for, from the
                // containing page boundary; the rest of the block's
                // power-of-two padding stays uncommitted.
                let aligned_address = address / page_size * page_size;
                let commit_pages = block_size.div_ceil(page_size);
                platform.commit_pages(aligned_address as *mut u8, commit_pages);

                lock.store(0, Ordering::Release);
                return address as *mut u8;
            }
        }

        lock.store(0, Ordering::Release);
        chunk_index += 1;
    }

    panic!("out of buddy chunks");
}

/// Frees the block if it belongs to a buddy chunk. Returns false if the
/// address isn't in any chunk, so the caller can try the next strategy.
pub(super) fn free(memory: *mut u8) -> bool {
    profiling::function_scope!();
    let chunks = CHUNKS.load(Ordering::Acquire);
    if chunks as usize <= INITIALIZING {
        return false;
    }

    let address = memory as usize;
    let mut owner = None;
    for chunk_index in 0..CHUNK_COUNT {
        // Safety: chunk_index < CHUNK_COUNT keeps this inside the directory.
        let chunk = unsafe { chunks.add(chunk_index) };
        // The span pointer only ever changes from null to its final value,
        // and a chunk can't own `address` before setting it, so an unlocked
        // acquire load is enough for the range check.
        let span = unsafe { &(*chunk).memory }.load(Ordering::Acquire) as usize;
        if span != 0 && address >= span && address < span + CHUNK_SIZE {
            owner = Some(chunk);
            break;
        }
    }
    let Some(chunk) = owner else {
        return false;
    };

    // Safety: `locked` is an atomic; borrowing it shared is always fine.
    let lock = unsafe { &(*chunk).locked };
    while lock
        .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }

    // Chunk owned by the lock from here on.
    unsafe {
        let offset = address - (*chunk).memory.load(Ordering::Relaxed) as usize;

        let mut found = None;
        for i in 0..(*chunk).allocated_count as usize {
            let block = (*chunk).allocated[i];
            if layer_size(block.layer) * block.index as usize == offset {
                found = Some(i);
                break;
            }
        }
        let block_index = found.expect("freeing an address no buddy block starts at");

        let mut block = (*chunk).allocated[block_index];
        let allocated_count = (*chunk).allocated_count as usize;
        (*chunk).allocated[block_index] = (*chunk).allocated[allocated_count - 1];
        (*chunk).allocated_count -= 1;

        let free_count = (*chunk).free_count as usize;
        (*chunk).free[free_count] = block;
        (*chunk).free_count += 1;

        if block.layer >= page_layer() {
            decommit_block(chunk, block);
        }

        // Coalesce: while the block's buddy is also free, replace the pair
        // with their parent. The block itself is always the last entry of
        // the free list here, so the scan stops before it.
        let mut merged = true;
        while merged {
            merged = false;

            let scan_end = (*chunk).free_count as usize - 1;
            let pair_index = block.index & !1;
            for i in 0..scan_end {
                let other = (*chunk).free[i];
                if other.layer == block.layer && other.index & !1 == pair_index {
                    // The last element is the block we're merging; pull the
                    // second-to-last over the buddy and drop both.
                    (*chunk).free[i] = (*chunk).free[(*chunk).free_count as usize - 2];
                    (*chunk).free_count -= 2;

                    block = BuddyBlock {
                        index: pair_index / 2,
                        layer: block.layer + 1,
                    };
                    let free_count = (*chunk).free_count as usize;
                    (*chunk).free[free_count] = block;
                    (*chunk).free_count += 1;

                    if block.layer >= page_layer() {
                        decommit_block(chunk, block);
                    }

                    merged = true;
                    break;
                }
            }
        }
    }

    lock.store(0, Ordering::Release);
    true
}
