// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The small-allocation path: one slab per block size from 1 to 512 bytes.
//!
//! Each size class owns a single committed *header page* and a reserved run
//! of `page_size * 8` memory pages. Bit `i` of the header is set when page
//! `i` is fully allocated. Each in-use page starts with its own bitmap, one
//! bit per block, followed by the blocks themselves. Pages are committed on
//! first use and decommitted once their last block is freed, so an idle size
//! class costs nothing but address space.
//!
//! The header scan runs without any lock; only the mutation of a particular
//! page takes the page's stripe lock. There are 64 stripes per class, page
//! `i` maps to stripe `i % 64`, which lines the stripes up with the 64-bit
//! header words.

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::sys;

use super::SMALL_MEMORY_BOUNDARY;

const LOCK_COUNT: usize = 64;

/// The lazy-init election sentinel: stored into `PageTable::pages` by the
/// thread that wins the right to reserve the class's memory, so other
/// threads know to spin instead of racing the reservation.
const INITIALIZING: usize = 0x1;

struct PageTable {
    locked_pages: [AtomicU32; LOCK_COUNT],
    /// One committed page; bit per page of `pages`, set = page is full.
    header: AtomicPtr<u8>,
    /// `page_size * 8` reserved pages, committed individually as needed.
    pages: AtomicPtr<u8>,
}

impl PageTable {
    const fn new() -> PageTable {
        PageTable {
            locked_pages: [const { AtomicU32::new(0) }; LOCK_COUNT],
            header: AtomicPtr::new(core::ptr::null_mut()),
            pages: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

static PAGE_TABLES: [PageTable; SMALL_MEMORY_BOUNDARY] =
    [const { PageTable::new() }; SMALL_MEMORY_BOUNDARY];

/// Bytes of address space reserved for one size class's page array.
fn class_range_size() -> usize {
    let page_size = sys::platform().page_size();
    page_size * 8 * page_size
}

/// Byte offset of block 0 in a page: past the page's bitmap, rounded up to
/// a whole 64-bit word so the bitmap's atomic word accesses never overlap
/// block bytes, then aligned to the largest power of two dividing the block
/// size, so every block satisfies any alignment the size class can be asked
/// for (the routing in [`super::allocate`] pads sizes to a multiple of the
/// requested alignment).
fn first_block_offset(block_count: usize, block_size: usize) -> usize {
    let bitmap_bytes = block_count.div_ceil(8).next_multiple_of(8);
    let block_alignment = 1 << block_size.trailing_zeros();
    bitmap_bytes.next_multiple_of(block_alignment)
}

/// Blocks that fit in one page of this size class: one bitmap bit plus
/// `block_size` bytes per block, minus whatever the bitmap padding of
/// [`first_block_offset`] costs.
fn class_block_count(block_size: usize) -> usize {
    let page_size = sys::platform().page_size();
    let mut count = page_size * 8 / (1 + block_size * 8);
    while first_block_offset(count, block_size) + count * block_size > page_size {
        count -= 1;
    }
    count
}

/// Returns the class's page array, reserving it (and the header page) on the
/// first call for this class. One thread is elected by the sentinel compare
/// exchange; the rest spin until the winner publishes the pointer.
fn class_pages(table: &PageTable) -> *mut u8 {
    let pages = table.pages.load(Ordering::Acquire);
    if pages.is_null()
        && table
            .pages
            .compare_exchange(
                core::ptr::null_mut(),
                INITIALIZING as *mut u8,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_ok()
    {
        let platform = sys::platform();
        let header = platform.reserve_pages(1);
        assert!(!header.is_null(), "failed to reserve a slab header page");
        platform.commit_pages(header, 1);
        table.header.store(header, Ordering::Relaxed);

        let page_count = platform.page_size() * 8;
        let pages = platform.reserve_pages(page_count);
        assert!(!pages.is_null(), "failed to reserve a slab page array");
        // The release makes the header store above visible to anyone who
        // acquire-loads the pages pointer.
        table.pages.store(pages, Ordering::Release);
        return pages;
    }

    loop {
        let pages = table.pages.load(Ordering::Acquire);
        if pages as usize > INITIALIZING {
            return pages;
        }
        core::hint::spin_loop();
    }
}

/// Treats `bits` as an array of 64-bit words and returns a borrow of word
/// `index`.
///
/// ### Safety
///
/// `bits` must point to committed memory of at least `(index + 1) * 8` bytes,
/// aligned to 8 bytes.
unsafe fn bitmap_word(bits: *mut u8, index: usize) -> &'static AtomicU64 {
    unsafe { &*(bits as *const AtomicU64).add(index) }
}

/// Finds the first cleared bit in `[start_bit, bit_count)`, scanning whole
/// words. `start_bit` is rounded down to a word boundary, like the stripe
/// locks it cooperates with.
unsafe fn find_cleared_bit(bits: *mut u8, bit_count: usize, start_bit: usize) -> Option<usize> {
    let word_count = bit_count.div_ceil(64);
    for word_index in start_bit / 64..word_count {
        let value = unsafe { bitmap_word(bits, word_index) }.load(Ordering::Relaxed);
        let remaining = bit_count - word_index * 64;
        let mask = if remaining < 64 {
            (1u64 << remaining) - 1
        } else {
            u64::MAX
        };
        let cleared = !value & mask;
        if cleared != 0 {
            return Some(word_index * 64 + cleared.trailing_zeros() as usize);
        }
    }
    None
}

unsafe fn all_bits_set(bits: *mut u8, bit_count: usize) -> bool {
    unsafe { find_cleared_bit(bits, bit_count, 0) }.is_none()
}

unsafe fn all_bits_clear(bits: *mut u8, bit_count: usize) -> bool {
    let word_count = bit_count.div_ceil(64);
    for word_index in 0..word_count {
        let value = unsafe { bitmap_word(bits, word_index) }.load(Ordering::Relaxed);
        let remaining = bit_count - word_index * 64;
        let mask = if remaining < 64 {
            (1u64 << remaining) - 1
        } else {
            u64::MAX
        };
        if value & mask != 0 {
            return false;
        }
    }
    true
}

unsafe fn set_bit(bits: *mut u8, index: usize) {
    unsafe { bitmap_word(bits, index / 64) }.fetch_or(1 << (index % 64), Ordering::Relaxed);
}

unsafe fn clear_bit(bits: *mut u8, index: usize) {
    unsafe { bitmap_word(bits, index / 64) }.fetch_and(!(1 << (index % 64)), Ordering::Relaxed);
}

/// Address of block `slot` in `page`; see [`first_block_offset`] for the
/// layout.
fn block_address(page: *mut u8, block_size: usize, block_count: usize, slot: usize) -> *mut u8 {
    let page_size = sys::platform().page_size();
    let offset = first_block_offset(block_count, block_size) + slot * block_size;
    assert!(
        offset + block_size <= page_size,
        "slab block address past the end of its page",
    );
    // Safety: offset is within the page per the assert above.
    unsafe { page.add(offset) }
}

pub(super) fn allocate(block_size: usize) -> *mut u8 {
    profiling::function_scope!();
    let table = &PAGE_TABLES[block_size - 1];
    let pages = class_pages(table);
    let header = table.header.load(Ordering::Relaxed);

    let platform = sys::platform();
    let page_size = platform.page_size();
    let page_count = page_size * 8;
    let block_count = class_block_count(block_size);

    loop {
        // Lock-free scan for a page with free blocks, then take its stripe
        // lock. On lock contention, skip ahead to the next header word (the
        // stripes are word-aligned, so the neighbouring bits would just
        // contend on the same lock), wrapping to the start at the end.
        let mut start_bit = 0;
        let (page_index, lock_index) = loop {
            // Safety: the header page is committed for the class's lifetime.
            let found = unsafe { find_cleared_bit(header, page_count, start_bit) };
            let Some(page_index) = found else {
                assert!(start_bit != 0, "out of memory pages in a slab size class");
                start_bit = 0;
                continue;
            };

            let lock_index = page_index % LOCK_COUNT;
            if table.locked_pages[lock_index]
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break (page_index, lock_index);
            }

            start_bit = (page_index & !63) + 64;
            if start_bit >= page_count {
                start_bit = 0;
            }
        };

        // The page could have filled up between the scan and the lock; the
        // header bit is stable under the stripe lock, so re-check it.
        // Safety: header is committed.
        let now_full = unsafe { bitmap_word(header, page_index / 64) }.load(Ordering::Relaxed)
            & (1 << (page_index % 64))
            != 0;
        if now_full {
            table.locked_pages[lock_index].store(0, Ordering::Release);
            continue;
        }

        // Safety: page_index < page_count, so this stays in the reservation.
        let page = unsafe { pages.add(page_size * page_index) };
        // No-op if the page is already committed; a fresh commit hands us a
        // zeroed bitmap, which reads as an empty page.
        platform.commit_pages(page, 1);

        // Safety: the page is committed and its bitmap is owned by the
        // stripe lock held above.
        let slot = unsafe { find_cleared_bit(page, block_count, 0) }
            .expect("slab page with a cleared header bit has no free blocks");
        unsafe { set_bit(page, slot) };
        if unsafe { all_bits_set(page, block_count) } {
            unsafe { set_bit(header, page_index) };
        }

        let memory = block_address(page, block_size, block_count, slot);

        table.locked_pages[lock_index].store(0, Ordering::Release);
        return memory;
    }
}

/// Frees the block if it belongs to a slab range. Returns false if the
/// address isn't in any class, so the caller can try the next strategy.
pub(super) fn free(memory: *mut u8) -> bool {
    profiling::function_scope!();
    let address = memory as usize;
    let range_size = class_range_size();

    let mut class_index = None;
    for (i, table) in PAGE_TABLES.iter().enumerate() {
        let pages = table.pages.load(Ordering::Acquire) as usize;
        if pages > INITIALIZING && address >= pages && address < pages + range_size {
            class_index = Some(i);
            break;
        }
    }
    let Some(class_index) = class_index else {
        return false;
    };

    let platform = sys::platform();
    let page_size = platform.page_size();
    let table = &PAGE_TABLES[class_index];
    let block_size = class_index + 1;
    let block_count = class_block_count(block_size);

    let pages = table.pages.load(Ordering::Acquire);
    let page_index = (address - pages as usize) / page_size;
    let lock_index = page_index % LOCK_COUNT;
    while table.locked_pages[lock_index]
        .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }

    // Safety: page_index is within the reservation because the address range
    // check above passed.
    let page = unsafe { pages.add(page_index * page_size) };
    let first_block = block_address(page, block_size, block_count, 0);
    let slot = (address - first_block as usize) / block_size;
    // Safety: the page's bitmap is owned by the stripe lock held above.
    unsafe { clear_bit(page, slot) };
    if unsafe { all_bits_clear(page, block_count) } {
        platform.decommit_pages(page, 1);
    }

    let header = table.header.load(Ordering::Relaxed);
    // Safety: header is committed.
    unsafe { clear_bit(header, page_index) };

    table.locked_pages[lock_index].store(0, Ordering::Release);
    true
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use crate::test_support;

    #[test]
    fn fills_pages_without_duplicates() {
        test_support::init();

        // Enough to span several pages: 8 blocks per page with 4 KiB pages.
        let block_size = 509;
        let count = 40;

        let mut blocks = Vec::new();
        for _ in 0..count {
            blocks.push(super::allocate(block_size));
        }
        let mut sorted = blocks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(count, sorted.len(), "slab handed out a duplicate block");

        for &block in &blocks {
            super::free(block);
        }
    }

    #[test]
    fn foreign_pointers_are_not_slab_frees() {
        test_support::init();

        let mut on_stack = 0u8;
        assert!(!super::free(&mut on_stack));
    }
}
