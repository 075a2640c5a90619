// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Deterministic slab placement checks, isolated in their own binary so no
//! other allocation traffic shares the size classes under test.

mod common;

use engine::memory;

#[test]
fn freed_block_is_the_next_handed_out() {
    common::init();

    // 8 blocks per page for this class with 4 KiB pages.
    let block_size = 509;
    let count = 40;

    let mut blocks = Vec::new();
    for _ in 0..count {
        blocks.push(memory::allocate(block_size, 1));
    }

    // Freeing one block mid-page clears its page's "full" bit, so the next
    // allocation scan lands on that page and picks the freed slot, it being
    // the first cleared bit.
    let target = blocks[17];
    memory::free(target);
    let recycled = memory::allocate(block_size, 1);
    assert_eq!(target, recycled, "freed slot wasn't reused first");

    for block in blocks {
        memory::free(block);
    }
}

#[test]
fn one_size_class_per_size() {
    common::init();

    // Blocks of different sizes never share a page: each size class owns a
    // distinct reserved range.
    let a = memory::allocate(17, 1);
    let b = memory::allocate(18, 1);
    let page_size = 4096usize;
    assert_ne!(a as usize / page_size, b as usize / page_size);
    memory::free(a);
    memory::free(b);
}
