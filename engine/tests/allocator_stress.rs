// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Concurrency stress for the allocator: many threads hammering each tier at
//! once, with aliasing detection across every live allocation.

mod common;

use std::sync::Mutex;

use engine::memory;

/// Asserts that no two of the `(address, size)` spans overlap.
fn assert_no_aliasing(allocations: &mut Vec<(usize, usize)>) {
    allocations.sort_unstable();
    for window in allocations.windows(2) {
        let (a, size_a) = window[0];
        let (b, _) = window[1];
        assert!(
            a + size_a <= b,
            "allocations at {a:#x}+{size_a} and {b:#x} alias",
        );
    }
}

#[test]
fn concurrent_small_allocations_never_alias() {
    common::init();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 1250;

    let live = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        let live = &live;
        for thread_index in 0..THREADS {
            scope.spawn(move || {
                let mut local = Vec::new();
                for i in 0..PER_THREAD {
                    let size = 1 + (thread_index * PER_THREAD + i) % 512;
                    let memory = memory::allocate(size, 1);
                    // Touch the block so overlapping blocks would corrupt
                    // each other visibly.
                    // Safety: the block is live and `size` bytes big.
                    unsafe { memory.write_bytes(size as u8, size) };
                    local.push((memory as usize, size));
                }
                live.lock().unwrap().extend_from_slice(&local);
            });
        }
    });

    let mut allocations = live.into_inner().unwrap();
    assert_eq!(THREADS * PER_THREAD, allocations.len());
    assert_no_aliasing(&mut allocations);

    for &(address, _) in &allocations {
        memory::free(address as *mut u8);
    }
}

#[test]
fn concurrent_medium_allocations_never_alias() {
    common::init();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 1250;

    let live = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        let live = &live;
        for thread_index in 0..THREADS {
            scope.spawn(move || {
                let mut local = Vec::new();
                for i in 0..PER_THREAD {
                    let size = 513 + (thread_index * PER_THREAD + i) % 8192;
                    let memory = memory::allocate(size, 1);
                    // Safety: the block is live and `size` bytes big.
                    unsafe {
                        memory.write_bytes(0x5A, 1);
                        memory.add(size - 1).write_bytes(0x5A, 1);
                    }
                    local.push((memory as usize, size));
                }
                live.lock().unwrap().extend_from_slice(&local);
            });
        }
    });

    let mut allocations = live.into_inner().unwrap();
    assert_eq!(THREADS * PER_THREAD, allocations.len());
    assert_no_aliasing(&mut allocations);

    for &(address, _) in &allocations {
        memory::free(address as *mut u8);
    }
}

#[test]
fn concurrent_large_mappings_never_alias() {
    common::init();

    const THREADS: usize = 20;
    const SIZE: usize = 1024 * 1024 * 1024;

    let live = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        let live = &live;
        for _ in 0..THREADS {
            scope.spawn(move || {
                let memory = memory::allocate(SIZE, 1024);
                // Touch the first and last page; the mapping is lazy, so
                // this is cheap but proves the span is usable.
                // Safety: the mapping is live and SIZE bytes big.
                unsafe {
                    memory.write_bytes(1, 1);
                    memory.add(SIZE - 1).write_bytes(1, 1);
                }
                live.lock().unwrap().push((memory as usize, SIZE));
            });
        }
    });

    let mut allocations = live.into_inner().unwrap();
    assert_eq!(THREADS, allocations.len());
    assert_no_aliasing(&mut allocations);

    for &(address, _) in &allocations {
        memory::free(address as *mut u8);
    }
}

#[test]
fn mixed_tier_churn() {
    common::init();

    const THREADS: usize = 4;

    std::thread::scope(|scope| {
        for thread_index in 0..THREADS {
            scope.spawn(move || {
                for i in 0..2000usize {
                    let size = match i % 3 {
                        0 => 1 + (i + thread_index) % 512,
                        1 => 513 + i % 4096,
                        _ => 64 * 1024,
                    };
                    let memory = memory::allocate(size, 8);
                    assert_eq!(0, memory as usize % 8);
                    // Safety: the block is live and `size` bytes big.
                    unsafe { memory.write_bytes(i as u8, size.min(64)) };
                    memory::free(memory);
                }
            });
        }
    });
}
