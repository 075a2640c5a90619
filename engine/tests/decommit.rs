// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Verifies that emptied slab pages and coalesced buddy blocks actually get
//! decommitted: after a warmed-up allocate/free burst, the net committed
//! page count returns to its pre-burst level. Runs alone in its own binary
//! with a counting platform wrapper, so no other traffic skews the balance.

use std::collections::HashSet;
use std::fmt::Arguments;
use std::sync::{Mutex, OnceLock};

use engine::{jobs, memory};
use platform::{FileHandle, OpenOptions, Platform, ThreadEntry, ThreadEvent, ThreadHandle};
use platform_linux::NativePlatform;

/// Forwards everything to the native platform, tracking which pages are
/// currently committed. Tracked as a set rather than a counter because the
/// allocator is allowed to re-commit an already-committed page (it's a
/// no-op), and only state transitions matter here.
struct CountingPlatform {
    inner: NativePlatform,
    committed: Mutex<HashSet<usize>>,
}

impl CountingPlatform {
    fn new() -> CountingPlatform {
        CountingPlatform {
            inner: NativePlatform::new(),
            committed: Mutex::new(HashSet::new()),
        }
    }

    fn net_committed(&self) -> usize {
        self.committed.lock().unwrap().len()
    }
}

impl Platform for CountingPlatform {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }
    fn reserve_pages(&self, page_count: usize) -> *mut u8 {
        self.inner.reserve_pages(page_count)
    }
    fn commit_pages(&self, pages: *mut u8, page_count: usize) {
        let mut committed = self.committed.lock().unwrap();
        for page in 0..page_count {
            committed.insert(pages as usize + page * self.inner.page_size());
        }
        drop(committed);
        self.inner.commit_pages(pages, page_count);
    }
    fn decommit_pages(&self, pages: *mut u8, page_count: usize) {
        let mut committed = self.committed.lock().unwrap();
        for page in 0..page_count {
            committed.remove(&(pages as usize + page * self.inner.page_size()));
        }
        drop(committed);
        self.inner.decommit_pages(pages, page_count);
    }
    fn release_pages(&self, pages: *mut u8, page_count: usize) {
        self.inner.release_pages(pages, page_count);
    }
    fn map_large(&self, size: usize) -> *mut u8 {
        self.inner.map_large(size)
    }
    fn unmap_large(&self, memory: *mut u8) {
        self.inner.unmap_large(memory);
    }
    fn processor_count(&self) -> usize {
        self.inner.processor_count()
    }
    fn spawn_thread(&self, entry: ThreadEntry, argument: usize) -> ThreadHandle {
        self.inner.spawn_thread(entry, argument)
    }
    fn join_threads(&self, threads: &[ThreadHandle]) {
        self.inner.join_threads(threads);
    }
    fn create_event(&self) -> ThreadEvent {
        self.inner.create_event()
    }
    fn destroy_event(&self, event: ThreadEvent) {
        self.inner.destroy_event(event);
    }
    fn signal_event(&self, event: ThreadEvent) {
        self.inner.signal_event(event);
    }
    fn wait_event(&self, event: ThreadEvent) {
        self.inner.wait_event(event);
    }
    fn open_file(&self, path: &str, options: OpenOptions) -> Option<FileHandle> {
        self.inner.open_file(path, options)
    }
    fn close_file(&self, file: FileHandle) {
        self.inner.close_file(file);
    }
    fn map_file(&self, file: FileHandle) -> *mut u8 {
        self.inner.map_file(file)
    }
    fn unmap_file(&self, file: FileHandle) {
        self.inner.unmap_file(file);
    }
    fn append_file(&self, file: FileHandle, data: &[u8]) {
        self.inner.append_file(file, data);
    }
    fn write_file(&self, file: FileHandle, data: &[u8], offset: u64) {
        self.inner.write_file(file, data, offset);
    }
    fn file_size(&self, file: FileHandle) -> u64 {
        self.inner.file_size(file)
    }
    fn file_exists(&self, path: &str) -> bool {
        self.inner.file_exists(path)
    }
    fn println(&self, message: Arguments) {
        self.inner.println(message);
    }
}

static PLATFORM: OnceLock<&'static CountingPlatform> = OnceLock::new();

#[test]
fn emptied_pages_are_decommitted() {
    let platform = *PLATFORM.get_or_init(|| Box::leak(Box::new(CountingPlatform::new())));
    jobs::init_job_system(platform);

    // Warmup: initialize the size class and the buddy directory, so their
    // persistent commits (header page, chunk bookkeeping) are part of the
    // baseline instead of the measurement.
    let warm_small = memory::allocate(333, 1);
    let warm_medium = memory::allocate(4096, 1);
    memory::free(warm_small);
    memory::free(warm_medium);

    let baseline = platform.net_committed();

    let mut blocks = Vec::new();
    for _ in 0..200 {
        blocks.push(memory::allocate(333, 1));
    }
    for _ in 0..50 {
        blocks.push(memory::allocate(8192, 8));
    }
    assert!(
        platform.net_committed() > baseline,
        "the burst should have committed data pages",
    );

    for block in blocks {
        memory::free(block);
    }

    assert_eq!(
        baseline,
        platform.net_committed(),
        "freeing everything should decommit every data page",
    );
}
