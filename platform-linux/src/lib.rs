// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Linux implementation of the engine's [`Platform`] trait.
//!
//! Virtual memory is backed by `mmap`/`mprotect`/`madvise`: a reservation is a
//! `PROT_NONE` mapping, committing flips the protection to read/write, and
//! decommitting drops the backing pages with `MADV_DONTNEED` before flipping
//! the protection back. Threads and events are std threads and a
//! mutex/condvar pair. Files are `std::fs` files, with read mappings done
//! through `mmap` on the file descriptor.

use std::{
    collections::HashMap,
    fmt::Arguments,
    fs::{self, File},
    io::{Seek, SeekFrom, Write},
    os::unix::fs::FileExt,
    os::unix::io::AsRawFd,
    ptr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    thread::JoinHandle,
};

use platform::{FileHandle, OpenOptions, Platform, ThreadEntry, ThreadEvent, ThreadHandle};

struct FileEntry {
    file: File,
    mapping: Option<(*mut u8, usize)>,
}

// Safety: the mapping pointer is only dereferenced by the engine, the entry
// just stores it for the unmap call.
unsafe impl Send for FileEntry {}

struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

/// [`Platform`] implementation for Linux.
pub struct NativePlatform {
    page_size: usize,
    next_id: AtomicU64,
    threads: Mutex<HashMap<u64, JoinHandle<()>>>,
    files: Mutex<HashMap<u64, FileEntry>>,
    large_mappings: Mutex<HashMap<usize, usize>>,
}

impl NativePlatform {
    /// Creates the platform. Queries the page size from the OS.
    pub fn new() -> NativePlatform {
        // Safety: sysconf is always safe to call.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(page_size > 0, "could not query the page size");
        NativePlatform {
            page_size: page_size as usize,
            next_id: AtomicU64::new(1),
            threads: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            large_mappings: Mutex::new(HashMap::new()),
        }
    }

    fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        NativePlatform::new()
    }
}

impl Platform for NativePlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve_pages(&self, page_count: usize) -> *mut u8 {
        let len = page_count * self.page_size;
        // Safety: anonymous mapping, no fd or address requirements to uphold.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    fn commit_pages(&self, pages: *mut u8, page_count: usize) {
        // Safety: the engine only commits inside ranges it has reserved.
        let result = unsafe {
            libc::mprotect(
                pages as *mut libc::c_void,
                page_count * self.page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        assert_eq!(0, result, "mprotect failed to commit pages");
    }

    fn decommit_pages(&self, pages: *mut u8, page_count: usize) {
        let len = page_count * self.page_size;
        // Safety: the engine only decommits inside ranges it has reserved.
        unsafe {
            libc::madvise(pages as *mut libc::c_void, len, libc::MADV_DONTNEED);
            libc::mprotect(pages as *mut libc::c_void, len, libc::PROT_NONE);
        }
    }

    fn release_pages(&self, pages: *mut u8, page_count: usize) {
        // Safety: only called with a pointer and count from reserve_pages.
        let result =
            unsafe { libc::munmap(pages as *mut libc::c_void, page_count * self.page_size) };
        assert_eq!(0, result, "munmap failed to release pages");
    }

    fn map_large(&self, size: usize) -> *mut u8 {
        // Safety: anonymous mapping, no fd or address requirements to uphold.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return ptr::null_mut();
        }
        self.large_mappings
            .lock()
            .unwrap()
            .insert(ptr as usize, size);
        ptr as *mut u8
    }

    fn unmap_large(&self, memory: *mut u8) {
        let size = self
            .large_mappings
            .lock()
            .unwrap()
            .remove(&(memory as usize))
            .expect("unmap_large called with a pointer that isn't a live large mapping");
        // Safety: the address and length come from the matching map_large.
        let result = unsafe { libc::munmap(memory as *mut libc::c_void, size) };
        assert_eq!(0, result, "munmap failed to unmap a large mapping");
    }

    fn processor_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn spawn_thread(&self, entry: ThreadEntry, argument: usize) -> ThreadHandle {
        let join_handle = std::thread::Builder::new()
            .name(format!("engine-worker-{argument}"))
            .spawn(move || entry(argument))
            .expect("failed to spawn a thread");
        let id = self.new_id();
        self.threads.lock().unwrap().insert(id, join_handle);
        ThreadHandle::new(id)
    }

    fn join_threads(&self, threads: &[ThreadHandle]) {
        for handle in threads {
            let join_handle = self.threads.lock().unwrap().remove(&handle.inner());
            if let Some(join_handle) = join_handle {
                join_handle.join().expect("worker thread panicked");
            }
        }
    }

    fn create_event(&self) -> ThreadEvent {
        let event = Box::new(Event {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        });
        ThreadEvent::new(Box::into_raw(event) as usize as u64)
    }

    fn destroy_event(&self, event: ThreadEvent) {
        // Safety: the pointer was created by Box::into_raw in create_event,
        // and the contract of destroy_event says nobody is waiting anymore.
        drop(unsafe { Box::from_raw(event.inner() as usize as *mut Event) });
    }

    fn signal_event(&self, event: ThreadEvent) {
        // Safety: valid until destroy_event per the trait contract.
        let event = unsafe { &*(event.inner() as usize as *const Event) };
        *event.signaled.lock().unwrap() = true;
        event.condvar.notify_one();
    }

    fn wait_event(&self, event: ThreadEvent) {
        // Safety: valid until destroy_event per the trait contract.
        let event = unsafe { &*(event.inner() as usize as *const Event) };
        let mut signaled = event.signaled.lock().unwrap();
        while !*signaled {
            signaled = event.condvar.wait(signaled).unwrap();
        }
        // Auto-reset: one wait consumes one signal.
        *signaled = false;
    }

    fn open_file(&self, path: &str, options: OpenOptions) -> Option<FileHandle> {
        let file = fs::OpenOptions::new()
            .read(options.contains(OpenOptions::READ))
            .write(options.contains(OpenOptions::WRITE))
            .create(options.contains(OpenOptions::CREATE))
            .truncate(options.contains(OpenOptions::OVERWRITE))
            .open(path)
            .ok()?;
        let id = self.new_id();
        self.files.lock().unwrap().insert(
            id,
            FileEntry {
                file,
                mapping: None,
            },
        );
        Some(FileHandle::new(id))
    }

    fn close_file(&self, file: FileHandle) {
        let entry = self.files.lock().unwrap().remove(&file.inner());
        let entry = entry.expect("close_file called with a closed or invalid handle");
        assert!(
            entry.mapping.is_none(),
            "close_file called while the file is still mapped",
        );
    }

    fn map_file(&self, file: FileHandle) -> *mut u8 {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(&file.inner())
            .expect("map_file called with a closed or invalid handle");
        let len = entry.file.metadata().map(|m| m.len()).unwrap_or(0) as usize;
        if len == 0 {
            return ptr::null_mut();
        }
        // Safety: mapping a valid fd, the fd outlives the mapping because the
        // trait requires unmap before close.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                entry.file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return ptr::null_mut();
        }
        entry.mapping = Some((ptr as *mut u8, len));
        ptr as *mut u8
    }

    fn unmap_file(&self, file: FileHandle) {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(&file.inner())
            .expect("unmap_file called with a closed or invalid handle");
        let (ptr, len) = entry
            .mapping
            .take()
            .expect("unmap_file called for a file that isn't mapped");
        // Safety: the address and length come from the matching map_file.
        let result = unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
        assert_eq!(0, result, "munmap failed to unmap a file");
    }

    fn append_file(&self, file: FileHandle, data: &[u8]) {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(&file.inner())
            .expect("append_file called with a closed or invalid handle");
        entry.file.seek(SeekFrom::End(0)).unwrap();
        entry.file.write_all(data).unwrap();
    }

    fn write_file(&self, file: FileHandle, data: &[u8], offset: u64) {
        let files = self.files.lock().unwrap();
        let entry = files
            .get(&file.inner())
            .expect("write_file called with a closed or invalid handle");
        entry.file.write_all_at(data, offset).unwrap();
    }

    fn file_size(&self, file: FileHandle) -> u64 {
        let files = self.files.lock().unwrap();
        let entry = files
            .get(&file.inner())
            .expect("file_size called with a closed or invalid handle");
        entry.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn file_exists(&self, path: &str) -> bool {
        fs::metadata(path).is_ok()
    }

    fn println(&self, message: Arguments) {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use platform::{OpenOptions, Platform};

    use super::NativePlatform;

    #[test]
    fn pages_round_trip() {
        let platform = NativePlatform::new();
        let page_size = platform.page_size();
        let pages = platform.reserve_pages(4);
        assert!(!pages.is_null());

        platform.commit_pages(pages, 2);
        // Safety: the first two pages are committed, so they're writable.
        unsafe {
            pages.write(123);
            pages.add(page_size * 2 - 1).write(45);
            assert_eq!(123, pages.read());
        }
        platform.decommit_pages(pages, 2);
        platform.release_pages(pages, 4);
    }

    #[test]
    fn events_remember_one_signal() {
        let platform = NativePlatform::new();
        let event = platform.create_event();
        platform.signal_event(event);
        // An auto-reset event holds the signal until someone waits on it.
        platform.wait_event(event);
        platform.destroy_event(event);
    }

    #[test]
    fn file_append_and_write_back() {
        let dir = std::env::temp_dir().join(format!("platform-linux-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("append.bin");
        let path = path.to_str().unwrap();

        let platform = NativePlatform::new();
        let options = OpenOptions::CREATE
            .and(OpenOptions::OVERWRITE)
            .and(OpenOptions::WRITE)
            .and(OpenOptions::READ);
        let file = platform.open_file(path, options).unwrap();
        platform.append_file(file, &[0, 0, 3, 4]);
        platform.write_file(file, &[1, 2], 0);
        assert_eq!(4, platform.file_size(file));

        let mapped = platform.map_file(file);
        assert!(!mapped.is_null());
        // Safety: the mapping covers the 4 bytes written above.
        let contents = unsafe { core::slice::from_raw_parts(mapped, 4) };
        assert_eq!(&[1, 2, 3, 4], contents);
        platform.unmap_file(file);
        platform.close_file(file);
    }
}
