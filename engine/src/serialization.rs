// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Binary streams for asset save and load.
//!
//! [`FileStream`] is a small buffered writer over the platform's append
//! primitive, with one extra trick for composite assets: [`FileStream::flush`]
//! returns the file size after the flush, which parent assets use as a patch
//! cursor to go back and fill in a child's byte size once it's known (see
//! the entity streamer).
//!
//! [`MemoryStream`] is a read cursor over a mapped asset file. It's `Copy`:
//! a parent hands each child a snapshot of the cursor and then skips over
//! the child's bytes with [`MemoryStream::advance`], so children can be
//! decoded later (or never) without the parent understanding their layout.

use bytemuck::Pod;
use platform::FileHandle;

use crate::sys;

const WRITE_BUFFER_SIZE: usize = 4096;

/// Buffered binary writer into a platform file.
pub struct FileStream {
    file: FileHandle,
    buffer: [u8; WRITE_BUFFER_SIZE],
    cursor: usize,
}

impl FileStream {
    /// Creates a stream appending to `file`, which should be opened for
    /// writing.
    pub fn new(file: FileHandle) -> FileStream {
        FileStream {
            file,
            buffer: [0; WRITE_BUFFER_SIZE],
            cursor: 0,
        }
    }

    /// The file this stream writes into. Used together with
    /// [`FileStream::flush`] for patch-ups of already-written bytes.
    pub fn file(&self) -> FileHandle {
        self.file
    }

    /// Writes raw bytes. Writes larger than the internal buffer bypass it
    /// and go straight to the file.
    pub fn write_bytes(&mut self, data: &[u8]) {
        if self.cursor + data.len() > WRITE_BUFFER_SIZE {
            self.flush();
        }

        if data.len() > WRITE_BUFFER_SIZE {
            sys::platform().append_file(self.file, data);
        } else {
            self.buffer[self.cursor..self.cursor + data.len()].copy_from_slice(data);
            self.cursor += data.len();
        }
    }

    /// Writes a plain value as its little-endian in-memory bytes.
    pub fn write<T: Pod>(&mut self, value: T) {
        self.write_bytes(bytemuck::bytes_of(&value));
    }

    /// Flushes the buffer to the file and returns the file's size after the
    /// flush, i.e. the offset the next written byte will land on.
    pub fn flush(&mut self) -> u32 {
        let platform = sys::platform();
        platform.append_file(self.file, &self.buffer[..self.cursor]);
        self.cursor = 0;
        platform.file_size(self.file) as u32
    }
}

/// Read cursor over memory-mapped bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStream {
    cursor: *const u8,
}

impl Default for MemoryStream {
    /// A null stream, the state of a load context before its file mapping
    /// job has run. See [`MemoryStream::is_valid`].
    fn default() -> MemoryStream {
        MemoryStream {
            cursor: core::ptr::null(),
        }
    }
}

impl MemoryStream {
    /// Creates a stream reading from `memory` onwards. The caller is
    /// responsible for the mapping outliving every read.
    pub fn new(memory: *const u8) -> MemoryStream {
        MemoryStream { cursor: memory }
    }

    /// True if this stream has been initialized with an actual mapping.
    pub fn is_valid(&self) -> bool {
        !self.cursor.is_null()
    }

    /// Reads a plain value from the cursor and advances past it. The read
    /// is unaligned; the on-disk layout owes nothing to alignment.
    pub fn read<T: Pod>(&mut self) -> T {
        // Safety: T is Pod, so any bit pattern is fine, and the caller's
        // mapping covers the read per MemoryStream::new's contract.
        let value = unsafe { (self.cursor as *const T).read_unaligned() };
        self.advance(size_of::<T>());
        value
    }

    /// Returns a pointer to the next `len` bytes and advances past them.
    pub fn read_bytes(&mut self, len: usize) -> *const u8 {
        let bytes = self.cursor;
        self.advance(len);
        bytes
    }

    /// Skips `len` bytes without reading them.
    pub fn advance(&mut self, len: usize) {
        // Safety: stays within the caller's mapping per the constructor
        // contract; one-past-the-end is fine for a cursor.
        self.cursor = unsafe { self.cursor.add(len) };
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStream;

    #[test]
    fn memory_stream_reads_sequentially_and_skips() {
        let bytes: [u8; 12] = [1, 0, 0, 0, 0xEE, 0xFF, 2, 0, 0, 0, 3, 4];

        let mut stream = MemoryStream::new(bytes.as_ptr());
        assert_eq!(1u32, stream.read());
        stream.advance(2);
        assert_eq!(2u32, stream.read());

        // A copy of the cursor reads the same bytes without moving the
        // original.
        let mut peek = stream;
        assert_eq!(3u8, peek.read());
        assert_eq!(3u8, stream.read());
        assert_eq!(4u8, stream.read());
    }

    #[test]
    fn unaligned_reads_are_fine() {
        let bytes: [u8; 6] = [0, 0x78, 0x56, 0x34, 0x12, 0];
        let mut stream = MemoryStream::new(bytes.as_ptr());
        stream.advance(1);
        assert_eq!(0x12345678u32, stream.read());
    }
}
