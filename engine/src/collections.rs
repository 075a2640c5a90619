// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Containers backed by the engine allocator.

use crate::memory;

/// Growable array allocated from the engine heap, for engine types that own
/// a varying amount of children (entity properties, cell entities).
///
/// Growth doubles the capacity and moves the elements bitwise; a caller that
/// hands out pointers into the array (e.g. for asynchronous completion
/// callbacks) must [`reserve`](DynamicArray::reserve) the final capacity
/// first so the elements don't move underneath the pointers.
pub struct DynamicArray<T> {
    memory: *mut T,
    len: u32,
    capacity: u32,
}

// Safety: DynamicArray owns its elements exactly like a Vec does; the raw
// pointer is just storage.
unsafe impl<T: Send> Send for DynamicArray<T> {}
unsafe impl<T: Sync> Sync for DynamicArray<T> {}

impl<T> DynamicArray<T> {
    /// Creates an empty array. Doesn't allocate until the first push or
    /// reserve.
    pub const fn new() -> DynamicArray<T> {
        DynamicArray {
            memory: core::ptr::null_mut(),
            len: 0,
            capacity: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grows the backing allocation to hold at least `capacity` elements.
    /// Never shrinks.
    pub fn reserve(&mut self, capacity: u32) {
        assert!(size_of::<T>() != 0, "zero-sized elements aren't supported");
        if capacity <= self.capacity {
            return;
        }

        let new_memory =
            memory::allocate(capacity as usize * size_of::<T>(), align_of::<T>()) as *mut T;
        if !self.memory.is_null() {
            // A bitwise copy is a move to a new address, not a clone; the
            // old allocation is freed without dropping the elements.
            // Safety: both allocations are sized for at least `len`
            // elements and can't overlap, being distinct live allocations.
            unsafe {
                core::ptr::copy_nonoverlapping(self.memory, new_memory, self.len as usize);
            }
            memory::free(self.memory as *mut u8);
        }
        self.memory = new_memory;
        self.capacity = capacity;
    }

    /// Appends a value, growing if needed, and returns a borrow of the
    /// element in its slot.
    pub fn push(&mut self, value: T) -> &mut T {
        if self.len == self.capacity {
            self.reserve(if self.capacity == 0 {
                1
            } else {
                self.capacity * 2
            });
        }

        // Safety: len < capacity after the reserve above, so the slot is
        // within the allocation and uninitialized (or stale, post-clear).
        unsafe {
            let slot = self.memory.add(self.len as usize);
            slot.write(value);
            self.len += 1;
            &mut *slot
        }
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        // Safety: the first `len` elements are initialized, and the borrow
        // of self keeps them from moving or dropping.
        unsafe { core::slice::from_raw_parts(self.memory, self.len as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        // Safety: as in as_slice, with exclusivity from the &mut self.
        unsafe { core::slice::from_raw_parts_mut(self.memory, self.len as usize) }
    }

    /// Drops every element and frees the backing allocation.
    pub fn clear(&mut self) {
        for i in 0..self.len as usize {
            // Safety: the first `len` elements are initialized and dropped
            // exactly once, since len is reset below.
            unsafe { self.memory.add(i).drop_in_place() };
        }
        if !self.memory.is_null() {
            memory::free(self.memory as *mut u8);
        }
        self.memory = core::ptr::null_mut();
        self.len = 0;
        self.capacity = 0;
    }
}

impl<T> Drop for DynamicArray<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> Default for DynamicArray<T> {
    fn default() -> Self {
        DynamicArray::new()
    }
}
