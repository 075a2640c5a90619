// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! FIXME: Use core::cell::SyncUnsafeCell instead when it's stabilized.
//! Tracked in the rust-lang issue
//! [#95439](https://github.com/rust-lang/rust/issues/95439).

#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);

unsafe impl<T: ?Sized + Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        SyncUnsafeCell(core::cell::UnsafeCell::new(value))
    }

    #[inline]
    pub const fn get(&self) -> *mut T {
        self.0.get()
    }
}
