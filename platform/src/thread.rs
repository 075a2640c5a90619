// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

#[allow(unused_imports)] // used in docs
use super::Platform;

/// The entry point of a thread spawned with [`Platform::spawn_thread`]. The
/// `usize` is the argument passed into the spawn call, typically an index
/// into some static table owned by the spawning system.
pub type ThreadEntry = fn(usize);

/// Platform-specific handle to a spawned thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    /// Creates a new [`ThreadHandle`]. Should only be created in the platform
    /// implementation.
    pub const fn new(id: u64) -> ThreadHandle {
        ThreadHandle(id)
    }

    /// The inner value passed into [`ThreadHandle::new`].
    pub const fn inner(self) -> u64 {
        self.0
    }
}

/// Platform-specific handle to an auto-reset event.
///
/// Events are plain copyable handles rather than owning objects so that they
/// can live inside the engine's statically allocated tables; the creating
/// system is responsible for pairing [`Platform::create_event`] with
/// [`Platform::destroy_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEvent(u64);

impl ThreadEvent {
    /// Creates a new [`ThreadEvent`]. Should only be created in the platform
    /// implementation.
    pub const fn new(id: u64) -> ThreadEvent {
        ThreadEvent(id)
    }

    /// The inner value passed into [`ThreadEvent::new`].
    pub const fn inner(self) -> u64 {
        self.0
    }
}
