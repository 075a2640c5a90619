// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-wide binding to the platform implementation.
//!
//! The allocator, the job system and the asset layer all live in static
//! tables, so they can't carry a platform borrow around in their state the
//! way an owning object would. Instead [`jobs::init_job_system`] installs the
//! platform here once, and the rest of the engine reads it back through
//! [`platform()`].
//!
//! [`jobs::init_job_system`]: crate::jobs::init_job_system

use core::sync::atomic::{AtomicU32, Ordering};

use platform::Platform;

use crate::cell::SyncUnsafeCell;

const EMPTY: u32 = 0;
const INSTALLING: u32 = 1;
const READY: u32 = 2;

static STATE: AtomicU32 = AtomicU32::new(EMPTY);
static PLATFORM: SyncUnsafeCell<Option<&'static dyn Platform>> = SyncUnsafeCell::new(None);

/// Installs the process-wide platform. The first caller wins; later calls
/// (e.g. repeated init calls in tests) keep the original binding.
pub(crate) fn install(platform: &'static dyn Platform) {
    if STATE
        .compare_exchange(EMPTY, INSTALLING, Ordering::Acquire, Ordering::Acquire)
        .is_ok()
    {
        // Safety: the compare exchange above elects exactly one installing
        // thread, and readers don't touch the cell until STATE is READY.
        unsafe { *PLATFORM.get() = Some(platform) };
        STATE.store(READY, Ordering::Release);
    } else {
        // Another thread is installing or has installed; wait until the
        // binding is readable so the caller can rely on platform() after
        // this function returns.
        while STATE.load(Ordering::Acquire) != READY {
            core::hint::spin_loop();
        }
    }
}

/// Returns the installed platform. Panics if nothing has been installed;
/// [`init_job_system`](crate::jobs::init_job_system) has to run first.
pub(crate) fn platform() -> &'static dyn Platform {
    assert_eq!(
        READY,
        STATE.load(Ordering::Acquire),
        "platform is not installed, call init_job_system first",
    );
    // Safety: READY is stored with release ordering after the cell is
    // written, and the write is never repeated, so the read can't race.
    unsafe { *PLATFORM.get() }.unwrap()
}
