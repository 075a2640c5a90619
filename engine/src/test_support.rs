// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared setup for the unit tests: the engine's subsystems are process-wide,
//! so the whole test binary shares one platform and one set of workers.

use std::boxed::Box;
use std::sync::OnceLock;

use platform_linux::NativePlatform;

static PLATFORM: OnceLock<&'static NativePlatform> = OnceLock::new();

/// Installs the native platform and starts the job system, once per test
/// process. Safe to call from every test.
pub fn init() -> &'static NativePlatform {
    PLATFORM.get_or_init(|| {
        let platform = Box::leak(Box::new(NativePlatform::new()));
        crate::jobs::init_job_system(platform);
        platform
    })
}
