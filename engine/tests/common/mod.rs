// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Setup and helpers shared by the integration test binaries. Each binary is
//! its own process, so each gets its own platform, workers and asset root.

use std::sync::OnceLock;

use engine::jobs::{self, JobDesc, JobHandle, JobResult};
use platform::Platform;
use platform_linux::NativePlatform;

static PLATFORM: OnceLock<&'static NativePlatform> = OnceLock::new();

/// Installs the native platform and starts the job system, once per test
/// process.
pub fn init() -> &'static NativePlatform {
    PLATFORM.get_or_init(|| {
        let platform = Box::leak(Box::new(NativePlatform::new()));
        jobs::init_job_system(platform);
        platform
    })
}

/// Blocks the calling thread until `job` has completed, by parking on an
/// event that a continuation of the job signals.
#[allow(dead_code)]
pub fn wait_job(platform: &'static NativePlatform, job: JobHandle) {
    let event = platform.create_event();
    jobs::continue_with(
        JobDesc::new(move || {
            platform.signal_event(event);
            JobResult::Complete
        }),
        &[job],
    );
    platform.wait_event(event);
    platform.destroy_event(event);
}
