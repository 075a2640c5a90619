// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Clean shutdown: kill_job_system joins every worker, including workers
//! that are asleep waiting for work. Its own binary because nothing can use
//! the job system after the kill.

use std::sync::atomic::{AtomicU32, Ordering};

use engine::jobs::{self, JobDesc, JobResult};
use platform_linux::NativePlatform;

#[test]
fn workers_join_on_kill() {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let platform = Box::leak(Box::new(NativePlatform::new()));
    jobs::init_job_system(platform);

    for _ in 0..100 {
        jobs::launch(JobDesc::new(|| {
            COUNTER.fetch_add(1, Ordering::AcqRel);
            JobResult::Complete
        }));
    }
    while COUNTER.load(Ordering::Acquire) != 100 {
        std::thread::yield_now();
    }

    // Workers are now idle (most of them asleep on their events); the kill
    // has to wake and join all of them.
    jobs::kill_job_system();
}
