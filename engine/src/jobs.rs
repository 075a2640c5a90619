// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Lock-free job system.
//!
//! Work is expressed as jobs: small copyable closures that run to completion
//! on one of the worker threads, at most one worker at a time. A job's
//! closure returns a [`JobResult`]: [`Complete`](JobResult::Complete) retires
//! the job (its handle becomes stale and anything waiting on it is signaled),
//! [`Sleep`](JobResult::Sleep) parks it instead, keeping the handle alive so
//! the job can be re-entered later, typically as a continuation of child jobs
//! it just launched. That sleep/continue pair is the only blocking primitive:
//! a job never waits inside its body.
//!
//! Jobs are pooled in a statically sized table and identified by
//! [`JobHandle`]s which embed the pool slot's generation, so a handle to a
//! retired job can be told apart from the slot's next tenant.
//!
//! ```no_run
//! use engine::jobs::{self, JobDesc, JobResult};
//! # fn example(platform: &'static dyn platform::Platform) {
//! jobs::init_job_system(platform);
//! let first = jobs::launch(JobDesc::new(|| JobResult::Complete));
//! let _second = jobs::continue_with(
//!     JobDesc::new(|| JobResult::Complete),
//!     &[first],
//! );
//! # }
//! ```

mod wait_list;
mod worker;

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use platform::Platform;

use crate::cell::SyncUnsafeCell;
use crate::sys;

/// Size of the inline closure storage of a job, in bytes. Closures that
/// don't fit should box their captures through the allocator and capture the
/// pointer instead.
pub const MAX_JOB_DATA_SIZE: usize = 64;
/// Alignment of the inline closure storage of a job.
pub const JOB_DATA_ALIGN: usize = 16;

/// Queue index meaning "any worker may run this job".
pub const ANY_QUEUE: u32 = u32::MAX;

const MAX_WORKERS: usize = 64;
const QUEUE_CAPACITY: usize = 1024;
const MAX_POOL_JOBS: usize = QUEUE_CAPACITY * MAX_WORKERS;

/// What a job's closure tells the worker to do with the job after returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    /// Retire the job: advance the slot generation, signal waiters, and
    /// return the slot to the pool.
    Complete,
    /// Keep the job's slot and handle alive without signaling waiters. The
    /// closure will run again when the job is re-enqueued, usually by a
    /// continuation the closure itself registered before returning.
    Sleep,
}

type JobFunc = fn(*mut u8) -> JobResult;

#[repr(align(16))]
#[derive(Clone, Copy)]
struct JobData([MaybeUninit<u8>; MAX_JOB_DATA_SIZE]);

impl JobData {
    const fn empty() -> JobData {
        JobData([MaybeUninit::uninit(); MAX_JOB_DATA_SIZE])
    }
}

/// A job waiting to be handed to [`launch`], [`reserve`] or
/// [`continue_with`]: the closure, erased into an inline byte buffer, plus
/// the queue the job is pinned to (if any).
pub struct JobDesc {
    data: JobData,
    func: JobFunc,
    queue_index: u32,
}

impl JobDesc {
    /// Wraps a closure into a job description.
    ///
    /// The closure must be `Copy` (it is memcpy'd into the job pool and
    /// never dropped) and fit [`MAX_JOB_DATA_SIZE`]/[`JOB_DATA_ALIGN`],
    /// which is checked at compile time.
    pub fn new<F>(function: F) -> JobDesc
    where
        F: FnMut() -> JobResult + Copy + Send + 'static,
    {
        const {
            assert!(
                size_of::<F>() <= MAX_JOB_DATA_SIZE,
                "job closure does not fit the inline payload, box its captures",
            );
            assert!(
                align_of::<F>() <= JOB_DATA_ALIGN,
                "job closure is over-aligned for the inline payload",
            );
        }

        fn trampoline<F: FnMut() -> JobResult>(data: *mut u8) -> JobResult {
            // Safety: `data` is the start of the inline buffer the closure
            // was written into below, and the pool slot is owned by the one
            // worker currently running the job.
            unsafe { (*(data as *mut F))() }
        }

        let mut data = JobData::empty();
        // Safety: the const asserts above guarantee the closure fits the
        // buffer, and the buffer's alignment covers the closure's.
        unsafe { (data.0.as_mut_ptr() as *mut F).write(function) };

        JobDesc {
            data,
            func: trampoline::<F>,
            queue_index: ANY_QUEUE,
        }
    }

    /// Pins the job to the worker queue at `queue_index` (modulo the worker
    /// count), e.g. to funnel all calls into a single-threaded API through
    /// one thread. Pinned jobs trade away parallelism; use sparingly.
    pub fn pinned(mut self, queue_index: u32) -> JobDesc {
        self.queue_index = queue_index;
        self
    }
}

/// Identifies a job: the pool slot index in the low half, the slot's
/// generation at the time the handle was made in the high half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobHandle(u64);

impl JobHandle {
    fn new(index: usize, generation: u32) -> JobHandle {
        JobHandle(((generation as u64) << 32) | index as u64)
    }

    fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// One pool slot. The function pointer doubles as the slot's ownership
/// marker: null means free, and the slot is taken by compare-exchanging a
/// job's trampoline over the null.
#[repr(align(64))]
struct Job {
    data: SyncUnsafeCell<JobData>,
    queue_index: SyncUnsafeCell<u32>,
    func: AtomicPtr<()>,
    generation: AtomicU32,
}

impl Job {
    const fn empty() -> Job {
        Job {
            data: SyncUnsafeCell::new(JobData::empty()),
            queue_index: SyncUnsafeCell::new(ANY_QUEUE),
            func: AtomicPtr::new(core::ptr::null_mut()),
            generation: AtomicU32::new(0),
        }
    }
}

static JOB_POOL: [Job; MAX_POOL_JOBS] = [const { Job::empty() }; MAX_POOL_JOBS];

/// Claims a pool slot for the description and fills it in. The payload and
/// queue index are only written after the compare exchange that makes the
/// slot ours.
fn take_job(desc: &JobDesc) -> usize {
    profiling::function_scope!();
    for (index, job) in JOB_POOL.iter().enumerate() {
        if job
            .func
            .compare_exchange(
                core::ptr::null_mut(),
                desc.func as *mut (),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            // Safety: the compare exchange above transferred the slot to us,
            // and nothing else touches the cells of a taken, un-enqueued job.
            unsafe {
                *job.data.get() = desc.data;
                *job.queue_index.get() = desc.queue_index;
            }
            return index;
        }
    }
    panic!("job pool exhausted");
}

/// Spawns the worker threads (one per logical processor, capped at the
/// worker table size) and installs `platform` as the process-wide platform
/// binding used by the engine's other subsystems.
///
/// Call once, before any allocator, job or asset call.
pub fn init_job_system(platform: &'static dyn Platform) {
    sys::install(platform);
    worker::start(platform);
}

/// Stops and joins every worker thread. In-flight queues should be drained
/// (all jobs completed) before calling this.
pub fn kill_job_system() {
    worker::stop();
}

/// Takes a pool slot for the job without enqueuing it, returning its handle.
///
/// This is the way to let a job's closure refer to its own handle: reserve
/// first, hand the handle to the closure's captures through a cell, then
/// [`launch_reserved`]. Storing the return value of [`launch`] instead would
/// race the job running (and completing) before the store.
pub fn reserve(desc: JobDesc) -> JobHandle {
    let index = take_job(&desc);
    let generation = JOB_POOL[index].generation.load(Ordering::Acquire);
    JobHandle::new(index, generation)
}

/// Takes a pool slot and immediately enqueues the job.
///
/// The handle's generation is sampled before the enqueue, so the returned
/// handle is valid even if the job runs and completes before this returns
/// (the handle is just stale then, like any handle to a completed job).
pub fn launch(desc: JobDesc) -> JobHandle {
    let index = take_job(&desc);
    let generation = JOB_POOL[index].generation.load(Ordering::Acquire);
    worker::commit_job(index);
    JobHandle::new(index, generation)
}

/// Enqueues a job previously taken with [`reserve`].
pub fn launch_reserved(handle: JobHandle) {
    let index = handle.index();
    assert_eq!(
        handle.generation(),
        JOB_POOL[index].generation.load(Ordering::Acquire),
        "launching a job that has already completed",
    );
    worker::commit_job(index);
}

/// Takes a pool slot for the job and enqueues it once every job in
/// `dependencies` has completed. Dependencies that have already completed
/// count immediately; an empty list enqueues the job right away.
pub fn continue_with(desc: JobDesc, dependencies: &[JobHandle]) -> JobHandle {
    let index = take_job(&desc);
    let generation = JOB_POOL[index].generation.load(Ordering::Acquire);
    wait_list::register(index, dependencies);
    JobHandle::new(index, generation)
}

/// Registers a job previously taken with [`reserve`] (or one that just put
/// itself to [`Sleep`](JobResult::Sleep)) to be enqueued once every job in
/// `dependencies` has completed.
pub fn continue_reserved(handle: JobHandle, dependencies: &[JobHandle]) {
    let index = handle.index();
    assert_eq!(
        handle.generation(),
        JOB_POOL[index].generation.load(Ordering::Acquire),
        "continuing a job that has already completed, did it sleep?",
    );
    wait_list::register(index, dependencies);
}
