// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The worker threads and their queues.
//!
//! Each worker owns a fixed ring of job pointers. The consumer side is
//! single-threaded: only the worker advances its consumer index, and it does
//! so without atomics on the index itself, after clearing the slot it just
//! ran. The producer side is shared: producers claim a slot by
//! compare-exchanging the producer index forward, publish the job pointer
//! into the claimed slot with a release store, and wake the worker's event.
//! A worker whose next slot is empty spins briefly (the producer may be
//! between the claim and the publish) and then sleeps on the event.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use platform::{Platform, ThreadEvent, ThreadHandle};

use arrayvec::ArrayVec;

use crate::cell::SyncUnsafeCell;
use crate::sys;

use super::{wait_list, Job, JobFunc, JobResult, ANY_QUEUE, JOB_POOL, MAX_WORKERS, QUEUE_CAPACITY};

struct JobQueue {
    slots: [AtomicPtr<Job>; QUEUE_CAPACITY],
    /// Where the next job pointer will be written. Advanced by producers
    /// with a compare exchange; claiming the old value claims the slot.
    producer: AtomicU32,
    /// Where the next job pointer will be read. Only the owning worker
    /// stores this, after clearing the slot.
    consumer: AtomicU32,
}

struct Worker {
    queue: JobQueue,
    alive: AtomicBool,
    event: SyncUnsafeCell<ThreadEvent>,
    thread: SyncUnsafeCell<ThreadHandle>,
}

impl Worker {
    const fn empty() -> Worker {
        Worker {
            queue: JobQueue {
                slots: [const { AtomicPtr::new(core::ptr::null_mut()) }; QUEUE_CAPACITY],
                producer: AtomicU32::new(0),
                consumer: AtomicU32::new(0),
            },
            alive: AtomicBool::new(false),
            event: SyncUnsafeCell::new(ThreadEvent::new(0)),
            thread: SyncUnsafeCell::new(ThreadHandle::new(0)),
        }
    }
}

static WORKERS: [Worker; MAX_WORKERS] = [const { Worker::empty() }; MAX_WORKERS];
static WORKER_COUNT: AtomicU32 = AtomicU32::new(0);
/// Round-robin cursor for unpinned jobs, shared by every producing thread.
static NEXT_WORKER: AtomicU32 = AtomicU32::new(0);

pub(super) fn start(platform: &'static dyn Platform) {
    let worker_count = platform.processor_count().clamp(1, MAX_WORKERS);
    for worker in WORKERS.iter().take(worker_count) {
        // Safety: workers are inert before WORKER_COUNT is published below,
        // so the cells aren't read by anyone yet. The event exists before
        // the worker thread that waits on it.
        unsafe { *worker.event.get() = platform.create_event() };
        worker.alive.store(true, Ordering::Release);
    }

    // Publish before spawning: a worker may immediately retire a job and
    // commit its waiters, which reads the count and the events.
    WORKER_COUNT.store(worker_count as u32, Ordering::Release);

    for (index, worker) in WORKERS.iter().take(worker_count).enumerate() {
        let thread = platform.spawn_thread(worker_entry, index);
        // Safety: only this initializing thread writes the cell, and it's
        // read after join_threads in stop(), which orders with the write.
        unsafe { *worker.thread.get() = thread };
    }
}

pub(super) fn stop() {
    let platform = sys::platform();
    let worker_count = WORKER_COUNT.load(Ordering::Acquire) as usize;

    let mut threads = ArrayVec::<ThreadHandle, MAX_WORKERS>::new();
    for worker in WORKERS.iter().take(worker_count) {
        worker.alive.store(false, Ordering::Release);
        // Safety: written in start(), stable since.
        threads.push(unsafe { *worker.thread.get() });
        platform.signal_event(unsafe { *worker.event.get() });
    }

    platform.join_threads(&threads);

    for worker in WORKERS.iter().take(worker_count) {
        // Safety: written in start(), stable since, and the worker that
        // waited on the event has exited.
        platform.destroy_event(unsafe { *worker.event.get() });
    }
}

/// Enqueues the pool job at `job_index` onto some worker's queue and wakes
/// that worker. Unpinned jobs round-robin across workers; pinned jobs map
/// their queue index onto the worker count. Full queues make the producer
/// move on to the next candidate (or spin, when pinned) until space appears.
pub(super) fn commit_job(job_index: usize) {
    profiling::function_scope!();
    let worker_count = WORKER_COUNT.load(Ordering::Acquire) as usize;
    assert!(worker_count > 0, "job system is not initialized");

    // Safety: a committed job's queue index was written before the job was
    // handed out by take_job, and doesn't change while the job is live.
    let queue_index = unsafe { *JOB_POOL[job_index].queue_index.get() };

    loop {
        let worker_index = if queue_index == ANY_QUEUE {
            NEXT_WORKER.fetch_add(1, Ordering::Relaxed) as usize % worker_count
        } else {
            queue_index as usize % worker_count
        };
        let queue = &WORKERS[worker_index].queue;

        // 1. Claim a slot by advancing the producer index. Stop trying on
        //    this queue when the slot after the claim would run into the
        //    consumer, i.e. the queue is full.
        let mut producer = queue.producer.load(Ordering::Acquire);
        let mut next_producer = (producer + 1) % QUEUE_CAPACITY as u32;
        while next_producer != queue.consumer.load(Ordering::Acquire) {
            match queue.producer.compare_exchange(
                producer,
                next_producer,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // 2. The slot at the old producer index is ours. The
                    //    worker saw the slot as null when it last passed it
                    //    (it cleared it), so the store can't stomp a live
                    //    job.
                    let slot = &queue.slots[producer as usize];
                    debug_assert!(slot.load(Ordering::Relaxed).is_null());

                    let job = &JOB_POOL[job_index] as *const Job as *mut Job;
                    // 3. Publish with release: the payload writes in
                    //    take_job happen-before the worker's acquire load of
                    //    the slot.
                    slot.store(job, Ordering::Release);

                    // 4. Wake the worker if it went to sleep waiting for
                    //    this slot.
                    // Safety: the event was created before WORKER_COUNT was
                    // published, which this thread acquire-loaded above.
                    let event = unsafe { *WORKERS[worker_index].event.get() };
                    sys::platform().signal_event(event);
                    return;
                }
                Err(current) => {
                    producer = current;
                    next_producer = (producer + 1) % QUEUE_CAPACITY as u32;
                }
            }
        }

        // Queue full; try the next worker (pinned jobs retry the same one
        // until its worker drains something).
        core::hint::spin_loop();
    }
}

fn worker_entry(worker_index: usize) {
    let worker = &WORKERS[worker_index];
    let queue = &worker.queue;
    let platform = sys::platform();

    // The consumer index is owned by this thread; the local copy is the
    // authoritative one and the atomic is just its published value.
    let mut consumer = queue.consumer.load(Ordering::Relaxed) as usize;

    loop {
        // Wait for a job to appear in our slot. The event covers the gap
        // where a producer has claimed the slot but not yet published the
        // pointer: the publish is followed by a signal, so the worst case is
        // one wait per publish, not a missed job.
        while queue.slots[consumer].load(Ordering::Acquire).is_null()
            && worker.alive.load(Ordering::Acquire)
        {
            let mut woke_early = false;
            for _ in 0..32 {
                if !queue.slots[consumer].load(Ordering::Acquire).is_null()
                    || !worker.alive.load(Ordering::Acquire)
                {
                    woke_early = true;
                    break;
                }
                core::hint::spin_loop();
            }
            if woke_early {
                break;
            }

            // Safety: the event cell is written before this thread spawns.
            let event = unsafe { *worker.event.get() };
            platform.wait_event(event);
        }

        if !worker.alive.load(Ordering::Acquire) {
            return;
        }

        let job = queue.slots[consumer].load(Ordering::Acquire);
        let result = run_job(job);

        // Clear the slot with a release store before advancing the consumer
        // index, so a producer that sees the advanced index also sees the
        // null and can assert it isn't stomping anything.
        queue.slots[consumer].store(core::ptr::null_mut(), Ordering::Release);
        consumer = (consumer + 1) % QUEUE_CAPACITY;
        queue.consumer.store(consumer as u32, Ordering::Release);

        // A sleeping job keeps its pool slot and its waiters; nothing more
        // to do for it. It may well already be queued again on another
        // worker by a continuation it registered inside its closure.
        if result == JobResult::Complete {
            retire_job(job);
        }
    }
}

fn run_job(job: *mut Job) -> JobResult {
    profiling::function_scope!();
    // Safety: the job was published to exactly one queue slot, so this
    // worker is the only thread running it, and the pool slot (func and
    // data) is live until the job completes.
    unsafe {
        let func: JobFunc = core::mem::transmute((*job).func.load(Ordering::Relaxed));
        func((*(*job).data.get()).0.as_mut_ptr() as *mut u8)
    }
}

/// Retires a completed job: advances the generation, frees the pool slot,
/// and signals jobs that were waiting on this generation.
fn retire_job(job: *mut Job) {
    // Any published job pointer is into JOB_POOL, so this recovers its slot.
    let job_index = (job as usize - JOB_POOL.as_ptr() as usize) / size_of::<Job>();
    let job = &JOB_POOL[job_index];

    let generation = job.generation.load(Ordering::Relaxed);
    job.generation.store(generation.wrapping_add(1), Ordering::Relaxed);
    // The release on the func store publishes the generation increment: if
    // it didn't, the slot could be re-taken and a handle made with the old
    // generation.
    job.func.store(core::ptr::null_mut(), Ordering::Release);

    wait_list::signal_completion(job_index, generation);
}
