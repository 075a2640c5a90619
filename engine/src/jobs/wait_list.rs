// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The dependency wait list.
//!
//! A job waiting on N dependencies claims a *wait counter* and sets it to
//! N + 1. Each completing dependency decrements it once; the decrement that
//! brings it to 1 (never 0: the +1 guard absorbs the registration window)
//! enqueues the waiting job and returns the counter to the pool. Each
//! dependency slot in the pool carries up to [`MAX_JOB_WAITERS`] *waiter
//! tokens*, packing the dependency's expected generation (+1, so a zero
//! token means "empty"), the wait counter index, and the waiting job's pool
//! index into one 64-bit word that can be claimed and cleared with compare
//! exchanges.
//!
//! Registration order matters: the token is published to the dependency's
//! waiter list *before* re-checking whether the dependency already
//! completed. With that order, a dependency completing concurrently either
//! sees the token (and decrements), or has already advanced its generation
//! (and the re-check decrements); either way exactly one decrement happens
//! and no wake is dropped.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{worker, JobHandle, JOB_POOL, MAX_POOL_JOBS};

const MAX_WAIT_COUNTS: usize = 1 << 16;
const MAX_JOB_WAITERS: usize = 10;

static WAIT_COUNTS: [AtomicU32; MAX_WAIT_COUNTS] =
    [const { AtomicU32::new(0) }; MAX_WAIT_COUNTS];
static WAITERS: [[AtomicU64; MAX_JOB_WAITERS]; MAX_POOL_JOBS] =
    [const { [const { AtomicU64::new(0) }; MAX_JOB_WAITERS] }; MAX_POOL_JOBS];

fn pack_token(source_generation: u32, wait_index: usize, waiter_index: usize) -> u64 {
    debug_assert!(wait_index < MAX_WAIT_COUNTS);
    debug_assert!(waiter_index < MAX_POOL_JOBS);
    ((source_generation as u64 + 1) << 32) | ((wait_index as u64) << 16) | waiter_index as u64
}

fn unpack_token(token: u64) -> (u32, usize, usize) {
    let source_generation = ((token >> 32) as u32).wrapping_sub(1);
    let wait_index = ((token >> 16) & 0xFFFF) as usize;
    let waiter_index = (token & 0xFFFF) as usize;
    (source_generation, wait_index, waiter_index)
}

/// Decrements a wait counter for one completed dependency, enqueuing the
/// waiting job if that was the last one.
fn count_down(wait_index: usize, waiter_index: usize) {
    assert!(
        WAIT_COUNTS[wait_index].load(Ordering::Relaxed) != 1,
        "wait counter at its final value before the last decrement",
    );
    if WAIT_COUNTS[wait_index].fetch_sub(1, Ordering::AcqRel) == 2 {
        worker::commit_job(waiter_index);
        // Only once the job is committed does the counter go back to the
        // pool; a zero counter is claimable by any register() call.
        WAIT_COUNTS[wait_index].store(0, Ordering::Release);
    }
}

/// Registers the taken-but-unqueued job at `job_index` to be enqueued once
/// every dependency has completed. Called from `continue_with` and
/// `continue_reserved`.
pub(super) fn register(job_index: usize, dependencies: &[JobHandle]) {
    profiling::function_scope!();

    // Claim a wait counter, with the +1 guard on top of the dependency
    // count so the counter can't hit 1 while registration is mid-flight.
    let mut claimed = None;
    for (wait_index, count) in WAIT_COUNTS.iter().enumerate() {
        if count
            .compare_exchange(
                0,
                dependencies.len() as u32 + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            claimed = Some(wait_index);
            break;
        }
    }
    let wait_index = claimed.expect("wait list exhausted");

    for dependency in dependencies {
        let source_index = dependency.index();
        let source_generation = dependency.generation();
        let token = pack_token(source_generation, wait_index, job_index);

        // Publish the token into the dependency's waiter list.
        let mut list_index = None;
        while list_index.is_none() {
            for (i, slot) in WAITERS[source_index].iter().enumerate() {
                if slot
                    .compare_exchange(0, token, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    list_index = Some(i);
                    break;
                }
            }
        }
        let list_index = list_index.unwrap();

        // Re-check the dependency's generation after publishing. If it has
        // moved past the one the handle names, the dependency completed:
        // either its completion pass consumed our token (it'll decrement),
        // or the token is still there and reclaiming it makes the decrement
        // our job. The token can't have been re-published by someone else
        // meanwhile, because it names our pool slot and we hold it.
        if JOB_POOL[source_index].generation.load(Ordering::Acquire) > source_generation
            && WAITERS[source_index][list_index]
                .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            count_down(wait_index, job_index);
        }
    }

    // All dependencies already complete: the +1 guard is the only count
    // left, and the last count_down above committed the job. If
    // dependencies is empty, no decrement ever comes, so commit here.
    if dependencies.is_empty() {
        worker::commit_job(job_index);
        WAIT_COUNTS[wait_index].store(0, Ordering::Release);
    }
}

/// Walks the completed job's waiter tokens and counts down every waiter
/// registered against the generation that just retired. Called by the worker
/// after advancing the generation and freeing the pool slot.
pub(super) fn signal_completion(job_index: usize, retired_generation: u32) {
    profiling::function_scope!();
    for slot in &WAITERS[job_index] {
        let token = slot.load(Ordering::Acquire);
        if token == 0 {
            continue;
        }
        let (target_generation, wait_index, waiter_index) = unpack_token(token);
        if target_generation != retired_generation {
            // A token for some later tenant of this pool slot (or a stale
            // generation); not ours to signal.
            continue;
        }
        // Claim the token. Losing the race means the waiter's register()
        // re-check reclaimed it and will do the decrement itself.
        if slot
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            count_down(wait_index, waiter_index);
        }
    }
}
