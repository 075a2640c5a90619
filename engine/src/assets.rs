// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The streaming asset layer.
//!
//! An *asset* is an in-memory object produced by a [`Streamer`], identified
//! by an opaque 64-bit [`AssetHandle`] whose meaning belongs to the streamer
//! that made it. A *resource* is a named, reference-counted, file-backed
//! asset, identified by the hash of its path (see [`resources`] for the
//! table and the load/save/release operations).
//!
//! Streamers are registered per asset type, keyed by [`FourCC`]. Loads run
//! on the job system, and a streamer that needs sub-assets (or any other
//! jobs) to finish mid-load doesn't block: it returns
//! [`LoadContinuation::Wait`] naming the dependencies and the state to
//! resume in, and its load job goes to sleep until they complete. The
//! [`LoadContext`]'s `state` and `data` fields are the streamer's scratch
//! across those suspensions.

mod resources;

use arrayvec::ArrayVec;
use bytemuck::{Pod, Zeroable};

use core::sync::atomic::{AtomicU32, Ordering};

use crate::cell::SyncUnsafeCell;
use crate::jobs::{self, JobHandle, JobResult};
use crate::serialization::{FileStream, MemoryStream};

pub use resources::*;

/// A 32-bit asset type tag built from four ASCII bytes, e.g. `"MESH"` or
/// `"ENTT"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FourCC(pub u32);

impl FourCC {
    /// Packs four ASCII bytes into a tag: `FourCC::new(*b"MESH")`.
    pub const fn new(text: [u8; 4]) -> FourCC {
        FourCC(u32::from_le_bytes(text))
    }
}

/// Opaque handle to a loaded asset. The interpretation of the value belongs
/// to the streamer of the asset's type; often it's a pointer to a
/// streamer-owned record, sometimes an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct AssetHandle(pub u64);

impl AssetHandle {
    /// The reserved "no asset" sentinel.
    pub const INVALID: AssetHandle = AssetHandle(u64::MAX);
}

/// Handle to a resource: the 32-bit hash of its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHandle(pub u32);

/// The per-load state handed to [`Streamer::load_async`], heap-allocated for
/// the duration of one load (including across suspensions).
pub struct LoadContext {
    /// Read cursor into the resource's mapped file, or into the parent's
    /// stream for a sub-asset load.
    pub stream: MemoryStream,
    /// The parent's asset handle for sub-asset loads, zero for resources.
    pub parent_asset: AssetHandle,
    /// The job this load runs under; continuations registered by
    /// [`LoadContinuation::Wait`] re-enter it.
    pub handle: JobHandle,
    /// Streamer scratch that survives suspensions. Typically the
    /// half-constructed asset's address.
    pub data: u64,
    /// The state-machine cursor [`Streamer::load_async`] keys on.
    pub state: u32,
}

/// Handed to [`Streamer::save_thread_safe`]: the stream to serialize into
/// and the asset being saved.
pub struct SaveContext<'a> {
    /// The output stream, positioned wherever the caller (the resource save
    /// job, or a parent asset's streamer) left it.
    pub stream: &'a mut FileStream,
    /// The asset to serialize.
    pub asset: AssetHandle,
}

/// Most sub-assets one load step can wait on.
pub const MAX_DEPENDENCIES: usize = 32;

/// What a load step tells the asset layer to do next.
pub enum LoadContinuation {
    /// Sleep until the dependencies complete, then re-enter
    /// [`Streamer::load_async`] with the context's state set to
    /// `next_state`.
    Wait {
        /// The jobs to wait on; must not be empty.
        dependencies: ArrayVec<JobHandle, MAX_DEPENDENCIES>,
        /// Value for [`LoadContext::state`] on re-entry.
        next_state: u32,
    },
    /// The load is done and produced this asset.
    Complete(AssetHandle),
}

/// Builds a [`LoadContinuation::Wait`] from a dependency slice.
pub fn wait(dependencies: &[JobHandle], next_state: u32) -> LoadContinuation {
    let mut list = ArrayVec::new();
    list.try_extend_from_slice(dependencies)
        .expect("too many dependencies for one load step");
    LoadContinuation::Wait {
        dependencies: list,
        next_state,
    }
}

/// Builds a [`LoadContinuation::Complete`].
pub fn complete(asset: AssetHandle) -> LoadContinuation {
    LoadContinuation::Complete(asset)
}

/// The type-specific code that turns bytes into an asset, an asset back into
/// bytes, and releases an asset. One streamer is registered per [`FourCC`];
/// every method can be called from any worker thread.
pub trait Streamer: Sync {
    /// Runs one step of loading. The first call sees `context.state == 0`;
    /// returning [`wait`] re-enters with the state it names once the
    /// dependencies are done.
    fn load_async(&self, context: &mut LoadContext) -> LoadContinuation;

    /// Releases an asset this streamer produced.
    fn unload_thread_safe(&self, asset: AssetHandle);

    /// Serializes an asset into the context's stream. Types that are never
    /// saved at runtime can leave the default, which treats a save attempt
    /// as a bug.
    fn save_thread_safe(&self, context: &mut SaveContext) {
        let _ = context;
        panic!("streamer does not support saving this asset type");
    }
}

/// Callback for resource loads. The `usize` is the caller's user-data word,
/// passed back as-is.
///
/// Note that the callback can fire with [`ResourceLoadState::Available`]
/// before (or instead of) [`ResourceLoadState::Loading`]: the loading
/// notification comes from the requesting thread, the available notification
/// from whichever worker finishes the load, and an already-loaded resource
/// skips `Loading` entirely.
pub type OnResourceLoad = fn(usize, ResourceHandle, ResourceLoadState);

/// Callback for sub-asset loads, invoked on the worker that completed the
/// load.
pub type OnSubAssetLoad = fn(usize, AssetHandle);

/// Load progress reported through [`OnResourceLoad`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLoadState {
    /// The resource's load has been kicked off.
    Loading,
    /// The resource's asset handle is valid.
    Available,
}

const MAX_STREAMERS: usize = 100;
/// Claim marker for a streamer slot mid-registration. Not a valid FourCC
/// (not ASCII), so it can't collide with a real tag.
const CLAIMED: u32 = u32::MAX;

struct StreamerSlot {
    /// Zero = free, [`CLAIMED`] = registration in progress, anything else =
    /// a registered tag.
    tag: AtomicU32,
    streamer: SyncUnsafeCell<Option<&'static dyn Streamer>>,
}

static STREAMERS: [StreamerSlot; MAX_STREAMERS] = [const {
    StreamerSlot {
        tag: AtomicU32::new(0),
        streamer: SyncUnsafeCell::new(None),
    }
}; MAX_STREAMERS];

/// Registers the streamer for an asset type. Thread-safe; registering the
/// same type twice is a caller bug the table doesn't defend against (the
/// first registration wins lookups).
pub fn add_streamer(tag: FourCC, streamer: &'static dyn Streamer) {
    assert!(tag.0 != 0 && tag.0 != CLAIMED, "invalid streamer tag");
    for slot in &STREAMERS {
        if slot
            .tag
            .compare_exchange(0, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            // Safety: the claim above makes this thread the only writer of
            // this slot, and readers don't look at the cell until the real
            // tag is published below.
            unsafe { *slot.streamer.get() = Some(streamer) };
            slot.tag.store(tag.0, Ordering::Release);
            return;
        }
    }
    panic!("streamer table full");
}

/// Looks up the streamer for an asset type.
pub(crate) fn get_streamer(tag: FourCC) -> Option<&'static dyn Streamer> {
    for slot in &STREAMERS {
        if slot.tag.load(Ordering::Acquire) == tag.0 {
            // Safety: the tag is published with release after the cell
            // write, and the cell is never written again.
            return unsafe { *slot.streamer.get() };
        }
    }
    None
}

/// Runs one `load_async` step and translates the continuation into the job
/// result for the load job: a waiting load stores its next state, registers
/// the job as a continuation of the dependencies, and sleeps.
pub(crate) fn step_load(
    streamer: &'static dyn Streamer,
    context: *mut LoadContext,
) -> (JobResult, AssetHandle) {
    // Safety: load jobs for one context are serialized (the job sleeps
    // before its continuation can re-enter it), so this is the only borrow.
    let continuation = streamer.load_async(unsafe { &mut *context });
    match continuation {
        LoadContinuation::Wait {
            dependencies,
            next_state,
        } => {
            assert!(
                !dependencies.is_empty(),
                "a waiting load step needs dependencies",
            );
            // Safety: as above; the continuation registered below only
            // fires after this job returns Sleep.
            unsafe { (*context).state = next_state };
            // Publish the state before the job can be re-enqueued.
            core::sync::atomic::fence(Ordering::Release);
            let handle = unsafe { (*context).handle };
            jobs::continue_reserved(handle, &dependencies);
            (JobResult::Sleep, AssetHandle::INVALID)
        }
        LoadContinuation::Complete(asset) => (JobResult::Complete, asset),
    }
}

#[cfg(test)]
mod tests {
    use super::FourCC;

    #[test]
    fn four_cc_packs_ascii_bytes_little_endian() {
        let tag = FourCC::new(*b"MESH");
        assert_eq!(
            (b'M' as u32) | ((b'E' as u32) << 8) | ((b'S' as u32) << 16) | ((b'H' as u32) << 24),
            tag.0,
        );
        assert_ne!(FourCC::new(*b"ENTT"), tag);
    }
}
