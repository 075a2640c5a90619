// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The resource table and the asynchronous load/save/release operations.
//!
//! Resources are identified by the hash of their path. The table entry's
//! reference count is the coordination variable for the whole lifecycle: the
//! increment from 0 to 1 elects the thread that allocates the resource
//! record and starts the load, and the decrement back to 0 elects the thread
//! that schedules the unload. The record pointer itself is published to the
//! entry with release ordering after the record is filled, and other threads
//! spin until it appears, so the table never hands out a half-built record.
//!
//! The table is statically sized and does not resolve hash collisions:
//! distinct live paths must hash to distinct slots. With a million slots and
//! a handful of thousands of live resources that's a comfortable margin, but
//! it is a precondition, not a guarantee.

use core::fmt::Write;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use arrayvec::ArrayString;
use platform::{FileHandle, OpenOptions};

use crate::jobs::{self, JobDesc, JobHandle, JobResult};
use crate::memory;
use crate::serialization::{FileStream, MemoryStream};
use crate::{cell::SyncUnsafeCell, sys};

use super::{
    get_streamer, step_load, AssetHandle, FourCC, LoadContext, OnResourceLoad, OnSubAssetLoad,
    ResourceHandle, ResourceLoadState, SaveContext,
};

/// Longest supported resource path, in bytes.
pub const MAX_PATH_LENGTH: usize = 255;

const MAX_TABLE_ENTRIES: usize = 1024 * 1024;

const DEFAULT_ASSET_ROOT: &str = "../Assets/Compiled";

/// The heap-allocated record behind a live table entry.
struct Resource {
    asset_type: FourCC,
    path_hash: u32,
    /// The job whose completion means `asset` is valid. Written before the
    /// record is published, read by anyone who got the record from the
    /// table.
    loading_job: JobHandle,
    /// The loaded asset, [`AssetHandle::INVALID`] until the loader stores
    /// it.
    asset: AtomicU64,
    /// The mapped resource file; zero for resources created in memory.
    /// Written by the load pipeline's file job, read by the unload job,
    /// which the job graph orders after it.
    file: FileHandle,
    path: ArrayString<MAX_PATH_LENGTH>,
}

struct ResourceEntry {
    ref_count: AtomicU32,
    resource: AtomicPtr<Resource>,
}

static RESOURCE_TABLE: [ResourceEntry; MAX_TABLE_ENTRIES] = [const {
    ResourceEntry {
        ref_count: AtomicU32::new(0),
        resource: AtomicPtr::new(core::ptr::null_mut()),
    }
}; MAX_TABLE_ENTRIES];

static ASSET_ROOT: SyncUnsafeCell<Option<ArrayString<128>>> = SyncUnsafeCell::new(None);

/// Configures the directory resource paths are resolved under. Call before
/// any load or save; the default is `../Assets/Compiled`.
pub fn set_asset_root(root: &str) {
    // Safety: per the doc comment, called before any concurrent reader.
    unsafe { *ASSET_ROOT.get() = Some(ArrayString::from(root).expect("asset root too long")) };
}

fn full_path(path: &str) -> ArrayString<400> {
    // Safety: only written by set_asset_root before loads start.
    let root = unsafe { (*ASSET_ROOT.get()).as_deref() }.unwrap_or(DEFAULT_ASSET_ROOT);
    let mut full = ArrayString::new();
    write!(full, "{root}/{path}").expect("resource path too long");
    full
}

/// The classic djb2 string hash. The path is hashed verbatim, no
/// normalization.
fn hash_path(path: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in path.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

fn table_entry(path_hash: u32) -> &'static ResourceEntry {
    &RESOURCE_TABLE[path_hash as usize % MAX_TABLE_ENTRIES]
}

/// Spins until the entry's record pointer is published. The acquire load
/// pairs with the release store in the publishing thread, so everything
/// written into the record before publication is visible after this.
fn wait_for_record(entry: &ResourceEntry) -> *mut Resource {
    loop {
        let resource = entry.resource.load(Ordering::Acquire);
        if !resource.is_null() {
            return resource;
        }
        core::hint::spin_loop();
    }
}

/// Starts the two-job binary load pipeline for a freshly allocated record:
/// job A opens and maps the file, job B (a continuation of A) runs the
/// streamer's state machine until it completes. Returns job B's handle,
/// which is also the record's `loading_job`.
fn load_binary_async(
    resource: *mut Resource,
    asset_type: FourCC,
    on_load: OnResourceLoad,
    user_data: usize,
) -> JobHandle {
    let streamer = get_streamer(asset_type).expect("no streamer registered for asset type");

    let context = memory::allocate_value(LoadContext {
        stream: MemoryStream::default(),
        parent_asset: AssetHandle(0),
        handle: JobHandle::default(),
        data: 0,
        state: 0,
    });
    let context_address = context as usize;
    let resource_address = resource as usize;

    let file_job = jobs::launch(JobDesc::new(move || {
        let platform = sys::platform();
        let resource = resource_address as *mut Resource;
        let context = context_address as *mut LoadContext;
        // Safety: the record and context outlive the load pipeline, and the
        // fields touched here are handed off through the job graph (this
        // job happens-before the streamer job and the unload job).
        unsafe {
            let path = full_path(&(*resource).path);
            let file = sys::platform()
                .open_file(&path, OpenOptions::READ)
                .expect("failed to open a resource file");
            (*resource).file = file;
            let mapped = platform.map_file(file);
            assert!(!mapped.is_null(), "failed to map a resource file");
            (*context).stream = MemoryStream::new(mapped);
        }
        JobResult::Complete
    }));

    let path_hash = unsafe { (*resource).path_hash };
    let loader = jobs::reserve(JobDesc::new(move || {
        let resource = resource_address as *mut Resource;
        let context = context_address as *mut LoadContext;
        let (result, asset) = step_load(streamer, context);
        if result == JobResult::Complete {
            // Safety: the asset field is an atomic, and the context is ours
            // to free once the load has fully completed.
            unsafe {
                (*resource).asset.store(asset.0, Ordering::Release);
                on_load(user_data, ResourceHandle(path_hash), ResourceLoadState::Available);
                memory::free_value(context);
            }
        }
        result
    }));
    // Safety: the loader job can't run before it's launched below, so the
    // handle write doesn't race the closure reading it.
    unsafe { (*context).handle = loader };
    jobs::continue_reserved(loader, &[file_job]);

    loader
}

/// Starts an asynchronous load of the resource at `path`, or joins one
/// already in flight.
///
/// Every call adds one to the resource's reference count (pair it with
/// [`release_resource_async`]). The first reference triggers the actual
/// load; later ones either find the asset already available and call back
/// immediately from this thread, or register a continuation on the loader.
/// `on_load` always eventually fires with
/// [`Available`](ResourceLoadState::Available).
///
/// Returns the job whose completion implies availability, or None when the
/// asset was already available (the callback has then already run).
pub fn load_resource_async(
    path: &str,
    asset_type: FourCC,
    on_load: OnResourceLoad,
    user_data: usize,
) -> Option<JobHandle> {
    profiling::function_scope!();
    let path_hash = hash_path(path);
    let entry = table_entry(path_hash);
    let handle = ResourceHandle(path_hash);

    // The increment both counts our reference and elects the loader. The
    // acquire side of the RMW keeps the record reads below from drifting
    // above the election.
    let new_entry = entry.ref_count.fetch_add(1, Ordering::AcqRel) == 0;

    if !new_entry {
        // Someone else is loading (or has loaded) this path. Wait for the
        // record to exist, then either report availability straight away or
        // chain onto the loading job.
        let resource = wait_for_record(entry);
        // Safety: record fields other than `asset` are immutable after
        // publication, which the acquire in wait_for_record ordered.
        let asset = unsafe { &(*resource).asset };
        if asset.load(Ordering::Acquire) != AssetHandle::INVALID.0 {
            on_load(user_data, handle, ResourceLoadState::Available);
            return None;
        }

        let loading_job = unsafe { (*resource).loading_job };
        let resource_address = resource as usize;
        let continuation = jobs::continue_with(
            JobDesc::new(move || {
                let resource = resource_address as *mut Resource;
                // Safety: the loader completed (we're its continuation), so
                // the asset is stored; our un-released reference keeps the
                // record alive.
                let asset = unsafe { (*resource).asset.load(Ordering::Acquire) };
                assert!(
                    asset != AssetHandle::INVALID.0,
                    "loader completed without storing an asset handle",
                );
                on_load(user_data, ResourceHandle(unsafe { (*resource).path_hash }),
                    ResourceLoadState::Available);
                JobResult::Complete
            }),
            &[loading_job],
        );
        return Some(continuation);
    }

    // We're the elected loader: build the record, start the pipeline, then
    // publish the record for the spinners above.
    let resource = memory::allocate_value(Resource {
        asset_type,
        path_hash,
        loading_job: JobHandle::default(),
        asset: AtomicU64::new(AssetHandle::INVALID.0),
        file: FileHandle::new(0),
        path: ArrayString::from(path).expect("resource path too long"),
    });
    let loading_job = load_binary_async(resource, asset_type, on_load, user_data);
    // Safety: not yet published, so the record is still exclusively ours.
    // (The load pipeline doesn't touch loading_job.)
    unsafe { (*resource).loading_job = loading_job };

    entry.resource.store(resource, Ordering::Release);
    on_load(user_data, handle, ResourceLoadState::Loading);

    Some(loading_job)
}

/// Drops one reference to the resource. The reference that hits zero
/// schedules an unload job which releases the streamer's asset, unmaps and
/// closes the file, and frees the record; if the resource is still loading,
/// the unload runs as a continuation of the loader.
///
/// Returns the unload job, or None if other references remain.
pub fn release_resource_async(handle: ResourceHandle) -> Option<JobHandle> {
    profiling::function_scope!();
    let entry = table_entry(handle.0);

    // The release may race the loader's publication; wait until the record
    // exists. Also: read and keep the record pointer *before* the
    // decrement. After the decrement a racing loader can reuse the slot and
    // publish its own record, and the decrementer must not pick that one
    // up. The AcqRel on the decrement keeps the load on the right side.
    let resource = wait_for_record(entry);

    let previous = entry.ref_count.fetch_sub(1, Ordering::AcqRel);
    assert!(previous != 0, "releasing a resource with no references");
    if previous != 1 {
        return None;
    }

    // Last reference: the record (and the asset) are ours to tear down.
    let resource_address = resource as usize;
    let unload = JobDesc::new(move || {
        let resource = resource_address as *mut Resource;
        // Safety: this job is ordered after the loader (directly below, or
        // trivially when the load had finished), and nothing else touches
        // the record once the count hit zero.
        unsafe {
            let streamer =
                get_streamer((*resource).asset_type).expect("streamer vanished before unload");
            streamer.unload_thread_safe(AssetHandle((*resource).asset.load(Ordering::Acquire)));
            let file = (*resource).file;
            if file != FileHandle::new(0) {
                let platform = sys::platform();
                platform.unmap_file(file);
                platform.close_file(file);
            }
            memory::free_value(resource);
        }
        JobResult::Complete
    });

    // Safety: shared borrow of the record's atomic field.
    let still_loading =
        unsafe { (*resource).asset.load(Ordering::Acquire) } == AssetHandle::INVALID.0;
    if still_loading {
        let loading_job = unsafe { (*resource).loading_job };
        Some(jobs::continue_with(unload, &[loading_job]))
    } else {
        Some(jobs::launch(unload))
    }
}

/// Saves the resource back to its own path on a job: the resource is pinned
/// with an extra reference for the duration, the file is recreated, the
/// streamer serializes into it, and the pin is dropped through the normal
/// release path.
pub fn save_resource_async(handle: ResourceHandle) -> JobHandle {
    jobs::launch(JobDesc::new(move || {
        profiling::scope!("save_resource");
        let entry = table_entry(handle.0);
        entry.ref_count.fetch_add(1, Ordering::AcqRel);

        let resource = wait_for_record(entry);
        // Safety: the pinned reference keeps the record alive, and the
        // fields read here are immutable after publication.
        unsafe {
            let path = full_path(&(*resource).path);
            let platform = sys::platform();
            let file = platform
                .open_file(
                    &path,
                    OpenOptions::CREATE
                        .and(OpenOptions::OVERWRITE)
                        .and(OpenOptions::WRITE),
                )
                .expect("failed to create a resource file for saving");

            let mut stream = FileStream::new(file);
            let streamer =
                get_streamer((*resource).asset_type).expect("no streamer for saved resource");
            let mut save_context = SaveContext {
                stream: &mut stream,
                asset: AssetHandle((*resource).asset.load(Ordering::Acquire)),
            };
            streamer.save_thread_safe(&mut save_context);
            stream.flush();
            platform.close_file(file);
        }

        // Drop the pin through the full release flow, so a save of the last
        // reference still tears the resource down properly.
        release_resource_async(handle);
        JobResult::Complete
    }))
}

/// Registers an in-memory asset as a resource at `path` without loading
/// anything, e.g. a freshly authored entity about to be saved. The path
/// must not already be a live resource. The returned handle carries one
/// reference, like a load would.
pub fn create_resource_thread_safe(
    path: &str,
    asset_type: FourCC,
    asset: AssetHandle,
) -> ResourceHandle {
    let path_hash = hash_path(path);
    let entry = table_entry(path_hash);

    let new_entry = entry.ref_count.fetch_add(1, Ordering::AcqRel) == 0;
    assert!(new_entry, "creating a resource over a live one");

    let resource = memory::allocate_value(Resource {
        asset_type,
        path_hash,
        loading_job: JobHandle::default(),
        asset: AtomicU64::new(asset.0),
        file: FileHandle::new(0),
        path: ArrayString::from(path).expect("resource path too long"),
    });
    entry.resource.store(resource, Ordering::Release);

    ResourceHandle(path_hash)
}

/// Starts loading a sub-asset from a parent's stream. No resource table
/// involvement: the context is built straight from the given stream
/// snapshot, and the asset is reported to `on_loaded` (typically storing it
/// into the parent's own representation).
pub fn load_sub_asset_async(
    stream: MemoryStream,
    asset_type: FourCC,
    parent_asset: AssetHandle,
    on_loaded: OnSubAssetLoad,
    user_data: usize,
) -> JobHandle {
    let streamer = get_streamer(asset_type).expect("no streamer registered for sub-asset type");

    let context = memory::allocate_value(LoadContext {
        stream,
        parent_asset,
        handle: JobHandle::default(),
        data: 0,
        state: 0,
    });
    let context_address = context as usize;

    let handle = jobs::reserve(JobDesc::new(move || {
        let context = context_address as *mut LoadContext;
        let (result, asset) = step_load(streamer, context);
        if result == JobResult::Complete {
            on_loaded(user_data, asset);
            // Safety: the load is complete, nothing re-enters this context.
            unsafe { memory::free_value(context) };
        }
        result
    }));
    // Safety: written before launch, read by the job after.
    unsafe { (*context).handle = handle };
    jobs::launch_reserved(handle);
    handle
}

/// Releases a sub-asset through its type's streamer. Parents call this from
/// their own `unload_thread_safe` for each child.
pub fn unload_sub_asset_thread_safe(asset: AssetHandle, asset_type: FourCC) {
    get_streamer(asset_type)
        .expect("no streamer registered for sub-asset type")
        .unload_thread_safe(asset);
}

/// Serializes a sub-asset into the parent's stream through its type's
/// streamer. Parents call this from their own `save_thread_safe`, framing
/// the child with a type tag and byte size (see the entity streamer).
pub fn save_sub_asset_thread_safe(stream: &mut FileStream, asset_type: FourCC, asset: AssetHandle) {
    let streamer = get_streamer(asset_type).expect("no streamer registered for sub-asset type");
    let mut context = SaveContext { stream, asset };
    streamer.save_thread_safe(&mut context);
}

/// The resource's loaded asset. The resource must be live and loaded.
pub fn get_asset_from_resource(handle: ResourceHandle) -> AssetHandle {
    let entry = table_entry(handle.0);
    assert!(
        entry.ref_count.load(Ordering::Acquire) > 0,
        "resource is not loaded",
    );
    let resource = wait_for_record(entry);
    // Safety: shared borrow of the record's atomic field.
    AssetHandle(unsafe { (*resource).asset.load(Ordering::Acquire) })
}

/// The path the resource was loaded from (or created at). The resource must
/// be live.
pub fn get_resource_path(handle: ResourceHandle) -> ArrayString<MAX_PATH_LENGTH> {
    let entry = table_entry(handle.0);
    assert!(
        entry.ref_count.load(Ordering::Acquire) > 0,
        "resource is not loaded",
    );
    let resource = wait_for_record(entry);
    // Safety: the path is immutable after publication.
    unsafe { (*resource).path }
}

/// True if the resource is live and its asset has finished loading, i.e.
/// [`get_asset_from_resource`] would return a valid handle.
pub fn is_resource_asset_available(handle: ResourceHandle) -> bool {
    let entry = table_entry(handle.0);
    if entry.ref_count.load(Ordering::Acquire) == 0 {
        return false;
    }
    let resource = entry.resource.load(Ordering::Acquire);
    if resource.is_null() {
        return false;
    }
    // Safety: shared borrow of the record's atomic field.
    unsafe { (*resource).asset.load(Ordering::Acquire) != AssetHandle::INVALID.0 }
}

#[cfg(test)]
mod tests {
    use super::hash_path;

    #[test]
    fn path_hash_is_djb2() {
        // hash("a") = 5381 * 33 + 'a'
        assert_eq!(5381u32 * 33 + b'a' as u32, hash_path("a"));
        assert_ne!(hash_path("Box.msh"), hash_path("box.msh"));
        assert_eq!(hash_path("TestEntity.entt"), hash_path("TestEntity.entt"));
    }
}
