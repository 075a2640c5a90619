// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end asset layer scenarios: double-load dedup, entity save/load
//! round-trips, release-while-loading, and sub-asset fan-in.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use engine::assets::{
    self, add_streamer, complete, AssetHandle, FourCC, LoadContext, LoadContinuation,
    ResourceHandle, ResourceLoadState, SaveContext, Streamer,
};
use engine::entity::{self, EntityHandle, PropertyHandle};
use engine::serialization::MemoryStream;
use platform_linux::NativePlatform;

const MESH_TYPE: FourCC = FourCC::new(*b"MESH");
const SLOW_MESH_TYPE: FourCC = FourCC::new(*b"MSHB");
const RENDER_TYPE: FourCC = FourCC::new(*b"RNDR");
const TRANSFORM_TYPE: FourCC = FourCC::new(*b"TFRM");

/// A mesh stand-in whose file body is one u64, kept as the asset handle.
/// Counts loads and unloads so the tests can assert "exactly once".
struct MeshStreamer {
    loads: AtomicU32,
    unloads: AtomicU32,
    load_delay: Duration,
}

impl Streamer for MeshStreamer {
    fn load_async(&self, context: &mut LoadContext) -> LoadContinuation {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.loads.fetch_add(1, Ordering::AcqRel);
        let magic: u64 = context.stream.read();
        complete(AssetHandle(magic))
    }

    fn unload_thread_safe(&self, _asset: AssetHandle) {
        self.unloads.fetch_add(1, Ordering::AcqRel);
    }
}

static MESH_STREAMER: MeshStreamer = MeshStreamer {
    loads: AtomicU32::new(0),
    unloads: AtomicU32::new(0),
    load_delay: Duration::ZERO,
};

static SLOW_MESH_STREAMER: MeshStreamer = MeshStreamer {
    loads: AtomicU32::new(0),
    unloads: AtomicU32::new(0),
    load_delay: Duration::from_millis(50),
};

/// A render property referencing a mesh resource by path hash; the body is
/// that u32 hash, and the asset handle carries it verbatim.
struct RenderPropertyStreamer;

static RENDER_STREAMER: RenderPropertyStreamer = RenderPropertyStreamer;

impl Streamer for RenderPropertyStreamer {
    fn load_async(&self, context: &mut LoadContext) -> LoadContinuation {
        let mesh_hash: u32 = context.stream.read();
        complete(AssetHandle(mesh_hash as u64))
    }

    fn unload_thread_safe(&self, _asset: AssetHandle) {}

    fn save_thread_safe(&self, context: &mut SaveContext) {
        context.stream.write(context.asset.0 as u32);
    }
}

/// A transform property carrying a 3x4 matrix; assets index a process-wide
/// transform table.
struct TransformStreamer;

static TRANSFORM_STREAMER: TransformStreamer = TransformStreamer;

static TRANSFORMS: Mutex<Vec<[f32; 12]>> = Mutex::new(Vec::new());

const IDENTITY: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

impl Streamer for TransformStreamer {
    fn load_async(&self, context: &mut LoadContext) -> LoadContinuation {
        let matrix: [f32; 12] = context.stream.read();
        let mut transforms = TRANSFORMS.lock().unwrap();
        transforms.push(matrix);
        complete(AssetHandle(transforms.len() as u64 - 1))
    }

    fn unload_thread_safe(&self, _asset: AssetHandle) {}

    fn save_thread_safe(&self, context: &mut SaveContext) {
        let matrix = TRANSFORMS.lock().unwrap()[context.asset.0 as usize];
        context.stream.write(matrix);
    }
}

static SETUP: OnceLock<String> = OnceLock::new();

/// Starts the job system, points the asset root at a temp directory, and
/// registers every streamer the scenarios use. Returns the platform and the
/// asset root.
fn setup() -> (&'static NativePlatform, &'static str) {
    let platform = common::init();
    let root = SETUP.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        // The directory has to outlive every asynchronously running job in
        // the test process, so it's never cleaned up.
        std::mem::forget(dir);
        assets::set_asset_root(&root);

        entity::init_entity_system();
        add_streamer(MESH_TYPE, &MESH_STREAMER);
        add_streamer(SLOW_MESH_TYPE, &SLOW_MESH_STREAMER);
        add_streamer(RENDER_TYPE, &RENDER_STREAMER);
        add_streamer(TRANSFORM_TYPE, &TRANSFORM_STREAMER);
        root
    });
    (platform, root.as_str())
}

/// `OnResourceLoad` callback writing the handle through the user-data
/// pointer once the resource is available.
fn store_when_available(data: usize, resource: ResourceHandle, state: ResourceLoadState) {
    if state == ResourceLoadState::Available {
        // Safety: the tests pass addresses of locals they keep alive until
        // the load has been waited on.
        unsafe { *(data as *mut ResourceHandle) = resource };
    }
}

/// `OnResourceLoad` callback writing the handle on the first notification,
/// so the caller has it while the load is still in flight.
fn store_any_state(data: usize, resource: ResourceHandle, _state: ResourceLoadState) {
    // Safety: as in store_when_available.
    unsafe { *(data as *mut ResourceHandle) = resource };
}

fn store_sub_asset(data: usize, asset: AssetHandle) {
    // Safety: as in store_when_available.
    unsafe { *(data as *mut AssetHandle) = asset };
}

#[test]
fn double_load_yields_one_loader_and_one_resource() {
    let (platform, root) = setup();
    std::fs::write(
        format!("{root}/Box.msh"),
        0xABCD_0123_4567_89EFu64.to_le_bytes(),
    )
    .unwrap();

    let mut first = ResourceHandle(0);
    let mut second = ResourceHandle(0);
    let first_job = assets::load_resource_async(
        "Box.msh",
        MESH_TYPE,
        store_when_available,
        &mut first as *mut ResourceHandle as usize,
    );
    let second_job = assets::load_resource_async(
        "Box.msh",
        MESH_TYPE,
        store_when_available,
        &mut second as *mut ResourceHandle as usize,
    );

    if let Some(job) = second_job {
        common::wait_job(platform, job);
    }
    if let Some(job) = first_job {
        common::wait_job(platform, job);
    }

    assert_eq!(first.0, second.0, "same path must yield the same resource");
    assert_eq!(
        1,
        MESH_STREAMER.loads.load(Ordering::Acquire),
        "exactly one of the two loads should have hit the file",
    );
    assert!(assets::is_resource_asset_available(first));
    assert_eq!(
        AssetHandle(0xABCD_0123_4567_89EF),
        assets::get_asset_from_resource(first),
    );
    assert_eq!("Box.msh", &*assets::get_resource_path(first));

    assert!(
        assets::release_resource_async(second).is_none(),
        "the first release still leaves a reference",
    );
    let unload_job = assets::release_resource_async(first).expect("last release unloads");
    common::wait_job(platform, unload_job);
    assert_eq!(1, MESH_STREAMER.unloads.load(Ordering::Acquire));
}

#[test]
fn entity_save_load_round_trip() {
    let (platform, root) = setup();

    let mesh_reference = 0xC0FFEEu32;
    let transform = {
        let mut transforms = TRANSFORMS.lock().unwrap();
        transforms.push(IDENTITY);
        PropertyHandle(transforms.len() as u64 - 1)
    };

    let entity = entity::create_entity();
    entity::add_property_to_entity(entity, RENDER_TYPE, PropertyHandle(mesh_reference as u64));
    entity::add_property_to_entity(entity, TRANSFORM_TYPE, transform);

    let resource = assets::create_resource_thread_safe(
        "TestEntity.entt",
        entity::ENTITY_TYPE,
        AssetHandle::from(entity),
    );
    common::wait_job(platform, assets::save_resource_async(resource));

    let saved_bytes = std::fs::read(format!("{root}/TestEntity.entt")).unwrap();
    // count, then per property: type, byte size, body (4 bytes of mesh
    // reference; 48 bytes of matrix).
    assert_eq!(4 + (4 + 4 + 4) + (4 + 4 + 48), saved_bytes.len());
    assert_eq!(2, u32::from_le_bytes(saved_bytes[0..4].try_into().unwrap()));
    assert_eq!(
        4,
        u32::from_le_bytes(saved_bytes[8..12].try_into().unwrap()),
        "the render property's patched byte size",
    );
    assert_eq!(
        48,
        u32::from_le_bytes(saved_bytes[20..24].try_into().unwrap()),
        "the transform property's patched byte size",
    );

    // Drop the created resource (this unloads and frees the entity), then
    // load it back from the file.
    common::wait_job(
        platform,
        assets::release_resource_async(resource).expect("last reference"),
    );

    let mut loaded = ResourceHandle(0);
    let load_job = assets::load_resource_async(
        "TestEntity.entt",
        entity::ENTITY_TYPE,
        store_when_available,
        &mut loaded as *mut ResourceHandle as usize,
    );
    if let Some(job) = load_job {
        common::wait_job(platform, job);
    }
    assert_eq!(resource.0, loaded.0, "reloaded resource hash must match");

    let loaded_entity = EntityHandle::from(assets::get_asset_from_resource(loaded));
    assert_eq!(
        PropertyHandle(mesh_reference as u64),
        entity::get_property_from_entity(loaded_entity, RENDER_TYPE),
        "the mesh reference must survive the round trip",
    );
    let loaded_transform = entity::get_property_from_entity(loaded_entity, TRANSFORM_TYPE);
    assert_ne!(entity::INVALID_PROPERTY, loaded_transform);
    assert_eq!(
        IDENTITY,
        TRANSFORMS.lock().unwrap()[loaded_transform.0 as usize],
    );

    // Re-serializing the loaded entity must reproduce the bytes exactly.
    common::wait_job(platform, assets::save_resource_async(loaded));
    let resaved_bytes = std::fs::read(format!("{root}/TestEntity.entt")).unwrap();
    assert_eq!(saved_bytes, resaved_bytes);

    common::wait_job(
        platform,
        assets::release_resource_async(loaded).expect("last reference"),
    );
}

#[test]
fn release_while_loading_unloads_after_the_loader() {
    let (platform, root) = setup();
    std::fs::write(format!("{root}/Box2.msh"), 77u64.to_le_bytes()).unwrap();

    let mut handle = ResourceHandle(0);
    assets::load_resource_async(
        "Box2.msh",
        SLOW_MESH_TYPE,
        store_any_state,
        &mut handle as *mut ResourceHandle as usize,
    );
    // The Loading notification has fired synchronously, so `handle` is
    // valid while the streamer is still sleeping in its load.
    let unload_job =
        assets::release_resource_async(handle).expect("only reference, must unload");
    common::wait_job(platform, unload_job);

    assert_eq!(
        1,
        SLOW_MESH_STREAMER.loads.load(Ordering::Acquire),
        "the loader still ran",
    );
    assert_eq!(
        1,
        SLOW_MESH_STREAMER.unloads.load(Ordering::Acquire),
        "the unload ran exactly once, after the loader",
    );
}

#[test]
fn sub_asset_load_reports_into_the_parent() {
    let (platform, _root) = setup();

    let mut body = Vec::new();
    for value in IDENTITY {
        body.extend_from_slice(&value.to_le_bytes());
    }

    let mut loaded = AssetHandle::INVALID;
    let job = assets::load_sub_asset_async(
        MemoryStream::new(body.as_ptr()),
        TRANSFORM_TYPE,
        AssetHandle(0),
        store_sub_asset,
        &mut loaded as *mut AssetHandle as usize,
    );
    common::wait_job(platform, job);

    assert_ne!(AssetHandle::INVALID, loaded);
    assert_eq!(IDENTITY, TRANSFORMS.lock().unwrap()[loaded.0 as usize]);
}
