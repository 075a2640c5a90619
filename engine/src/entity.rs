// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Entity and cell assets: the composite types of the asset layer.
//!
//! An entity is a list of typed properties; a cell is a list of entities.
//! Both serialize their children inline as sub-assets, framed so a reader
//! can skip any child it isn't decoding: the entity writes `{property type,
//! byte size, child bytes}` per child, the cell the same minus the type tag
//! (cell children are always entities). The byte size is written as a
//! placeholder and patched after the child's streamer has run, since only
//! then is the size known.
//!
//! Loading mirrors that: the streamer kicks one sub-asset load per child
//! (handing each a snapshot of the read cursor, then skipping the framed
//! bytes) and sleeps until all of them complete, finishing the asset on
//! re-entry. This is the canonical use of the load state machine.

use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;

use crate::assets::{
    self, add_streamer, AssetHandle, FourCC, LoadContext, LoadContinuation, SaveContext, Streamer,
    MAX_DEPENDENCIES,
};
use crate::cell::SyncUnsafeCell;
use crate::collections::DynamicArray;
use crate::jobs::JobHandle;
use crate::{memory, sys};

/// Asset type tag of entities.
pub const ENTITY_TYPE: FourCC = FourCC::new(*b"ENTT");
/// Asset type tag of cells.
pub const CELL_TYPE: FourCC = FourCC::new(*b"CELL");

/// Handle to a property asset owned by an entity. The value is the
/// property's own asset handle; the wrapper keeps entity plumbing from
/// mixing up properties and arbitrary assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyHandle(pub u64);

/// No-property sentinel, e.g. from [`get_property_from_entity`] on a miss.
pub const INVALID_PROPERTY: PropertyHandle = PropertyHandle(u64::MAX);

/// Handle to a live entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityHandle(pub u64);

/// Handle to a live cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellHandle(pub u32);

impl From<AssetHandle> for PropertyHandle {
    fn from(asset: AssetHandle) -> PropertyHandle {
        PropertyHandle(asset.0)
    }
}

impl From<PropertyHandle> for AssetHandle {
    fn from(property: PropertyHandle) -> AssetHandle {
        AssetHandle(property.0)
    }
}

impl From<AssetHandle> for EntityHandle {
    fn from(asset: AssetHandle) -> EntityHandle {
        EntityHandle(asset.0)
    }
}

impl From<EntityHandle> for AssetHandle {
    fn from(entity: EntityHandle) -> AssetHandle {
        AssetHandle(entity.0)
    }
}

struct Property {
    kind: FourCC,
    handle: PropertyHandle,
}

struct Entity {
    properties: DynamicArray<Property>,
}

fn entity_from_handle(handle: u64) -> *mut Entity {
    handle as usize as *mut Entity
}

/// Writes a loaded sub-asset's handle into the property slot reserved for
/// it. `data` is the slot's address; the entity's property array is
/// reserved up front so the slot can't move while loads are in flight.
fn store_property_handle(data: usize, asset: AssetHandle) {
    // Safety: points at a reserved Property's handle field, see above.
    unsafe { *(data as *mut PropertyHandle) = PropertyHandle(asset.0) };
}

struct EntityStreamer;

static ENTITY_STREAMER: EntityStreamer = EntityStreamer;

impl Streamer for EntityStreamer {
    fn load_async(&self, context: &mut LoadContext) -> LoadContinuation {
        const LOAD_PROPERTIES: u32 = 0;
        const FINISH: u32 = 1;

        if context.state == LOAD_PROPERTIES {
            let entity = memory::allocate_value(Entity {
                properties: DynamicArray::new(),
            });

            let property_count: u32 = context.stream.read();
            assert!(
                property_count as usize <= MAX_DEPENDENCIES,
                "entity has too many properties to load in one step",
            );

            // Safety: the entity was just allocated and is only shared with
            // the sub-asset callbacks below, which write disjoint property
            // slots.
            let properties = unsafe { &mut (*entity).properties };
            // Reserved up front: the callbacks keep pointers into the
            // array, so it must not grow (and move) until the load is done.
            properties.reserve(property_count);

            let mut dependencies = ArrayVec::<JobHandle, MAX_DEPENDENCIES>::new();
            for _ in 0..property_count {
                let kind: FourCC = context.stream.read();
                let byte_size: u32 = context.stream.read();

                let property = properties.push(Property {
                    kind,
                    handle: INVALID_PROPERTY,
                });
                let slot_address = &mut property.handle as *mut PropertyHandle as usize;

                dependencies.push(assets::load_sub_asset_async(
                    context.stream,
                    kind,
                    AssetHandle(0),
                    store_property_handle,
                    slot_address,
                ));
                context.stream.advance(byte_size as usize);
            }

            context.data = entity as u64;
            assets::wait(&dependencies, FINISH)
        } else {
            assets::complete(AssetHandle(context.data))
        }
    }

    fn save_thread_safe(&self, context: &mut SaveContext) {
        let entity = entity_from_handle(context.asset.0);
        // Safety: saving is externally synchronized with mutation of the
        // entity, like any by-handle access.
        let properties = unsafe { &(*entity).properties };

        context.stream.write(properties.len() as u32);
        for property in properties.as_slice() {
            context.stream.write(property.kind);

            // Placeholder size, patched once the child has been written and
            // its extent is known.
            context.stream.write(0u32);
            let write_start = context.stream.flush();
            assets::save_sub_asset_thread_safe(
                context.stream,
                property.kind,
                AssetHandle::from(property.handle),
            );
            let write_end = context.stream.flush();

            let byte_size = write_end - write_start;
            sys::platform().write_file(
                context.stream.file(),
                bytemuck::bytes_of(&byte_size),
                (write_start - size_of::<u32>() as u32) as u64,
            );
        }
    }

    fn unload_thread_safe(&self, asset: AssetHandle) {
        let entity = entity_from_handle(asset.0);
        // Safety: the asset layer calls unload exactly once, after which
        // nothing holds the entity.
        unsafe {
            for property in (*entity).properties.as_slice() {
                assets::unload_sub_asset_thread_safe(
                    AssetHandle::from(property.handle),
                    property.kind,
                );
            }
            memory::free_value(entity);
        }
    }
}

const MAX_CELLS: usize = 32;

struct CellData {
    entities: DynamicArray<EntityHandle>,
}

struct CellSlot {
    allocated: AtomicU32,
    data: SyncUnsafeCell<CellData>,
}

static CELLS: [CellSlot; MAX_CELLS] = [const {
    CellSlot {
        allocated: AtomicU32::new(0),
        data: SyncUnsafeCell::new(CellData {
            entities: DynamicArray::new(),
        }),
    }
}; MAX_CELLS];

fn claim_cell() -> u32 {
    for (index, slot) in CELLS.iter().enumerate() {
        if slot
            .allocated
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return index as u32;
        }
    }
    panic!("out of cells, how many are active?");
}

fn store_entity_handle(data: usize, asset: AssetHandle) {
    // Safety: points at a reserved EntityHandle slot, same contract as
    // store_property_handle.
    unsafe { *(data as *mut EntityHandle) = EntityHandle(asset.0) };
}

struct CellStreamer;

static CELL_STREAMER: CellStreamer = CellStreamer;

impl Streamer for CellStreamer {
    fn load_async(&self, context: &mut LoadContext) -> LoadContinuation {
        const LOAD_ENTITIES: u32 = 0;
        const FINISH: u32 = 1;

        if context.state == LOAD_ENTITIES {
            let cell_index = claim_cell();
            // Safety: the claim above made this load the cell's only owner.
            let cell = unsafe { &mut *CELLS[cell_index as usize].data.get() };

            let entity_count: u32 = context.stream.read();
            assert!(
                entity_count as usize <= MAX_DEPENDENCIES,
                "cell has too many entities to load in one step",
            );
            cell.entities.reserve(entity_count);

            let mut dependencies = ArrayVec::<JobHandle, MAX_DEPENDENCIES>::new();
            for _ in 0..entity_count {
                let byte_size: u32 = context.stream.read();

                let slot = cell.entities.push(EntityHandle(u64::MAX));
                let slot_address = slot as *mut EntityHandle as usize;

                dependencies.push(assets::load_sub_asset_async(
                    context.stream,
                    ENTITY_TYPE,
                    AssetHandle(0),
                    store_entity_handle,
                    slot_address,
                ));
                context.stream.advance(byte_size as usize);
            }

            context.data = cell_index as u64;
            assets::wait(&dependencies, FINISH)
        } else {
            assets::complete(AssetHandle(context.data))
        }
    }

    fn save_thread_safe(&self, context: &mut SaveContext) {
        // Safety: saving is externally synchronized with cell mutation.
        let cell = unsafe { &*CELLS[context.asset.0 as usize].data.get() };

        context.stream.write(cell.entities.len() as u32);
        for &entity in cell.entities.as_slice() {
            context.stream.write(0u32);
            let write_start = context.stream.flush();
            assets::save_sub_asset_thread_safe(
                context.stream,
                ENTITY_TYPE,
                AssetHandle::from(entity),
            );
            let write_end = context.stream.flush();

            let byte_size = write_end - write_start;
            sys::platform().write_file(
                context.stream.file(),
                bytemuck::bytes_of(&byte_size),
                (write_start - size_of::<u32>() as u32) as u64,
            );
        }
    }

    fn unload_thread_safe(&self, asset: AssetHandle) {
        let slot = &CELLS[asset.0 as usize];
        // Safety: unload is called exactly once for a loaded cell, and the
        // allocated flag below isn't cleared until the cell is reset.
        unsafe {
            let cell = &mut *slot.data.get();
            for &entity in cell.entities.as_slice() {
                assets::unload_sub_asset_thread_safe(AssetHandle::from(entity), ENTITY_TYPE);
            }
            cell.entities.clear();
        }
        slot.allocated.store(0, Ordering::Release);
    }
}

/// Registers the entity and cell streamers. Call after
/// [`init_job_system`](crate::jobs::init_job_system), before loading or
/// saving either type.
pub fn init_entity_system() {
    add_streamer(ENTITY_TYPE, &ENTITY_STREAMER);
    add_streamer(CELL_TYPE, &CELL_STREAMER);
}

/// Creates an empty entity. Entities created here are freed when their
/// asset is unloaded (i.e. on the owning resource's release).
pub fn create_entity() -> EntityHandle {
    let entity = memory::allocate_value(Entity {
        properties: DynamicArray::new(),
    });
    EntityHandle(entity as u64)
}

/// Appends a property to the entity.
pub fn add_property_to_entity(entity: EntityHandle, kind: FourCC, property: PropertyHandle) {
    let entity = entity_from_handle(entity.0);
    // Safety: by-handle mutation is externally synchronized, as in C-style
    // handle APIs; entities under concurrent load/save must not be mutated.
    unsafe { (*entity).properties.push(Property { kind, handle: property }) };
}

/// Finds the entity's first property of the given type, or
/// [`INVALID_PROPERTY`].
pub fn get_property_from_entity(entity: EntityHandle, kind: FourCC) -> PropertyHandle {
    let entity = entity_from_handle(entity.0);
    // Safety: as in add_property_to_entity.
    let properties = unsafe { &(*entity).properties };
    for property in properties.as_slice() {
        if property.kind == kind {
            return property.handle;
        }
    }
    INVALID_PROPERTY
}

/// Claims an empty cell.
pub fn create_cell() -> CellHandle {
    CellHandle(claim_cell())
}

/// Appends an entity to the cell.
pub fn add_entity_to_cell(cell: CellHandle, entity: EntityHandle) {
    // Safety: by-handle mutation is externally synchronized.
    let cell = unsafe { &mut *CELLS[cell.0 as usize].data.get() };
    cell.entities.push(entity);
}

/// The entities of the cell. The borrow is only sound while the cell stays
/// alive and unmutated, which the caller upholds like with any handle API.
pub fn cell_entities(cell: CellHandle) -> &'static [EntityHandle] {
    // Safety: see the doc comment.
    let cell = unsafe { &*CELLS[cell.0 as usize].data.get() };
    cell.entities.as_slice()
}
