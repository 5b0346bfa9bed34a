//! System execution: the invocation record and the table loop.

use std::any::Any;
use std::time::Instant;

use crate::{
    entity::{Allocator, Entity, EntityIndex},
    error::Error,
    stage::{Stage, StagedOp},
    storage::Tables,
    system::Ref,
    world::World,
};

/// The record handed to a system action: one matched table (or one notified
/// row), plus everything needed to read and write its columns.
///
/// Rows are iterated by index in `0..row_count()`. A column's datum for a
/// row is reached through [`get`](Batch::get)/[`get_mut`](Batch::get_mut);
/// columns whose offset is negative resolve through the refs arrays to data
/// owned by another entity (a prefab, a container, or the system itself) and
/// are read-only.
///
/// Structural writes issued through the batch (spawn, delete, add, remove,
/// set) are staged and become visible no earlier than the next phase
/// barrier.
pub struct Batch<'a> {
    system: Entity,
    delta_time: f32,
    param: Option<&'a dyn Any>,

    entities: &'a [Entity],
    rows: *mut u8,
    row_count: usize,
    stride: usize,

    columns: &'a [i32],
    sizes: &'a [u32],
    components: &'a [Entity],
    refs_entity: &'a [Entity],
    refs_data: &'a [*const u8],

    stage: &'a Stage,
    allocator: &'a Allocator,

    /// Set to a non-none handle to stop the current run after this call.
    pub interrupted_by: Entity,
}

impl<'a> Batch<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        system: Entity,
        delta_time: f32,
        param: Option<&'a dyn Any>,
        entities: &'a [Entity],
        rows: *mut u8,
        row_count: usize,
        stride: usize,
        columns: &'a [i32],
        sizes: &'a [u32],
        components: &'a [Entity],
        refs_entity: &'a [Entity],
        refs_data: &'a [*const u8],
        stage: &'a Stage,
        allocator: &'a Allocator,
    ) -> Self {
        Self {
            system,
            delta_time,
            param,
            entities,
            rows,
            row_count,
            stride,
            columns,
            sizes,
            components,
            refs_entity,
            refs_data,
            stage,
            allocator,
            interrupted_by: Entity::NONE,
        }
    }

    /// The handle of the running system.
    #[inline]
    pub fn system(&self) -> Entity {
        self.system
    }

    /// The delta time for this run. For periodic systems this is the
    /// accumulated time since the last run.
    #[inline]
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// The opaque parameter passed to `run_system`, if any.
    #[inline]
    pub fn param(&self) -> Option<&dyn Any> {
        self.param
    }

    /// The number of rows in this batch.
    #[inline]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// The number of signature columns.
    #[inline]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// The row stride in bytes.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The per-column byte offsets; negative values index the refs arrays as
    /// `-(1 + i)`.
    #[inline]
    pub fn columns(&self) -> &[i32] {
        self.columns
    }

    /// The component handle behind each column.
    #[inline]
    pub fn components(&self) -> &[Entity] {
        self.components
    }

    /// The component handle of one column.
    #[inline]
    pub fn component(&self, column: usize) -> Entity {
        self.components[column]
    }

    /// The entity owning one row.
    #[inline]
    pub fn entity(&self, row: usize) -> Entity {
        self.entities[row]
    }

    /// The entities of all rows, in row order.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        self.entities
    }

    /// The entity a ref column reads from, or none for direct columns.
    pub fn ref_entity(&self, column: usize) -> Entity {
        match self.columns[column] {
            offset if offset < 0 => self.refs_entity[(-offset - 1) as usize],
            _ => Entity::NONE,
        }
    }

    /// The full bytes of one row.
    pub fn row_bytes(&self, row: usize) -> &[u8] {
        assert!(row < self.row_count, "row {row} out of bounds");
        // SAFETY: rows points at row_count * stride initialized bytes owned
        // by the matched table; the runner guarantees the pointer outlives
        // the action call and this batch is the only mutable access path.
        unsafe { std::slice::from_raw_parts(self.rows.add(row * self.stride), self.stride) }
    }

    /// The full mutable bytes of one row.
    pub fn row_bytes_mut(&mut self, row: usize) -> &mut [u8] {
        assert!(row < self.row_count, "row {row} out of bounds");
        // SAFETY: see row_bytes; &mut self makes this the unique borrow.
        unsafe { std::slice::from_raw_parts_mut(self.rows.add(row * self.stride), self.stride) }
    }

    /// Read one column's datum for one row as `T`.
    ///
    /// Returns `None` for columns with no data (Not, absent Optional,
    /// handle-only) and for refs whose source entity died.
    ///
    /// # Safety
    /// `T` must match the layout the component was registered with: its size
    /// must not exceed the registered element size, and the element's
    /// alignment must satisfy `T`'s.
    pub unsafe fn get<T>(&self, row: usize, column: usize) -> Option<&T> {
        let ptr = self.data_ptr(row, column)?;
        // SAFETY: the caller vouches for the layout; data_ptr bounds-checked
        // the row and resolved the offset.
        Some(unsafe { &*ptr.cast::<T>() })
    }

    /// Read one column's datum for one row mutably.
    ///
    /// Ref columns are read-only and yield `None`.
    ///
    /// # Safety
    /// Same contract as [`get`](Batch::get).
    pub unsafe fn get_mut<T>(&mut self, row: usize, column: usize) -> Option<&mut T> {
        if self.columns[column] < 0 {
            return None;
        }
        let ptr = self.data_ptr(row, column)?;
        // SAFETY: direct offsets point into this batch's rows; &mut self
        // makes this the unique access path.
        Some(unsafe { &mut *(ptr as *mut T) })
    }

    fn data_ptr(&self, row: usize, column: usize) -> Option<*const u8> {
        assert!(row < self.row_count, "row {row} out of bounds");
        if self.sizes[column] == 0 {
            return None;
        }
        match self.columns[column] {
            offset if offset >= 0 => {
                // SAFETY: offset + size fits in the stride by table layout.
                Some(unsafe { self.rows.add(row * self.stride + offset as usize) } as *const u8)
            }
            offset => {
                let ptr = self.refs_data[(-offset - 1) as usize];
                if ptr.is_null() { None } else { Some(ptr) }
            }
        }
    }

    /// Stage a new entity with the family behind a handle. The handle is
    /// allocated immediately; the row appears at the next barrier.
    pub fn spawn(&self, family: Entity) -> Entity {
        let entity = self.allocator.alloc();
        self.stage.push(entity, StagedOp::New { family });
        entity
    }

    /// Stage the deletion of an entity.
    pub fn delete(&self, entity: Entity) {
        self.stage.push(entity, StagedOp::Delete);
    }

    /// Stage adding a component (or a whole declared family) to an entity.
    pub fn add_component(&self, entity: Entity, component: Entity) {
        self.stage.push(entity, StagedOp::Add { component });
    }

    /// Stage removing a component (or a whole declared family).
    pub fn remove_component(&self, entity: Entity, component: Entity) {
        self.stage.push(entity, StagedOp::Remove { component });
    }

    /// Stage writing a component value, adding the component if absent.
    pub fn set_component(&self, entity: Entity, component: Entity, data: &[u8]) {
        self.stage.push(
            entity,
            StagedOp::Set {
                component,
                data: data.to_vec(),
            },
        );
    }
}

/// Resolve a descriptor's ref block into parallel (entity, data) arrays for
/// one run. A dead source yields a null data slot.
pub(crate) fn resolve_refs(
    index: &EntityIndex,
    tables: &Tables,
    block: &[Ref],
) -> (Vec<Entity>, Vec<*const u8>) {
    let mut entities = Vec::with_capacity(block.len());
    let mut data = Vec::with_capacity(block.len());
    for r in block {
        entities.push(r.entity);
        data.push(cell_ptr(index, tables, r.entity, r.component).unwrap_or(std::ptr::null()));
    }
    (entities, data)
}

fn cell_ptr(
    index: &EntityIndex,
    tables: &Tables,
    entity: Entity,
    component: Entity,
) -> Option<*const u8> {
    let location = index.get(entity)?;
    let table_id = tables.find(location.family())?;
    let bytes = tables.get(table_id).cell(location.row(), component)?;
    Some(bytes.as_ptr())
}

/// Run a system over its active tables.
///
/// Implements the full runner contract: the enabled gate, the periodic
/// accumulator, filter application, per-table ref resolution, action
/// invocation, cooperative interruption, and optional wall-time accounting.
pub(crate) fn run(
    world: &mut World,
    system: Entity,
    delta: f32,
    filter: Option<Entity>,
    param: Option<&dyn Any>,
) -> Result<Entity, Error> {
    let sys_index = world
        .systems
        .index_of(system)
        .ok_or(Error::InvalidEntity(system))?;

    {
        let record = world.systems.at(sys_index);
        if !record.enabled {
            return Ok(Entity::NONE);
        }
        if !record.kind.is_row_kind() && !record.has_tables() {
            return Err(Error::NoMatch(system));
        }
    }

    let filter_id = match filter {
        Some(handle) => Some(world.family_from_handle(handle)?),
        None => None,
    };

    let delta_for_action = {
        let record = world.systems.at_mut(sys_index);
        if record.period > 0.0 {
            let accumulated = record.time_passed + delta;
            if accumulated < record.period {
                record.time_passed = accumulated;
                return Ok(Entity::NONE);
            }
            record.time_passed = accumulated - record.period;
            if record.time_passed > record.period {
                // A pause longer than two periods runs once and forfeits
                // the surplus.
                record.time_passed = 0.0;
            }
            accumulated
        } else {
            delta
        }
    };

    let started = world.measure_system_time.then(Instant::now);
    let mut interrupted = Entity::NONE;

    {
        let World {
            systems,
            tables,
            families,
            index,
            stage,
            allocator,
            ..
        } = world;
        let record = systems.at(sys_index);

        for d in 0..record.active_tables.len() {
            let descriptor = &record.active_tables[d];
            let table_id = descriptor.table;

            if let Some(filter_id) = filter_id {
                let table_family = tables.get(table_id).family();
                if families
                    .contains(table_family, filter_id, true, true, index)
                    .is_none()
                {
                    continue;
                }
            }

            let (refs_entity, refs_data) = if descriptor.refs_index != 0 {
                resolve_refs(index, tables, &record.refs[descriptor.refs_index - 1])
            } else {
                (Vec::new(), Vec::new())
            };

            let table = tables.get_mut(table_id);
            let row_count = table.len();
            let stride = table.stride();
            let entities_ptr = table.entities().as_ptr();
            let rows_ptr = table.rows_mut().as_mut_ptr();
            // SAFETY: entities and rows are disjoint fields of the table;
            // both raw parts stay valid through the action call because
            // structural mutation from inside an action is staged, never
            // applied. Ref data pointers target other tables' rows and are
            // read-only for the duration of the call.
            let entities =
                unsafe { std::slice::from_raw_parts(entities_ptr, row_count) };

            let mut batch = Batch::new(
                record.handle,
                delta_for_action,
                param,
                entities,
                rows_ptr,
                row_count,
                stride,
                &descriptor.offsets,
                &descriptor.sizes,
                &record.components[descriptor.components_index],
                &refs_entity,
                &refs_data,
                stage,
                allocator,
            );
            (record.action)(&mut batch);

            if batch.interrupted_by.is_some() {
                interrupted = batch.interrupted_by;
                break;
            }
        }
    }

    if let Some(start) = started {
        world.systems.at_mut(sys_index).time_spent += start.elapsed().as_secs_f32();
    }

    Ok(interrupted)
}
