//! The world: the single container everything else hangs off.
//!
//! A `World` owns the handle allocator, the entity index, the family and
//! table registries, the system arena, and the staging buffer. It exposes
//! the public API surface (registration, entity lifecycle, component access,
//! `progress`) and implements the entity-move commit protocol that every
//! structural mutation funnels through.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use crate::{
    component::{COMPONENT, ComponentInfo, FIRST_USER_HANDLE, Names, PREFAB},
    entity::{Allocator, Entity, EntityIndex, Location},
    error::Error,
    family::{Families, FamilyId},
    jobs::{self, WorkerPool},
    signature::{self, Op, Source},
    stage::{Stage, StagedOp},
    storage::{TableId, Tables},
    system::{
        Batch, Column, Referent, SystemKind, SystemRecord, Systems,
        matcher::{self, Flip},
        runner,
    },
};

/// Per-kind system membership lists.
///
/// Phase lists hold the systems `progress` runs each tick; a phase system
/// whose last active table empties moves to `inactive` until a table fills
/// again. Row-kind lists are run by the entity-move protocol.
#[derive(Default)]
pub(crate) struct SystemLists {
    pre_frame: Vec<Entity>,
    on_load: Vec<Entity>,
    post_load: Vec<Entity>,
    on_frame: Vec<Entity>,
    on_store: Vec<Entity>,
    post_store: Vec<Entity>,
    post_frame: Vec<Entity>,
    on_demand: Vec<Entity>,
    inactive: Vec<Entity>,
    on_add: Vec<Entity>,
    on_remove: Vec<Entity>,
    on_set: Vec<Entity>,
}

impl SystemLists {
    fn phase(&self, kind: SystemKind) -> &[Entity] {
        match kind {
            SystemKind::PreFrame => &self.pre_frame,
            SystemKind::OnLoad => &self.on_load,
            SystemKind::PostLoad => &self.post_load,
            SystemKind::OnFrame => &self.on_frame,
            SystemKind::OnStore => &self.on_store,
            SystemKind::PostStore => &self.post_store,
            SystemKind::PostFrame => &self.post_frame,
            _ => panic!("{kind:?} is not a phase kind"),
        }
    }

    fn phase_mut(&mut self, kind: SystemKind) -> &mut Vec<Entity> {
        match kind {
            SystemKind::PreFrame => &mut self.pre_frame,
            SystemKind::OnLoad => &mut self.on_load,
            SystemKind::PostLoad => &mut self.post_load,
            SystemKind::OnFrame => &mut self.on_frame,
            SystemKind::OnStore => &mut self.on_store,
            SystemKind::PostStore => &mut self.post_store,
            SystemKind::PostFrame => &mut self.post_frame,
            _ => panic!("{kind:?} is not a phase kind"),
        }
    }

    fn row_list(&self, kind: SystemKind) -> &[Entity] {
        match kind {
            SystemKind::OnAdd => &self.on_add,
            SystemKind::OnRemove => &self.on_remove,
            SystemKind::OnSet => &self.on_set,
            _ => panic!("{kind:?} is not a row kind"),
        }
    }

    fn row_list_mut(&mut self, kind: SystemKind) -> &mut Vec<Entity> {
        match kind {
            SystemKind::OnAdd => &mut self.on_add,
            SystemKind::OnRemove => &mut self.on_remove,
            SystemKind::OnSet => &mut self.on_set,
            _ => panic!("{kind:?} is not a row kind"),
        }
    }

    /// Move a system between its phase list and the inactive list.
    fn activate(&mut self, handle: Entity, kind: SystemKind, active: bool) {
        let (from, to) = if active {
            let position = self
                .inactive
                .iter()
                .position(|h| *h == handle)
                .expect("system must be in the inactive list");
            self.inactive.remove(position);
            (false, true)
        } else {
            let list = self.phase_mut(kind);
            let position = list
                .iter()
                .position(|h| *h == handle)
                .expect("system must be in its phase list");
            list.remove(position);
            (true, false)
        };
        if to {
            self.phase_mut(kind).push(handle);
        }
        if from {
            self.inactive.push(handle);
        }
        log::debug!("system {handle:?} {}", if active { "activated" } else { "deactivated" });
    }
}

/// The ECS world.
pub struct World {
    pub(crate) allocator: Allocator,
    pub(crate) index: EntityIndex,
    pub(crate) families: Families,
    pub(crate) tables: Tables,
    pub(crate) systems: Systems,
    pub(crate) names: Names,
    pub(crate) family_handles: HashMap<Entity, FamilyId>,
    pub(crate) lists: SystemLists,
    pub(crate) stage: Stage,
    pub(crate) pool: Option<WorkerPool>,
    pub(crate) time: f32,
    pub(crate) measure_system_time: bool,
    pub(crate) quit: bool,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create a world and bootstrap the builtin components.
    ///
    /// Bootstrap materializes the metadata table by hand: the metadata
    /// component describes itself, so its family and table must exist before
    /// the normal registration path can run.
    pub fn new() -> Self {
        let mut world = Self {
            allocator: Allocator::new(FIRST_USER_HANDLE),
            index: EntityIndex::new(),
            families: Families::new(),
            tables: Tables::new(),
            systems: Systems::new(),
            names: Names::new(),
            family_handles: HashMap::new(),
            lists: SystemLists::default(),
            stage: Stage::new(),
            pool: None,
            time: 0.0,
            measure_system_time: false,
            quit: false,
        };

        let meta_family = world.families.register(COMPONENT, &[], &world.index);
        let meta_table =
            world
                .tables
                .create(meta_family, vec![COMPONENT], &[ComponentInfo::META]);

        for (builtin, info, name) in [
            (COMPONENT, ComponentInfo::META, "Component"),
            (PREFAB, ComponentInfo::MARKER, "Prefab"),
        ] {
            let table = world.tables.get_mut(meta_table);
            let row = table.insert(builtin);
            table
                .cell_mut(row, COMPONENT)
                .expect("metadata column must exist")
                .copy_from_slice(&info.to_bytes());
            world.index.insert(builtin, Location::new(meta_family, row));
            world.names.insert(name, builtin);
        }

        log::debug!("world bootstrapped, builtin components in place");
        world
    }

    /// The accumulated world time in seconds.
    #[inline]
    pub fn time(&self) -> f32 {
        self.time
    }

    /// Toggle wall-time measurement around system table loops.
    pub fn measure_system_time(&mut self, enabled: bool) {
        self.measure_system_time = enabled;
    }

    /// Request that the next `progress` call returns `false`.
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Configure the worker pool used by parallel system runs. Zero tears
    /// the pool down.
    pub fn set_threads(&mut self, count: usize) {
        self.pool = if count == 0 {
            None
        } else {
            Some(WorkerPool::new(count))
        };
    }

    /// Whether a handle is alive in the entity index.
    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.index.contains(entity)
    }

    /// The family an entity currently belongs to.
    #[inline]
    pub fn entity_family(&self, entity: Entity) -> Option<FamilyId> {
        self.index.get(entity).map(|l| l.family())
    }

    /// The name bound to a handle, if any.
    pub fn name_of(&self, handle: Entity) -> Option<String> {
        self.names.name_of(handle)
    }

    /// Render a family's members through the name registry, for diagnostics
    /// ("Position, Speed"). Unnamed members render as their raw handle.
    pub fn describe_family(&self, family: FamilyId) -> String {
        self.families.describe(family, |handle| {
            self.names
                .name_of(handle)
                .unwrap_or_else(|| handle.raw().to_string())
        })
    }

    /// The registered metadata of a component, read from its row.
    pub fn component_info(&self, component: Entity) -> Option<ComponentInfo> {
        let location = self.index.get(component)?;
        let table_id = self.tables.find(location.family())?;
        let bytes = self
            .tables
            .get(table_id)
            .cell(location.row(), COMPONENT)?;
        Some(ComponentInfo::from_bytes(bytes))
    }

    /// Register a component with the given element size; alignment is
    /// inferred from the size. Re-registering a name returns the existing
    /// handle.
    pub fn register_component(&mut self, name: &str, size: u32) -> Entity {
        self.register_info(name, ComponentInfo::sized(size))
    }

    /// Register a component with an explicit alignment.
    pub fn register_component_aligned(&mut self, name: &str, size: u32, align: u32) -> Entity {
        self.register_info(name, ComponentInfo::aligned(size, align))
    }

    fn register_info(&mut self, name: &str, info: ComponentInfo) -> Entity {
        if let Some(existing) = self.names.resolve(name) {
            if self.component_info(existing) != Some(info) {
                log::warn!("component `{name}` re-registered with different metadata; keeping the original");
            }
            return existing;
        }

        let handle = self.allocator.alloc();
        let meta_family = self.families.register(COMPONENT, &[], &self.index);
        self.commit(handle, meta_family);

        let location = self.index.get(handle).expect("commit must index the component");
        let table_id = self
            .tables
            .find(location.family())
            .expect("metadata table must exist");
        self.tables
            .get_mut(table_id)
            .cell_mut(location.row(), COMPONENT)
            .expect("metadata column must exist")
            .copy_from_slice(&info.to_bytes());

        self.names.insert(name, handle);
        log::debug!("registered component `{name}` as {handle:?} ({} bytes)", info.size);
        handle
    }

    /// Declare a named family from component handles and/or other declared
    /// family handles (which are expanded).
    pub fn declare_family(&mut self, name: &str, components: &[Entity]) -> Result<Entity, Error> {
        let mut members = Vec::with_capacity(components.len());
        for handle in components {
            if let Some(family) = self.family_handles.get(handle) {
                members.extend_from_slice(self.families.members(*family));
            } else if self.index.contains(*handle) {
                members.push(*handle);
            } else {
                return Err(Error::InvalidEntity(*handle));
            }
        }
        let family = self.families.register(Entity::NONE, &members, &self.index);
        let handle = self.allocator.alloc();
        self.family_handles.insert(handle, family);
        self.names.insert(name, handle);
        Ok(handle)
    }

    /// Create a prefab: a data-only entity of the given family plus the
    /// `Prefab` marker. Link entities to it with
    /// `add_component(entity, prefab)`.
    pub fn new_prefab(&mut self, name: &str, family: Entity) -> Result<Entity, Error> {
        let base = self.family_from_handle(family)?;
        let with_marker = self.families.add(base, PREFAB, &self.index);
        let prefab = self.allocator.alloc();
        self.commit(prefab, with_marker);
        self.names.insert(name, prefab);
        Ok(prefab)
    }

    /// Allocate a new entity of the family behind a handle (a declared
    /// family, a component, or none for an empty entity).
    pub fn new_entity(&mut self, family: Entity) -> Result<Entity, Error> {
        let family = self.family_from_handle(family)?;
        let entity = self.allocator.alloc();
        self.commit(entity, family);
        Ok(entity)
    }

    /// Delete an entity and all its components.
    pub fn delete_entity(&mut self, entity: Entity) -> Result<(), Error> {
        if !self.index.contains(entity) {
            return Err(Error::InvalidEntity(entity));
        }
        self.commit(entity, FamilyId::EMPTY);
        Ok(())
    }

    /// Add a component (or every member of a declared family) to an entity.
    ///
    /// An entity with no components yet is admissible; the add creates its
    /// first row.
    pub fn add_component(&mut self, entity: Entity, component: Entity) -> Result<(), Error> {
        let to_add = self.family_from_handle(component)?;
        let current = self
            .index
            .get(entity)
            .map_or(FamilyId::EMPTY, |l| l.family());
        let target = self
            .families
            .merge(current, to_add, FamilyId::EMPTY, &self.index);
        self.commit(entity, target);
        Ok(())
    }

    /// Remove a component (or every member of a declared family) from an
    /// entity.
    pub fn remove_component(&mut self, entity: Entity, component: Entity) -> Result<(), Error> {
        let to_remove = self.family_from_handle(component)?;
        let Some(location) = self.index.get(entity) else {
            return Err(Error::InvalidEntity(entity));
        };
        let target = self
            .families
            .merge(location.family(), FamilyId::EMPTY, to_remove, &self.index);
        self.commit(entity, target);
        Ok(())
    }

    /// Write a component value, adding the component first when absent.
    /// Fires matching `OnSet` systems.
    ///
    /// # Panics
    /// Panics if the payload length does not match the registered element
    /// size.
    pub fn set_component(
        &mut self,
        entity: Entity,
        component: Entity,
        data: &[u8],
    ) -> Result<(), Error> {
        let info = self
            .component_info(component)
            .ok_or(Error::InvalidEntity(component))?;
        assert_eq!(
            data.len(),
            info.size as usize,
            "payload size must match the registered element size"
        );

        let present = self
            .index
            .get(entity)
            .is_some_and(|l| self.families.contains_component(l.family(), component, false, &self.index));
        if !present {
            self.add_component(entity, component)?;
        }

        let location = self.index.get(entity).ok_or(Error::InvalidEntity(entity))?;
        let table_id = self
            .tables
            .find(location.family())
            .expect("live entity must have a table");
        self.tables
            .get_mut(table_id)
            .cell_mut(location.row(), component)
            .expect("component was just committed")
            .copy_from_slice(data);

        let changed = self.families.register(component, &[], &self.index);
        self.notify_rows(SystemKind::OnSet, location, changed);
        Ok(())
    }

    /// Read a component's bytes, following the prefab chain when the entity
    /// itself does not carry the component.
    ///
    /// Callers inside a running system must treat the bytes as read-only;
    /// structural and value writes go through staging.
    pub fn get_component(&self, entity: Entity, component: Entity) -> Option<&[u8]> {
        let location = self.index.get(entity)?;
        let table_id = self.tables.find(location.family())?;
        if let Some(bytes) = self.tables.get(table_id).cell(location.row(), component) {
            return Some(bytes);
        }
        let prefab = self.families.prefab_of(location.family())?;
        self.get_component(prefab, component)
    }

    /// Declare a system: parse the signature, derive its families, match
    /// existing tables, and slot it into its kind's list.
    pub fn new_system(
        &mut self,
        name: &str,
        kind: SystemKind,
        sig: &str,
        action: impl Fn(&mut Batch<'_>) + Send + Sync + 'static,
    ) -> Result<Entity, Error> {
        let mut elements: Vec<(Source, Op, Entity)> = Vec::new();
        signature::parse(sig, |source, op, identifier| {
            let handle = self
                .names
                .resolve(identifier)
                .ok_or_else(|| Error::NotRegistered(identifier.to_owned()))?;
            elements.push((source, op, handle));
            Ok(())
        })?;

        // Fold consecutive Or elements of one source into a single column
        // carrying an interned family.
        let mut columns: Vec<Column> = Vec::new();
        for (source, op, handle) in elements {
            if op == Op::Or {
                let element_family = self.family_from_handle(handle)?;
                if let Some(last) = columns.last_mut() {
                    if last.op == Op::Or && last.source == source {
                        let merged = self.families.merge(
                            last.family(),
                            element_family,
                            FamilyId::EMPTY,
                            &self.index,
                        );
                        last.referent = Referent::Family(merged);
                        continue;
                    }
                }
                columns.push(Column {
                    source,
                    op,
                    referent: Referent::Family(element_family),
                });
            } else {
                columns.push(Column {
                    source,
                    op,
                    referent: Referent::Component(handle),
                });
            }
        }

        let derived = matcher::derive_families(&columns, &mut self.families, &self.index);
        let handle = self.allocator.alloc();
        let mut record = SystemRecord {
            handle,
            name: name.to_owned(),
            kind,
            action: Box::new(action),
            columns,
            and_from_entity: derived.and_from_entity,
            and_from_system: derived.and_from_system,
            not_from_entity: derived.not_from_entity,
            not_from_component: derived.not_from_component,
            enabled: true,
            period: 0.0,
            time_passed: 0.0,
            time_spent: 0.0,
            active_tables: Vec::new(),
            inactive_tables: Vec::new(),
            refs: Vec::new(),
            components: Vec::new(),
            matched: fixedbitset::FixedBitSet::with_capacity(self.tables.len()),
        };

        // SYSTEM.-sourced And components live on the system's own entity so
        // their refs resolve through the entity index like any other.
        if !record.and_from_system.is_empty() {
            let family = record.and_from_system;
            self.commit(handle, family);
        }

        if !kind.is_row_kind() {
            for raw_id in 0..self.tables.len() {
                let table_id = TableId::new(raw_id as u32);
                if matcher::match_table(&self.families, &self.index, &self.tables, table_id, &record)
                {
                    matcher::add_table(
                        &self.families,
                        &self.index,
                        &mut self.tables,
                        table_id,
                        &mut record,
                    );
                }
            }
        }

        if kind.is_row_kind() {
            self.lists.row_list_mut(kind).push(handle);
        } else if kind == SystemKind::OnDemand {
            self.lists.on_demand.push(handle);
        } else if record.active_tables.is_empty() {
            self.lists.inactive.push(handle);
        } else {
            self.lists.phase_mut(kind).push(handle);
        }

        self.systems.insert(record);
        self.names.insert(name, handle);
        log::debug!("declared system `{name}` as {handle:?} ({kind:?})");
        Ok(handle)
    }

    /// Enable or disable a system. Disabled systems run nothing.
    pub fn enable(&mut self, system: Entity, enabled: bool) -> Result<(), Error> {
        let (kind, was_enabled, has_active) = {
            let record = self
                .systems
                .get_mut(system)
                .ok_or(Error::InvalidEntity(system))?;
            let snapshot = (record.kind, record.enabled, !record.active_tables.is_empty());
            record.enabled = enabled;
            snapshot
        };
        // A system whose tables filled while it was disabled was left in the
        // inactive list; re-enabling restores its phase membership.
        if enabled
            && !was_enabled
            && has_active
            && kind.is_phase()
            && self.lists.inactive.contains(&system)
        {
            self.lists.activate(system, kind, true);
            self.restore_phase_order(kind);
        }
        Ok(())
    }

    /// Set a system's run period in seconds; 0 runs it every invocation.
    pub fn set_period(&mut self, system: Entity, period: f32) -> Result<(), Error> {
        let record = self
            .systems
            .get_mut(system)
            .ok_or(Error::InvalidEntity(system))?;
        record.period = period;
        Ok(())
    }

    /// Wall time a system has spent in its table loop, in seconds. Only
    /// accumulates while measurement is enabled.
    pub fn time_spent(&self, system: Entity) -> Result<f32, Error> {
        self.systems
            .get(system)
            .map(|r| r.time_spent)
            .ok_or(Error::InvalidEntity(system))
    }

    /// Run one system over its active tables.
    ///
    /// `filter` narrows the run to tables whose family is a superset of the
    /// family behind the handle. Returns the interrupting entity, or none.
    pub fn run_system(
        &mut self,
        system: Entity,
        delta: f32,
        filter: Option<Entity>,
        param: Option<&dyn Any>,
    ) -> Result<Entity, Error> {
        runner::run(self, system, delta, filter, param)
    }

    /// Run one system with its rows partitioned across the worker pool.
    /// Falls back to the serial runner when no pool is configured.
    pub fn run_system_parallel(&mut self, system: Entity, delta: f32) -> Result<Entity, Error> {
        jobs::run_parallel(self, system, delta)
    }

    /// Advance one tick: run every phase in order, merging staged mutations
    /// at each phase barrier. Returns `false` once `quit` was requested.
    pub fn progress(&mut self, delta: f32) -> bool {
        self.time += delta;
        for kind in SystemKind::PHASES {
            let handles = self.lists.phase(kind).to_vec();
            for system in handles {
                let result = if self.pool.is_some() {
                    jobs::run_parallel(self, system, delta)
                } else {
                    runner::run(self, system, delta, None, None)
                };
                if let Err(error) = result {
                    log::warn!("system run failed in {kind:?}: {error}");
                }
            }
            self.merge_stages();
        }
        !self.quit
    }

    /// Replay all staged ops against the world.
    ///
    /// Called automatically at every phase barrier; hosts driving systems by
    /// hand call it to make staged writes visible.
    pub fn merge_stages(&mut self) {
        let ops = self.stage.drain();
        if !ops.is_empty() {
            self.replay(vec![ops]);
        }
    }

    /// Replay op batches in batch order, grouped per entity, entities
    /// ascending, preserving arrival order within an entity.
    pub(crate) fn replay(&mut self, batches: Vec<Vec<(Entity, StagedOp)>>) {
        let mut pending: BTreeMap<Entity, Vec<StagedOp>> = BTreeMap::new();
        for batch in batches {
            for (entity, op) in batch {
                pending.entry(entity).or_default().push(op);
            }
        }

        for (entity, ops) in pending {
            let mut target = self
                .index
                .get(entity)
                .map_or(FamilyId::EMPTY, |l| l.family());
            let mut deleted = false;
            let mut writes: Vec<(Entity, Vec<u8>)> = Vec::new();

            for op in ops {
                match op {
                    StagedOp::New { family } => match self.family_from_handle(family) {
                        Ok(family) => {
                            target =
                                self.families
                                    .merge(target, family, FamilyId::EMPTY, &self.index);
                            deleted = false;
                        }
                        Err(error) => log::warn!("dropping staged spawn: {error}"),
                    },
                    StagedOp::Delete => {
                        deleted = true;
                        target = FamilyId::EMPTY;
                        writes.clear();
                    }
                    StagedOp::Add { component } => match self.family_from_handle(component) {
                        Ok(family) => {
                            target =
                                self.families
                                    .merge(target, family, FamilyId::EMPTY, &self.index);
                            deleted = false;
                        }
                        Err(error) => log::warn!("dropping staged add: {error}"),
                    },
                    StagedOp::Remove { component } => match self.family_from_handle(component) {
                        Ok(family) => {
                            target =
                                self.families
                                    .merge(target, FamilyId::EMPTY, family, &self.index);
                        }
                        Err(error) => log::warn!("dropping staged remove: {error}"),
                    },
                    StagedOp::Set { component, data } => {
                        match self.family_from_handle(component) {
                            Ok(family) => {
                                target = self.families.merge(
                                    target,
                                    family,
                                    FamilyId::EMPTY,
                                    &self.index,
                                );
                                writes.push((component, data));
                                deleted = false;
                            }
                            Err(error) => log::warn!("dropping staged set: {error}"),
                        }
                    }
                }
            }

            if deleted {
                if self.index.contains(entity) {
                    self.commit(entity, FamilyId::EMPTY);
                } else {
                    log::warn!("dropping staged delete of dead entity {entity:?}");
                }
                continue;
            }

            self.commit(entity, target);
            for (component, data) in writes {
                if let Err(error) = self.set_component(entity, component, &data) {
                    log::warn!("dropping staged set on {entity:?}: {error}");
                }
            }
        }
    }

    /// Resolve a handle to a family: a declared family resolves to its
    /// interned id, any live entity (component, prefab) to the
    /// single-member family containing it.
    pub(crate) fn family_from_handle(&mut self, handle: Entity) -> Result<FamilyId, Error> {
        if handle.is_none() {
            return Ok(FamilyId::EMPTY);
        }
        if let Some(family) = self.family_handles.get(&handle) {
            return Ok(*family);
        }
        if self.index.contains(handle) {
            return Ok(self.families.register(handle, &[], &self.index));
        }
        Err(Error::InvalidEntity(handle))
    }

    /// Get (or lazily materialize) the table for a family. New tables are
    /// announced to every table-kind system for matching.
    pub(crate) fn table_for(&mut self, family: FamilyId) -> TableId {
        if let Some(table_id) = self.tables.find(family) {
            return table_id;
        }

        let members = self.families.members(family).to_vec();
        let infos: Vec<ComponentInfo> = members
            .iter()
            .map(|m| self.component_info(*m).unwrap_or(ComponentInfo::MARKER))
            .collect();
        let table_id = self.tables.create(family, members, &infos);

        for sys_index in 0..self.systems.len() {
            let (kind, already_matched) = {
                let record = self.systems.at(sys_index);
                (record.kind, record.matched.contains(table_id.index()))
            };
            if kind.is_row_kind() || already_matched {
                continue;
            }
            let matches = {
                let record = self.systems.at(sys_index);
                matcher::match_table(&self.families, &self.index, &self.tables, table_id, record)
            };
            if matches {
                let World {
                    systems,
                    families,
                    index,
                    tables,
                    ..
                } = self;
                matcher::add_table(families, index, tables, table_id, systems.at_mut(sys_index));
            }
        }

        table_id
    }

    /// The entity-move commit: relocate an entity to a new family.
    ///
    /// Copies the byte intersection of the old and new families, swap-deletes
    /// the old row (rewriting exactly the displaced entity's index entry),
    /// updates the index, flips table activation where row counts crossed
    /// empty, and fires `OnRemove` (before the move, row still readable) and
    /// `OnAdd` (after) for the family difference.
    pub(crate) fn commit(&mut self, entity: Entity, new_family: FamilyId) {
        let old_location = self.index.get(entity);
        let old_family = old_location.map_or(FamilyId::EMPTY, |l| l.family());
        if old_family == new_family {
            return;
        }

        let lost = self
            .families
            .merge(old_family, FamilyId::EMPTY, new_family, &self.index);
        let gained = self
            .families
            .merge(new_family, FamilyId::EMPTY, old_family, &self.index);

        if let Some(location) = old_location {
            if !lost.is_empty() {
                self.notify_rows(SystemKind::OnRemove, location, lost);
            }
        }

        let mut destination = None;
        if !new_family.is_empty() {
            let table_id = self.table_for(new_family);
            let row = self.tables.get_mut(table_id).insert(entity);
            destination = Some((table_id, row));
        }

        if let (Some(old_loc), Some((dst_id, dst_row))) = (old_location, destination) {
            let src_id = self
                .tables
                .find(old_loc.family())
                .expect("live entity must have a table");
            let shared: Vec<Entity> = self
                .families
                .members(old_family)
                .iter()
                .copied()
                .filter(|m| self.families.members(new_family).binary_search(m).is_ok())
                .collect();
            for component in shared {
                let bytes = self
                    .tables
                    .get(src_id)
                    .cell(old_loc.row(), component)
                    .map(|b| b.to_vec());
                if let Some(bytes) = bytes {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.tables
                        .get_mut(dst_id)
                        .cell_mut(dst_row, component)
                        .expect("shared member must exist in the destination")
                        .copy_from_slice(&bytes);
                }
            }
        }

        if let Some(old_loc) = old_location {
            let src_id = self
                .tables
                .find(old_loc.family())
                .expect("live entity must have a table");
            let source = self.tables.get_mut(src_id);
            let moved = source.delete(old_loc.row());
            let emptied = source.is_empty();
            if let Some(moved_entity) = moved {
                self.index
                    .insert(moved_entity, Location::new(old_loc.family(), old_loc.row()));
            }
            if emptied {
                self.table_fill_changed(src_id, false);
            }
        }

        match destination {
            Some((table_id, row)) => {
                self.index.insert(entity, Location::new(new_family, row));
                if self.tables.get(table_id).len() == 1 {
                    self.table_fill_changed(table_id, true);
                }
            }
            None => {
                self.index.remove(entity);
            }
        }

        if !gained.is_empty() {
            if let Some(location) = self.index.get(entity) {
                self.notify_rows(SystemKind::OnAdd, location, gained);
            }
        }
    }

    /// A table crossed the empty boundary: flip its descriptors in every
    /// interested system and toggle phase membership where a system's active
    /// count crossed zero.
    fn table_fill_changed(&mut self, table_id: TableId, active: bool) {
        let interested: Vec<Entity> = self.tables.get(table_id).frame_systems().to_vec();
        for handle in interested {
            let Some(sys_index) = self.systems.index_of(handle) else {
                continue;
            };
            let (kind, enabled, flip) = {
                let record = self.systems.at_mut(sys_index);
                let kind = record.kind;
                let enabled = record.enabled;
                (kind, enabled, matcher::activate_table(record, table_id, active))
            };
            if !kind.is_phase() {
                continue;
            }
            match flip {
                Some(Flip::Activated) if enabled => {
                    self.lists.activate(handle, kind, true);
                    self.restore_phase_order(kind);
                }
                Some(Flip::Deactivated) => self.lists.activate(handle, kind, false),
                _ => {}
            }
        }
    }

    /// Reactivation appends, but systems must run in registration order
    /// within their phase; arena order is registration order.
    fn restore_phase_order(&mut self, kind: SystemKind) {
        let systems = &self.systems;
        self.lists
            .phase_mut(kind)
            .sort_by_key(|handle| systems.index_of(*handle).unwrap_or(usize::MAX));
    }

    /// Run the row systems of one kind over a single entity row.
    fn notify_rows(&mut self, kind: SystemKind, location: Location, changed: FamilyId) {
        let handles = self.lists.row_list(kind).to_vec();
        if handles.is_empty() {
            return;
        }
        let Some(table_id) = self.tables.find(location.family()) else {
            return;
        };

        for handle in handles {
            let Some(sys_index) = self.systems.index_of(handle) else {
                continue;
            };
            let layout = {
                let record = self.systems.at(sys_index);
                if !record.enabled {
                    continue;
                }
                row_layout(
                    record,
                    &self.families,
                    &self.index,
                    &self.tables,
                    table_id,
                    changed,
                )
            };
            let Some((offsets, sizes, comps)) = layout else {
                continue;
            };

            let World {
                systems,
                tables,
                stage,
                allocator,
                ..
            } = self;
            let record = systems.at(sys_index);
            let table = tables.get_mut(table_id);
            let stride = table.stride();
            let entities_ptr = table.entities().as_ptr();
            let rows_ptr = table.rows_mut().as_mut_ptr();
            // SAFETY: a single-row batch over a live row; structural writes
            // from the action are staged, never applied mid-call, so the raw
            // parts stay valid. Entities and rows are disjoint fields.
            let entities = unsafe {
                std::slice::from_raw_parts(entities_ptr.add(location.row() as usize), 1)
            };
            let rows = unsafe { rows_ptr.add(location.row() as usize * stride) };

            let mut batch = Batch::new(
                record.handle,
                0.0,
                None,
                entities,
                rows,
                1,
                stride,
                &offsets,
                &sizes,
                &comps,
                &[],
                &[],
                stage,
                allocator,
            );
            (record.action)(&mut batch);
        }
    }
}

/// Match a row system against one table and compute its column layout for a
/// single-row invocation. `None` when the system does not apply, including
/// when none of its columns intersect the changed family.
fn row_layout(
    record: &SystemRecord,
    families: &Families,
    index: &EntityIndex,
    tables: &Tables,
    table_id: TableId,
    changed: FamilyId,
) -> Option<(Vec<i32>, Vec<u32>, Vec<Entity>)> {
    let table = tables.get(table_id);
    let table_family = table.family();

    let mut offsets = Vec::with_capacity(record.columns.len());
    let mut sizes = Vec::with_capacity(record.columns.len());
    let mut comps = Vec::with_capacity(record.columns.len());
    let mut relevant = false;

    for column in &record.columns {
        match (column.source, column.op) {
            (Source::Entity, Op::And) => {
                let component = column.component();
                if !families.contains_component(table_family, component, true, index) {
                    return None;
                }
                if families.contains_component(changed, component, false, index) {
                    relevant = true;
                }
                let offset = table.column_offset(component);
                if offset >= 0 {
                    offsets.push(offset);
                    sizes.push(matcher::component_size(index, tables, component));
                    comps.push(component);
                } else {
                    offsets.push(0);
                    sizes.push(0);
                    comps.push(Entity::NONE);
                }
            }
            (Source::Entity, Op::Optional) => {
                let component = column.component();
                if families.contains_component(changed, component, false, index) {
                    relevant = true;
                }
                let offset = table.column_offset(component);
                if offset >= 0 {
                    offsets.push(offset);
                    sizes.push(matcher::component_size(index, tables, component));
                    comps.push(component);
                } else {
                    offsets.push(0);
                    sizes.push(0);
                    comps.push(Entity::NONE);
                }
            }
            (Source::Entity, Op::Not) => {
                if families.contains_component(table_family, column.component(), false, index) {
                    return None;
                }
                offsets.push(0);
                sizes.push(0);
                comps.push(Entity::NONE);
            }
            // Row notifications carry no system/container/handle data.
            _ => {
                offsets.push(0);
                sizes.push(0);
                comps.push(Entity::NONE);
            }
        }
    }

    if relevant {
        Some((offsets, sizes, comps))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn world_with_ab() -> (World, Entity, Entity) {
        let mut world = World::new();
        let a = world.register_component("A", 4);
        let b = world.register_component("B", 4);
        (world, a, b)
    }

    /// Every live entity owns exactly one row, and that row names it back.
    fn assert_sole_rows(world: &World) {
        let mut rows = 0usize;
        for table in world.tables.iter() {
            rows += table.len();
        }
        assert_eq!(rows, world.index.len());
        for (entity, location) in world.index.iter() {
            let table_id = world.tables.find(location.family()).unwrap();
            assert_eq!(world.tables.get(table_id).entity(location.row()), Some(entity));
        }
    }

    #[test]
    fn metadata_demo() {
        // Given - the §8(a) scenario: Position(8), Speed(4), one entity
        let mut world = World::new();
        let position = world.register_component("Position", 8);
        let speed = world.register_component("Speed", 4);
        let object = world.declare_family("Object", &[position, speed]).unwrap();

        let seen: Arc<Mutex<Vec<(usize, usize, f32, Vec<i32>, usize)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        world
            .new_system("Metadata", SystemKind::OnFrame, "Position, Speed", move |batch| {
                sink.lock().unwrap().push((
                    batch.column_count(),
                    batch.row_count(),
                    batch.delta_time(),
                    batch.columns().to_vec(),
                    batch.stride(),
                ));
            })
            .unwrap();

        world.new_entity(object).unwrap();

        // When
        world.progress(0.5);

        // Then - invoked once, 2 columns at 0 and 8, one 12-byte row padded
        // to the 8-byte alignment of Position
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (columns, rows, delta, offsets, stride) = seen[0].clone();
        assert_eq!(columns, 2);
        assert_eq!(rows, 1);
        assert_eq!(delta, 0.5);
        assert_eq!(offsets, vec![0, 8]);
        assert_eq!(stride, 16);
    }

    #[test]
    fn filter_narrows_the_run() {
        // Given - the §8(b) scenario: families {A} and {A,B}
        let (mut world, a, b) = world_with_ab();
        let just_b = world.declare_family("JustB", &[b]).unwrap();
        let both = world.declare_family("Both", &[a, b]).unwrap();

        let e1 = world.new_entity(a).unwrap();
        let e2 = world.new_entity(both).unwrap();

        let visited: Arc<Mutex<Vec<Entity>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&visited);
        let system = world
            .new_system("NeedsA", SystemKind::OnDemand, "A", move |batch| {
                sink.lock().unwrap().extend_from_slice(batch.entities());
            })
            .unwrap();

        // When - filtered by family {B}
        world.run_system(system, 0.0, Some(just_b), None).unwrap();

        // Then - only the {A,B} entity was visited
        assert_eq!(*visited.lock().unwrap(), vec![e2]);

        // When - unfiltered
        visited.lock().unwrap().clear();
        world.run_system(system, 0.0, None, None).unwrap();

        // Then
        let mut all = visited.lock().unwrap().clone();
        all.sort();
        assert_eq!(all, vec![e1, e2]);
    }

    #[test]
    fn prefab_reference_resolves_indirectly() {
        // Given - the §8(c) scenario: a prefab carrying Sprite
        let mut world = World::new();
        let sprite = world.register_component("Sprite", 4);
        let position = world.register_component("Position", 8);

        let prefab = world.new_prefab("Base", sprite).unwrap();
        world
            .set_component(prefab, sprite, &7u32.to_le_bytes())
            .unwrap();

        let entity = world.new_entity(position).unwrap();
        world.add_component(entity, prefab).unwrap();

        let seen: Arc<Mutex<Vec<(i32, Entity, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let system = world
            .new_system("Draw", SystemKind::OnDemand, "Sprite", move |batch| {
                for row in 0..batch.row_count() {
                    // SAFETY: Sprite was registered as 4 bytes.
                    let value: &u32 = unsafe { batch.get(row, 0) }.unwrap();
                    sink.lock().unwrap().push((
                        batch.columns()[0],
                        batch.ref_entity(0),
                        *value,
                    ));
                }
            })
            .unwrap();

        // When
        world.run_system(system, 0.0, None, None).unwrap();

        // Then - a negative offset resolved through the prefab
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (offset, source, value) = seen[0];
        assert!(offset < 0);
        assert_eq!(source, prefab);
        assert_eq!(value, 7);

        // And the component read follows the prefab chain too
        assert_eq!(
            world.get_component(entity, sprite).unwrap(),
            &7u32.to_le_bytes()
        );
    }

    #[test]
    fn interruption_stops_the_run() {
        // Given - the §8(d) scenario spread over two tables
        let (mut world, a, b) = world_with_ab();
        let both = world.declare_family("Both", &[a, b]).unwrap();
        for _ in 0..3 {
            world.new_entity(a).unwrap();
        }
        for _ in 0..2 {
            world.new_entity(both).unwrap();
        }

        let visited = Arc::new(AtomicUsize::new(0));
        let stopper = Arc::new(AtomicU64::new(0));
        let visits = Arc::clone(&visited);
        let stop = Arc::clone(&stopper);
        let system = world
            .new_system("Scan", SystemKind::OnDemand, "A", move |batch| {
                for row in 0..batch.row_count() {
                    if visits.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        batch.interrupted_by = batch.entity(row);
                        stop.store(batch.entity(row).raw(), Ordering::SeqCst);
                        return;
                    }
                }
            })
            .unwrap();

        // When
        let interrupted = world.run_system(system, 0.0, None, None).unwrap();

        // Then - the third row interrupted and the second table never ran
        assert_eq!(interrupted.raw(), stopper.load(Ordering::SeqCst));
        assert!(interrupted.is_some());
        assert_eq!(visited.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn activation_hysteresis() {
        // Given - the §8(e) scenario
        let (mut world, a, _) = world_with_ab();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        world
            .new_system("Tick", SystemKind::OnFrame, "A", move |_batch| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // When - no entities yet
        world.progress(0.1);

        // Then - the system is inactive and never ran
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // When - a row appears
        let entity = world.new_entity(a).unwrap();
        world.progress(0.1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // When - the table empties again
        world.delete_entity(entity).unwrap();
        world.progress(0.1);
        world.progress(0.1);

        // Then - deactivated, skipped by progress
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // When - respawning reactivates
        world.new_entity(a).unwrap();
        world.progress(0.1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn staged_add_lands_at_the_barrier() {
        // Given - the §8(f) scenario
        let (mut world, a, b) = world_with_ab();
        let entity = world.new_entity(a).unwrap();
        let family_before = world.entity_family(entity).unwrap();

        let seen_columns: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen_columns);
        world
            .new_system("Grow", SystemKind::OnFrame, "A", move |batch| {
                sink.lock().unwrap().push(batch.stride());
                for row in 0..batch.row_count() {
                    batch.add_component(batch.entity(row), b);
                }
            })
            .unwrap();

        // When
        world.progress(0.1);

        // Then - the action saw the pre-add layout (one 4-byte column)
        assert_eq!(seen_columns.lock().unwrap()[0], 4);

        // And after the barrier the family gained B
        let family_after = world.entity_family(entity).unwrap();
        assert_ne!(family_before, family_after);
        assert!(world.get_component(entity, b).is_some());
        assert_sole_rows(&world);
    }

    #[test]
    fn add_remove_round_trips_the_family() {
        // Given
        let (mut world, a, b) = world_with_ab();
        let entity = world.new_entity(a).unwrap();
        let original = world.entity_family(entity).unwrap();

        // When - add then remove
        world.add_component(entity, b).unwrap();
        world.remove_component(entity, b).unwrap();

        // Then - family id restored
        assert_eq!(world.entity_family(entity), Some(original));

        // And adding twice equals adding once
        world.add_component(entity, b).unwrap();
        let once = world.entity_family(entity).unwrap();
        world.add_component(entity, b).unwrap();
        assert_eq!(world.entity_family(entity), Some(once));
        assert_sole_rows(&world);
    }

    #[test]
    fn moves_copy_shared_bytes_and_rewrite_one_entry() {
        // Given - three entities so swap-remove displaces one
        let (mut world, a, b) = world_with_ab();
        let e1 = world.new_entity(a).unwrap();
        let e2 = world.new_entity(a).unwrap();
        let e3 = world.new_entity(a).unwrap();
        world.set_component(e1, a, &11u32.to_le_bytes()).unwrap();
        world.set_component(e2, a, &22u32.to_le_bytes()).unwrap();
        world.set_component(e3, a, &33u32.to_le_bytes()).unwrap();

        // When - move the first entity out of the family
        world.add_component(e1, b).unwrap();

        // Then - its value moved with it and everyone else kept theirs
        assert_eq!(world.get_component(e1, a).unwrap(), &11u32.to_le_bytes());
        assert_eq!(world.get_component(e2, a).unwrap(), &22u32.to_le_bytes());
        assert_eq!(world.get_component(e3, a).unwrap(), &33u32.to_le_bytes());
        assert_sole_rows(&world);

        // When - delete in the middle
        world.delete_entity(e2).unwrap();

        // Then
        assert!(!world.is_alive(e2));
        assert_eq!(world.get_component(e3, a).unwrap(), &33u32.to_le_bytes());
        assert_sole_rows(&world);
    }

    #[test]
    fn periodic_system_runs_on_accumulated_time() {
        // Given - period 1.0, ticks of 0.4
        let (mut world, a, _) = world_with_ab();
        world.new_entity(a).unwrap();

        let deltas: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deltas);
        let system = world
            .new_system("Slow", SystemKind::OnFrame, "A", move |batch| {
                sink.lock().unwrap().push(batch.delta_time());
            })
            .unwrap();
        world.set_period(system, 1.0).unwrap();

        // When - 5 * 0.4 = 2.0 seconds
        for _ in 0..5 {
            world.progress(0.4);
        }

        // Then - ran floor(2.0 / 1.0) = 2 times, seeing accumulated time
        let deltas = deltas.lock().unwrap();
        assert_eq!(deltas.len(), 2);
        assert!((deltas[0] - 1.2).abs() < 1e-6);
        assert!((deltas[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn long_pause_clamps_the_periodic_accumulator() {
        // Given
        let (mut world, a, _) = world_with_ab();
        world.new_entity(a).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let system = world
            .new_system("Slow", SystemKind::OnDemand, "A", move |_batch| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        world.set_period(system, 1.0).unwrap();

        // When - a single 5-second pause
        world.run_system(system, 5.0, None, None).unwrap();

        // Then - ran once and forfeited the surplus
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(world.systems.get(system).unwrap().time_passed, 0.0);
    }

    #[test]
    fn row_systems_fire_on_add_set_remove() {
        // Given
        let (mut world, a, _) = world_with_ab();

        let added = Arc::new(AtomicUsize::new(0));
        let set = Arc::new(AtomicUsize::new(0));
        let removed_value = Arc::new(AtomicU64::new(u64::MAX));

        let adds = Arc::clone(&added);
        world
            .new_system("Init", SystemKind::OnAdd, "A", move |_batch| {
                adds.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let sets = Arc::clone(&set);
        world
            .new_system("Watch", SystemKind::OnSet, "A", move |_batch| {
                sets.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let last = Arc::clone(&removed_value);
        world
            .new_system("Deinit", SystemKind::OnRemove, "A", move |batch| {
                // SAFETY: A was registered as 4 bytes.
                let value: &u32 = unsafe { batch.get(0, 0) }.unwrap();
                last.store(*value as u64, Ordering::SeqCst);
            })
            .unwrap();

        // When
        let entity = world.new_entity(a).unwrap();

        // Then - creation fires OnAdd only
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(set.load(Ordering::SeqCst), 0);

        // When - a value write fires OnSet
        world.set_component(entity, a, &9u32.to_le_bytes()).unwrap();
        assert_eq!(set.load(Ordering::SeqCst), 1);
        assert_eq!(added.load(Ordering::SeqCst), 1);

        // When - removal fires OnRemove with the row still readable
        world.remove_component(entity, a).unwrap();
        assert_eq!(removed_value.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn running_a_row_kind_system_is_a_no_op_on_both_paths() {
        // Given - row kinds never match tables, they run from the move
        // protocol
        let (mut world, a, _) = world_with_ab();
        world.set_threads(2);

        let fired = Arc::new(AtomicUsize::new(0));
        let adds = Arc::clone(&fired);
        let on_add = world
            .new_system("Init", SystemKind::OnAdd, "A", move |_batch| {
                adds.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let sets = Arc::clone(&fired);
        let on_set = world
            .new_system("Watch", SystemKind::OnSet, "A", move |_batch| {
                sets.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // When - driven by hand through both runner paths
        let serial = world.run_system(on_add, 0.0, None, None).unwrap();
        let parallel = world.run_system_parallel(on_add, 0.0).unwrap();

        // Then - both agree on the no-op instead of one erroring
        assert!(serial.is_none());
        assert!(parallel.is_none());
        assert!(world.run_system_parallel(on_set, 0.0).unwrap().is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // And the systems still fire through the move protocol
        let entity = world.new_entity(a).unwrap();
        world.set_component(entity, a, &1u32.to_le_bytes()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn or_columns_match_either_component() {
        // Given
        let mut world = World::new();
        let position = world.register_component("Position", 8);
        let walking = world.register_component("Walking", 4);
        let running = world.register_component("Running", 4);

        let walker_family = world.declare_family("Walker", &[position, walking]).unwrap();
        let runner_family = world.declare_family("Runner", &[position, running]).unwrap();

        let walker = world.new_entity(walker_family).unwrap();
        let runner = world.new_entity(runner_family).unwrap();
        let idle = world.new_entity(position).unwrap();

        let visited: Arc<Mutex<Vec<(Entity, Entity)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&visited);
        let system = world
            .new_system(
                "Move",
                SystemKind::OnDemand,
                "Position, Walking|Running",
                move |batch| {
                    for row in 0..batch.row_count() {
                        sink.lock().unwrap().push((batch.entity(row), batch.component(1)));
                    }
                },
            )
            .unwrap();

        // When
        world.run_system(system, 0.0, None, None).unwrap();

        // Then - both movers visited with the matched component, idle not
        let mut visited = visited.lock().unwrap().clone();
        visited.sort();
        assert_eq!(visited, vec![(walker, walking), (runner, running)]);
        let _ = idle;
    }

    #[test]
    fn not_and_optional_columns() {
        // Given
        let mut world = World::new();
        let position = world.register_component("Position", 8);
        let speed = world.register_component("Speed", 4);
        let frozen = world.register_component("Frozen", 0);

        let plain = world.new_entity(position).unwrap();
        let fast_family = world.declare_family("Fast", &[position, speed]).unwrap();
        let fast = world.new_entity(fast_family).unwrap();
        let frozen_family = world.declare_family("Cold", &[position, frozen]).unwrap();
        let cold = world.new_entity(frozen_family).unwrap();

        let visited: Arc<Mutex<Vec<(Entity, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&visited);
        let system = world
            .new_system(
                "Move",
                SystemKind::OnDemand,
                "Position, ?Speed, !Frozen",
                move |batch| {
                    for row in 0..batch.row_count() {
                        // SAFETY: Speed was registered as 4 bytes.
                        let speed: Option<&u32> = unsafe { batch.get(row, 1) };
                        sink.lock().unwrap().push((batch.entity(row), speed.is_some()));
                    }
                },
            )
            .unwrap();

        // When
        world.run_system(system, 0.0, None, None).unwrap();

        // Then - frozen entity skipped; the optional column only reads where
        // present
        let mut visited = visited.lock().unwrap().clone();
        visited.sort();
        assert_eq!(visited, vec![(plain, false), (fast, true)]);
        assert!(!visited.iter().any(|(e, _)| *e == cold));
    }

    #[test]
    fn system_source_reads_the_system_entity() {
        // Given - a system that carries its own Tick counter
        let mut world = World::new();
        let position = world.register_component("Position", 8);
        let tick = world.register_component("Tick", 4);
        world.new_entity(position).unwrap();

        let seen: Arc<Mutex<Vec<(Entity, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let system = world
            .new_system(
                "Ticker",
                SystemKind::OnDemand,
                "Position, SYSTEM.Tick",
                move |batch| {
                    // SAFETY: Tick was registered as 4 bytes.
                    let value: &u32 = unsafe { batch.get(0, 1) }.unwrap();
                    sink.lock().unwrap().push((batch.ref_entity(1), *value));
                },
            )
            .unwrap();

        // The SYSTEM.-sourced component lives on the system's own entity.
        assert!(world.is_alive(system));
        world.set_component(system, tick, &41u32.to_le_bytes()).unwrap();

        // When
        world.run_system(system, 0.0, None, None).unwrap();

        // Then
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (system, 41));
    }

    #[test]
    fn container_source_reads_a_components_component() {
        // Given - the Position component entity itself carries Mass
        let mut world = World::new();
        let position = world.register_component("Position", 8);
        let mass = world.register_component("Mass", 4);
        world.add_component(position, mass).unwrap();
        world.set_component(position, mass, &5u32.to_le_bytes()).unwrap();

        world.new_entity(position).unwrap();

        let seen: Arc<Mutex<Vec<(Entity, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let system = world
            .new_system(
                "Weigh",
                SystemKind::OnDemand,
                "Position, CONTAINER.Mass",
                move |batch| {
                    // SAFETY: Mass was registered as 4 bytes.
                    let value: &u32 = unsafe { batch.get(0, 1) }.unwrap();
                    sink.lock().unwrap().push((batch.ref_entity(1), *value));
                },
            )
            .unwrap();

        // When
        world.run_system(system, 0.0, None, None).unwrap();

        // Then - the ref source is the component entity
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (position, 5));
    }

    #[test]
    fn handle_columns_carry_no_data() {
        // Given
        let (mut world, a, b) = world_with_ab();
        world.new_entity(a).unwrap();

        let seen: Arc<Mutex<Vec<(Entity, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let system = world
            .new_system("Tag", SystemKind::OnDemand, "A, ID.B", move |batch| {
                // SAFETY: B was registered as 4 bytes.
                let data: Option<&u32> = unsafe { batch.get(0, 1) };
                sink.lock().unwrap().push((batch.component(1), data.is_some()));
            })
            .unwrap();

        // When
        world.run_system(system, 0.0, None, None).unwrap();

        // Then - the handle arrives, no data does
        assert_eq!(*seen.lock().unwrap(), vec![(b, false)]);
    }

    #[test]
    fn staged_spawn_and_delete_replay_at_the_barrier() {
        // Given
        let (mut world, a, _) = world_with_ab();
        let victim = world.new_entity(a).unwrap();

        let spawned: Arc<Mutex<Vec<Entity>>> = Arc::new(Mutex::new(Vec::new()));
        let once = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&spawned);
        let gate = Arc::clone(&once);
        world
            .new_system("Churn", SystemKind::OnFrame, "A", move |batch| {
                if gate.fetch_add(1, Ordering::SeqCst) == 0 {
                    let fresh = batch.spawn(batch.component(0));
                    sink.lock().unwrap().push(fresh);
                    batch.delete(victim);
                }
            })
            .unwrap();

        // When
        world.progress(0.1);

        // Then - the spawn and the delete both landed at the barrier
        let fresh = spawned.lock().unwrap()[0];
        assert!(world.is_alive(fresh));
        assert!(!world.is_alive(victim));
        assert_sole_rows(&world);
    }

    #[test]
    fn parallel_run_visits_every_row_once() {
        // Given - rows spread over two tables and two workers
        let (mut world, a, b) = world_with_ab();
        let both = world.declare_family("Both", &[a, b]).unwrap();
        let mut entities = Vec::new();
        for i in 0..40u32 {
            let family = if i % 2 == 0 { a } else { both };
            let entity = world.new_entity(family).unwrap();
            world.set_component(entity, a, &i.to_le_bytes()).unwrap();
            entities.push(entity);
        }
        world.set_threads(2);

        let system = world
            .new_system("Bump", SystemKind::OnDemand, "A", |batch| {
                for row in 0..batch.row_count() {
                    // SAFETY: A was registered as 4 bytes.
                    let value: &mut u32 = unsafe { batch.get_mut(row, 0) }.unwrap();
                    *value += 100;
                }
            })
            .unwrap();

        // When
        let interrupted = world.run_system_parallel(system, 0.0).unwrap();

        // Then - every row bumped exactly once
        assert!(interrupted.is_none());
        for (i, entity) in entities.iter().enumerate() {
            let bytes = world.get_component(*entity, a).unwrap();
            assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), i as u32 + 100);
        }
    }

    #[test]
    fn registration_errors() {
        // Given
        let (mut world, _, _) = world_with_ab();

        // Then - unknown identifier
        let result = world.new_system("Bad", SystemKind::OnFrame, "Missing", |_| {});
        assert_eq!(result, Err(Error::NotRegistered("Missing".into())));

        // Then - malformed signature
        let result = world.new_system("Worse", SystemKind::OnFrame, "A,", |_| {});
        assert!(matches!(result, Err(Error::Signature { .. })));

        // Then - a system that matches nothing is a run precondition failure
        let zed = world.register_component("Zed", 4);
        let system = world
            .new_system("Lonely", SystemKind::OnDemand, "Zed", |_| {})
            .unwrap();
        assert_eq!(
            world.run_system(system, 0.0, None, None),
            Err(Error::NoMatch(system))
        );
        let _ = zed;

        // Then - running an unknown handle
        let bogus = Entity::from_raw(9999);
        assert_eq!(
            world.run_system(bogus, 0.0, None, None),
            Err(Error::InvalidEntity(bogus))
        );

        // Then - deleting a dead entity
        assert_eq!(
            world.delete_entity(bogus),
            Err(Error::InvalidEntity(bogus))
        );
    }

    #[test]
    fn disabled_systems_do_not_run() {
        // Given
        let (mut world, a, _) = world_with_ab();
        world.new_entity(a).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let system = world
            .new_system("Gated", SystemKind::OnFrame, "A", move |_batch| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // When
        world.enable(system, false).unwrap();
        world.progress(0.1);
        world.enable(system, true).unwrap();
        world.progress(0.1);

        // Then
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_runs_phases_in_order_and_honors_quit() {
        // Given - one system per phase, recording its phase name
        let (mut world, a, _) = world_with_ab();
        world.new_entity(a).unwrap();

        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        for (kind, label) in [
            (SystemKind::PostFrame, "post_frame"),
            (SystemKind::OnFrame, "on_frame"),
            (SystemKind::PreFrame, "pre_frame"),
            (SystemKind::OnStore, "on_store"),
            (SystemKind::OnLoad, "on_load"),
        ] {
            let sink = Arc::clone(&order);
            world
                .new_system(label, kind, "A", move |_batch| {
                    sink.lock().unwrap().push(label);
                })
                .unwrap();
        }

        // When
        assert!(world.progress(0.1));

        // Then - tick order, not registration order
        assert_eq!(
            *order.lock().unwrap(),
            vec!["pre_frame", "on_load", "on_frame", "on_store", "post_frame"]
        );

        // When - quit is requested
        world.quit();
        assert!(!world.progress(0.1));
    }

    #[test]
    fn families_render_through_the_name_registry() {
        // Given
        let mut world = World::new();
        let position = world.register_component("Position", 8);
        let speed = world.register_component("Speed", 4);
        let object = world.declare_family("Object", &[position, speed]).unwrap();

        // When
        let entity = world.new_entity(object).unwrap();
        let family = world.entity_family(entity).unwrap();

        // Then
        assert_eq!(world.describe_family(family), "Position, Speed");
        assert_eq!(world.describe_family(FamilyId::EMPTY), "");
    }

    #[test]
    fn component_metadata_lives_in_rows() {
        // Given
        let mut world = World::new();
        let position = world.register_component("Position", 8);

        // Then - the component entity is alive and self-describing
        assert!(world.is_alive(position));
        assert_eq!(
            world.component_info(position),
            Some(ComponentInfo { size: 8, align: 8 })
        );
        assert_eq!(
            world.component_info(COMPONENT),
            Some(ComponentInfo::META)
        );
        assert_eq!(world.name_of(position).as_deref(), Some("Position"));

        // And re-registration returns the same handle
        assert_eq!(world.register_component("Position", 8), position);
    }

    #[test]
    fn measured_time_accumulates_only_when_enabled() {
        // Given
        let (mut world, a, _) = world_with_ab();
        world.new_entity(a).unwrap();
        let system = world
            .new_system("Busy", SystemKind::OnDemand, "A", |_batch| {})
            .unwrap();

        // When - measurement off
        world.run_system(system, 0.0, None, None).unwrap();
        assert_eq!(world.time_spent(system).unwrap(), 0.0);

        // When - measurement on
        world.measure_system_time(true);
        world.run_system(system, 0.0, None, None).unwrap();

        // Then
        assert!(world.time_spent(system).unwrap() >= 0.0);
    }
}
