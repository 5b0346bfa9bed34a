//! System records, matching, and execution.
//!
//! A system is a user callback plus a parsed signature. At registration the
//! matcher derives the system's And/Not families, tests every table, and
//! precomputes one descriptor per match: the column byte offsets (or
//! indirect reference slots) that let the runner iterate the table at full
//! speed without touching the registries again.

pub(crate) mod matcher;
pub(crate) mod runner;

pub use runner::Batch;

use std::collections::HashMap;

use fixedbitset::FixedBitSet;

use crate::{
    entity::Entity,
    family::FamilyId,
    signature::{Op, Source},
    storage::TableId,
};

/// When a system runs.
///
/// The first seven kinds are frame phases in tick order. `OnDemand` systems
/// are matched against tables but only run explicitly. The row kinds run as
/// part of the entity-move protocol, over single rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    /// Before anything else in the tick.
    PreFrame,
    /// Loading work, before the main frame.
    OnLoad,
    /// After loading, before the main frame.
    PostLoad,
    /// The main frame phase.
    OnFrame,
    /// Storing work, after the main frame.
    OnStore,
    /// After storing.
    PostStore,
    /// The end of the tick.
    PostFrame,
    /// Never auto-run; invoked through `run_system`.
    OnDemand,
    /// Runs when a matching component is added to an entity.
    OnAdd,
    /// Runs when a matching component is about to be removed.
    OnRemove,
    /// Runs when a matching component's value is set.
    OnSet,
}

impl SystemKind {
    /// The frame phases in tick order.
    pub const PHASES: [SystemKind; 7] = [
        SystemKind::PreFrame,
        SystemKind::OnLoad,
        SystemKind::PostLoad,
        SystemKind::OnFrame,
        SystemKind::OnStore,
        SystemKind::PostStore,
        SystemKind::PostFrame,
    ];

    /// Whether systems of this kind run automatically during a tick.
    #[inline]
    pub fn is_phase(&self) -> bool {
        !matches!(
            self,
            SystemKind::OnDemand | SystemKind::OnAdd | SystemKind::OnRemove | SystemKind::OnSet
        )
    }

    /// Whether systems of this kind run over single rows from the
    /// entity-move protocol instead of matched tables.
    #[inline]
    pub fn is_row_kind(&self) -> bool {
        matches!(
            self,
            SystemKind::OnAdd | SystemKind::OnRemove | SystemKind::OnSet
        )
    }
}

/// What a column names: a single component, or a family for Or groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Referent {
    /// A component handle.
    Component(Entity),
    /// An interned Or-group family.
    Family(FamilyId),
}

/// One parsed signature column.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Where the data comes from.
    pub source: Source,
    /// How the column participates in matching.
    pub op: Op,
    /// The component or Or family the column names.
    pub referent: Referent,
}

impl Column {
    /// The component handle, for non-Or columns.
    ///
    /// # Panics
    /// Panics on Or columns; those carry a family.
    pub fn component(&self) -> Entity {
        match self.referent {
            Referent::Component(c) => c,
            Referent::Family(_) => panic!("OR column carries a family, not a component"),
        }
    }

    /// The Or family, for Or columns.
    pub fn family(&self) -> FamilyId {
        match self.referent {
            Referent::Family(f) => f,
            Referent::Component(_) => panic!("column carries a component, not a family"),
        }
    }
}

/// An indirect data source: the datum for a column lives on another entity
/// (a prefab, a container component, or the system itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ref {
    /// The entity owning the data.
    pub entity: Entity,
    /// The component to read on that entity.
    pub component: Entity,
}

/// One precomputed (system, table) match.
///
/// `offsets` has one entry per signature column: a non-negative byte offset
/// into this table's rows for direct columns, or `-(1 + i)` where `i`
/// indexes into the refs block for indirect columns. Columns with no data
/// (Not, absent Optional, handle-only) carry offset 0 and a none component
/// handle in the components row.
#[derive(Debug, Clone)]
pub struct TableRecord {
    /// The matched table.
    pub table: TableId,
    /// 1-based index into the system's refs blocks; 0 means no refs.
    pub refs_index: usize,
    /// Index into the system's per-descriptor component-handle rows.
    pub components_index: usize,
    /// Per-column byte offsets or negative ref slots.
    pub offsets: Vec<i32>,
    /// Per-column element sizes; 0 marks a column with no data.
    pub sizes: Vec<u32>,
}

/// The action callback invoked per matched table (or per notified row).
pub type Action = Box<dyn Fn(&mut Batch<'_>) + Send + Sync>;

/// Everything the world keeps per declared system.
pub struct SystemRecord {
    /// The system's own entity handle.
    pub handle: Entity,
    /// The system's registered name.
    pub name: String,
    /// When the system runs.
    pub kind: SystemKind,
    /// The user callback.
    pub action: Action,
    /// The parsed signature, in source order.
    pub columns: Vec<Column>,

    /// Family of all `(Entity, And)` columns; drives the superset test.
    pub and_from_entity: FamilyId,
    /// Family of all `(System, And)` columns; committed onto the system
    /// entity at registration.
    pub and_from_system: FamilyId,
    /// Family of all `(Entity, Not)` columns.
    pub not_from_entity: FamilyId,
    /// Family of all `(Component, Not)` columns.
    pub not_from_component: FamilyId,

    /// Disabled systems run nothing and accumulate nothing.
    pub enabled: bool,
    /// Run interval in seconds; 0 runs every invocation.
    pub period: f32,
    /// Time accumulated towards the next periodic run.
    pub time_passed: f32,
    /// Wall time spent in the table loop, when measurement is on.
    pub time_spent: f32,

    /// Descriptors for matched tables that currently hold rows.
    pub active_tables: Vec<TableRecord>,
    /// Descriptors for matched tables that are currently empty.
    pub inactive_tables: Vec<TableRecord>,
    /// Ref blocks, addressed 1-based by `TableRecord::refs_index`.
    pub refs: Vec<Vec<Ref>>,
    /// Component-handle rows, addressed by `TableRecord::components_index`.
    pub components: Vec<Vec<Entity>>,
    /// Tables already matched, so re-announcement never double-installs.
    pub matched: FixedBitSet,
}

impl SystemRecord {
    /// Whether the matcher ever admitted a table for this system.
    #[inline]
    pub fn has_tables(&self) -> bool {
        !self.active_tables.is_empty() || !self.inactive_tables.is_empty()
    }
}

/// The arena of registered systems, addressed by handle.
#[derive(Default)]
pub struct Systems {
    records: Vec<SystemRecord>,
    by_handle: HashMap<Entity, usize>,
}

impl Systems {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of registered systems.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no system is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Store a record, addressable by its handle.
    pub(crate) fn insert(&mut self, record: SystemRecord) -> usize {
        let index = self.records.len();
        self.by_handle.insert(record.handle, index);
        self.records.push(record);
        index
    }

    /// The arena index of a system handle.
    #[inline]
    pub(crate) fn index_of(&self, handle: Entity) -> Option<usize> {
        self.by_handle.get(&handle).copied()
    }

    /// The record of a system handle.
    #[inline]
    pub fn get(&self, handle: Entity) -> Option<&SystemRecord> {
        self.index_of(handle).map(|i| &self.records[i])
    }

    /// The record of a system handle, mutably.
    #[inline]
    pub(crate) fn get_mut(&mut self, handle: Entity) -> Option<&mut SystemRecord> {
        let index = self.index_of(handle)?;
        Some(&mut self.records[index])
    }

    /// The record at an arena index.
    #[inline]
    pub(crate) fn at(&self, index: usize) -> &SystemRecord {
        &self.records[index]
    }

    /// The record at an arena index, mutably.
    #[inline]
    pub(crate) fn at_mut(&mut self, index: usize) -> &mut SystemRecord {
        &mut self.records[index]
    }
}
