//! System/table matching and descriptor installation.
//!
//! The matcher runs at registration time (and whenever a new table is
//! materialized) and is the only place that inspects signatures against
//! family contents. Its output is the descriptor: per (system, table), one
//! offsets row that the runner consumes without any further registry work.

use crate::{
    component::{COMPONENT, ComponentInfo, PREFAB},
    entity::{Entity, EntityIndex},
    family::{Families, FamilyId},
    signature::{Op, Source},
    storage::{TableId, Tables},
    system::{Column, Ref, SystemRecord, TableRecord},
};

/// The registered element size of a component, read from its metadata row.
/// Handles without a metadata record (markers, prefabs, families) are 0.
pub(crate) fn component_size(index: &EntityIndex, tables: &Tables, component: Entity) -> u32 {
    let Some(location) = index.get(component) else {
        return 0;
    };
    let Some(table_id) = tables.find(location.family()) else {
        return 0;
    };
    tables
        .get(table_id)
        .cell(location.row(), COMPONENT)
        .map(|bytes| ComponentInfo::from_bytes(bytes).size)
        .unwrap_or(0)
}

/// The four families derived from a system's columns at registration.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DerivedFamilies {
    pub and_from_entity: FamilyId,
    pub and_from_system: FamilyId,
    pub not_from_entity: FamilyId,
    pub not_from_component: FamilyId,
}

/// Fold every column into the derived And/Not families.
pub(crate) fn derive_families(
    columns: &[Column],
    families: &mut Families,
    index: &EntityIndex,
) -> DerivedFamilies {
    let mut derived = DerivedFamilies::default();
    for column in columns {
        match (column.source, column.op) {
            (Source::Entity, Op::And) => {
                derived.and_from_entity =
                    families.add(derived.and_from_entity, column.component(), index);
            }
            (Source::System, Op::And) => {
                derived.and_from_system =
                    families.add(derived.and_from_system, column.component(), index);
            }
            (Source::Entity, Op::Not) => {
                derived.not_from_entity =
                    families.add(derived.not_from_entity, column.component(), index);
            }
            (Source::Component, Op::Not) => {
                derived.not_from_component =
                    families.add(derived.not_from_component, column.component(), index);
            }
            _ => {}
        }
    }
    derived
}

/// Search the members of `table_family` for one whose own family reaches any
/// member of `family`. Returns the reached component and its owner.
pub(crate) fn components_contains(
    families: &Families,
    index: &EntityIndex,
    table_family: FamilyId,
    family: FamilyId,
    match_all: bool,
) -> (Entity, Entity) {
    for member in families.members(table_family) {
        let Some(location) = index.get(*member) else {
            continue;
        };
        let component =
            families.contains(location.family(), family, match_all, true, index);
        if component.is_some() {
            return (component, *member);
        }
    }
    (Entity::NONE, Entity::NONE)
}

/// Search the members of `table_family` for one whose own family carries
/// `component`. Returns the owning member.
pub(crate) fn components_contains_component(
    families: &Families,
    index: &EntityIndex,
    table_family: FamilyId,
    component: Entity,
) -> Option<Entity> {
    for member in families.members(table_family) {
        let Some(location) = index.get(*member) else {
            continue;
        };
        if families.contains_component(location.family(), component, false, index) {
            return Some(*member);
        }
    }
    None
}

/// Decide whether a table satisfies a system's signature.
pub(crate) fn match_table(
    families: &Families,
    index: &EntityIndex,
    tables: &Tables,
    table_id: TableId,
    record: &SystemRecord,
) -> bool {
    let table_family = tables.get(table_id).family();

    // Prefabs are data sources, never iteration targets.
    if families.contains_component(table_family, PREFAB, false, index) {
        return false;
    }

    if !record.and_from_entity.is_empty()
        && families
            .contains(table_family, record.and_from_entity, true, true, index)
            .is_none()
    {
        return false;
    }

    for column in &record.columns {
        match (column.op, column.source) {
            // Covered by the and_from_entity superset test above.
            (Op::And, Source::Entity) => {}
            (Op::And, Source::Component) => {
                if components_contains_component(
                    families,
                    index,
                    table_family,
                    column.component(),
                )
                .is_none()
                {
                    return false;
                }
            }
            (Op::Or, Source::Entity) => {
                if families
                    .contains(table_family, column.family(), false, true, index)
                    .is_none()
                {
                    return false;
                }
            }
            (Op::Or, Source::Component) => {
                let (component, _) =
                    components_contains(families, index, table_family, column.family(), false);
                if component.is_none() {
                    return false;
                }
            }
            // System and handle columns do not constrain the table;
            // optional and not columns are handled outside the loop.
            _ => {}
        }
    }

    if !record.not_from_entity.is_empty()
        && families
            .contains(table_family, record.not_from_entity, false, true, index)
            .is_some()
    {
        return false;
    }

    if !record.not_from_component.is_empty() {
        let (component, _) = components_contains(
            families,
            index,
            table_family,
            record.not_from_component,
            false,
        );
        if component.is_some() {
            return false;
        }
    }

    true
}

/// Find the entity that actually stores `component`, starting from `entity`
/// (or from a family when no entity is given) and walking the prefab chain.
///
/// Callers must have validated that the component is reachable; failing to
/// find it is an engine invariant violation.
pub(crate) fn entity_for_component(
    families: &Families,
    index: &EntityIndex,
    entity: Entity,
    family: FamilyId,
    component: Entity,
) -> Entity {
    let mut entity = entity;
    let mut family = family;
    loop {
        if entity.is_some() {
            family = index
                .get(entity)
                .expect("ref source entity must be alive")
                .family();
        }
        if families.members(family).binary_search(&component).is_ok() {
            assert!(entity.is_some(), "component owner must be a live entity");
            return entity;
        }
        entity = families
            .prefab_of(family)
            .expect("component must be reachable through the prefab chain");
    }
}

/// Install a descriptor for a matched table.
///
/// Resolves every column to a direct byte offset or an indirect ref slot,
/// appends the descriptor to the active or inactive array by row count, and
/// registers the system on the table for activation flips.
pub(crate) fn add_table(
    families: &Families,
    index: &EntityIndex,
    tables: &mut Tables,
    table_id: TableId,
    record: &mut SystemRecord,
) {
    let table = tables.get(table_id);
    let table_family = table.family();
    let column_count = record.columns.len();

    let mut offsets = vec![0i32; column_count];
    let mut sizes = vec![0u32; column_count];
    let mut comps = vec![Entity::NONE; column_count];
    let mut refs: Vec<Ref> = Vec::new();

    for (i, column) in record.columns.iter().enumerate() {
        let mut source_entity = Entity::NONE;
        let mut component = Entity::NONE;
        let mut has_data = true;

        match column.source {
            Source::Entity => match column.op {
                Op::And => component = column.component(),
                Op::Optional => {
                    component = column.component();
                    if !families.contains_component(table_family, component, false, index) {
                        component = Entity::NONE;
                    }
                }
                Op::Or => {
                    component =
                        families.contains(table_family, column.family(), false, true, index);
                }
                Op::Not => {}
            },
            Source::Handle => {
                component = column.component();
                has_data = false;
            }
            Source::Component => match column.op {
                Op::And | Op::Optional => {
                    component = column.component();
                    if let Some(owner) =
                        components_contains_component(families, index, table_family, component)
                    {
                        source_entity = owner;
                    }
                }
                Op::Or => {
                    let (found, owner) =
                        components_contains(families, index, table_family, column.family(), false);
                    component = found;
                    source_entity = owner;
                }
                Op::Not => {}
            },
            Source::System => {
                if column.op == Op::And {
                    component = column.component();
                }
                source_entity = record.handle;
            }
        }

        if source_entity.is_none() && column.source != Source::Handle {
            if component.is_some() {
                // May come back -1 when the component is only reachable
                // through a prefab; resolved as a reference below.
                offsets[i] = table.column_offset(component);
            } else {
                offsets[i] = 0;
                has_data = false;
            }
        }

        if source_entity.is_some() || offsets[i] == -1 {
            let owner =
                entity_for_component(families, index, source_entity, table_family, component);
            refs.push(Ref {
                entity: owner,
                component,
            });
            offsets[i] = -(refs.len() as i32);
        }

        comps[i] = component;
        if has_data && component.is_some() {
            sizes[i] = component_size(index, tables, component);
        }
    }

    let refs_index = if refs.is_empty() {
        0
    } else {
        record.refs.push(refs);
        record.refs.len()
    };
    record.components.push(comps);
    let components_index = record.components.len() - 1;

    let descriptor = TableRecord {
        table: table_id,
        refs_index,
        components_index,
        offsets,
        sizes,
    };

    if table.is_empty() {
        record.inactive_tables.push(descriptor);
    } else {
        record.active_tables.push(descriptor);
    }

    if record.matched.len() <= table_id.index() {
        record.matched.grow(table_id.index() + 1);
    }
    record.matched.insert(table_id.index());

    tables.get_mut(table_id).add_frame_system(record.handle);
    log::debug!(
        "system `{}` matched table {:?} ({} refs)",
        record.name,
        table_id,
        refs_index
    );
}

/// What an activation transition did to the system's overall state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flip {
    /// The system went from zero to one active tables.
    Activated,
    /// The system's last active table emptied.
    Deactivated,
}

/// Move a table's descriptor between the active and inactive arrays.
///
/// Returns a flip when the system's active-table count crossed the 0/1
/// boundary; the world translates that into phase-list membership.
pub(crate) fn activate_table(
    record: &mut SystemRecord,
    table_id: TableId,
    active: bool,
) -> Option<Flip> {
    let (src, dst) = if active {
        (&mut record.inactive_tables, &mut record.active_tables)
    } else {
        (&mut record.active_tables, &mut record.inactive_tables)
    };
    let position = src
        .iter()
        .position(|r| r.table == table_id)
        .expect("descriptor must exist for activation");
    let descriptor = src.remove(position);
    dst.push(descriptor);

    if active && record.active_tables.len() == 1 {
        Some(Flip::Activated)
    } else if !active && record.active_tables.is_empty() {
        Some(Flip::Deactivated)
    } else {
        None
    }
}
