//! A table: dense row storage bound to one family.

use crate::{
    component::ComponentInfo,
    entity::Entity,
    family::FamilyId,
    storage::rows::RowBuffer,
};

/// The identifier of a table in the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableId(u32);

impl TableId {
    /// Create an id with the given value.
    #[inline]
    pub const fn new(id: u32) -> Self {
        TableId(id)
    }

    /// The id as an index into the store.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Dense columnar-row storage for all entities of one family.
///
/// Each row is the concatenation of one element per family member, in family
/// order, padded to natural alignment. A parallel entity list names the owner
/// of every row, and a reverse offset map locates a member's bytes inside a
/// row.
///
/// # Invariants
/// - `entities.len()` equals the row count at all times.
/// - Rows only leave the table through [`delete`](Table::delete), which
///   rewrites exactly one displaced entity.
pub struct Table {
    /// This table's identifier in the store.
    id: TableId,

    /// The family this table is bound to, one-to-one.
    family: FamilyId,

    /// The family's canonical member sequence.
    members: Vec<Entity>,

    /// Byte offset of each member inside a row, parallel to `members`.
    offsets: Vec<u32>,

    /// Element size of each member, parallel to `members`. Members without a
    /// metadata record (prefab links, markers) occupy zero bytes.
    sizes: Vec<u32>,

    /// The row data.
    rows: RowBuffer,

    /// The entity owning each row, parallel to `rows`.
    entities: Vec<Entity>,

    /// Systems whose matcher admitted this table, for activation flips.
    frame_systems: Vec<Entity>,
}

impl Table {
    /// Build a table for a family.
    ///
    /// `infos` is parallel to `members` and carries each member's metadata
    /// record; zero-size records contribute no bytes. Offsets are assigned by
    /// scanning members in family order, rounding each offset up to the
    /// member's alignment, and the row stride is rounded up to the largest
    /// member alignment.
    pub(crate) fn new(
        id: TableId,
        family: FamilyId,
        members: Vec<Entity>,
        infos: &[ComponentInfo],
    ) -> Self {
        debug_assert_eq!(members.len(), infos.len());

        let mut offsets = Vec::with_capacity(members.len());
        let mut sizes = Vec::with_capacity(members.len());
        let mut cursor = 0usize;
        let mut max_align = 1usize;
        for info in infos {
            if info.size == 0 {
                offsets.push(cursor as u32);
                sizes.push(0);
                continue;
            }
            let align = info.align.max(1) as usize;
            let offset = align_up(cursor, align);
            offsets.push(offset as u32);
            sizes.push(info.size);
            cursor = offset + info.size as usize;
            max_align = max_align.max(align);
        }
        let stride = align_up(cursor, max_align);

        Self {
            id,
            family,
            members,
            offsets,
            sizes,
            rows: RowBuffer::new(stride),
            entities: Vec::new(),
            frame_systems: Vec::new(),
        }
    }

    /// This table's identifier.
    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// The family this table stores.
    #[inline]
    pub fn family(&self) -> FamilyId {
        self.family
    }

    /// The row stride in bytes.
    #[inline]
    pub fn stride(&self) -> usize {
        self.rows.stride()
    }

    /// The number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The entity owning each row.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// The entity at a row, if the row exists.
    #[inline]
    pub fn entity(&self, row: u32) -> Option<Entity> {
        self.entities.get(row as usize).copied()
    }

    /// Byte offset of a component inside a row, or -1 when the component is
    /// not a member of this table's family.
    ///
    /// A -1 from a column that is still required is what triggers reference
    /// resolution through the prefab chain in the system matcher.
    pub fn column_offset(&self, component: Entity) -> i32 {
        match self.members.binary_search(&component) {
            Ok(i) => self.offsets[i] as i32,
            Err(_) => -1,
        }
    }

    /// Element size of a member, or 0 when absent.
    pub fn column_size(&self, component: Entity) -> u32 {
        match self.members.binary_search(&component) {
            Ok(i) => self.sizes[i],
            Err(_) => 0,
        }
    }

    /// Whether every given handle is a member of this table's family.
    pub fn has_components(&self, components: &[Entity]) -> bool {
        components
            .iter()
            .all(|c| self.members.binary_search(c).is_ok())
    }

    /// Append a zeroed row for an entity, returning the row index.
    pub(crate) fn insert(&mut self, entity: Entity) -> u32 {
        let row = self.rows.push_zeroed();
        self.entities.push(entity);
        debug_assert_eq!(self.entities.len(), self.rows.len());
        row as u32
    }

    /// Swap-remove a row, returning the entity that was moved into its place.
    ///
    /// Exactly one entity index entry must be rewritten afterwards: the moved
    /// one (`None` when the removed row was the last).
    pub(crate) fn delete(&mut self, row: u32) -> Option<Entity> {
        let moved = self.rows.swap_remove(row as usize);
        self.entities.swap_remove(row as usize);
        debug_assert_eq!(self.entities.len(), self.rows.len());
        if moved {
            Some(self.entities[row as usize])
        } else {
            None
        }
    }

    /// The bytes of one member's element in one row.
    ///
    /// Returns `None` when the component is not a member. Zero-size members
    /// yield an empty slice.
    pub fn cell(&self, row: u32, component: Entity) -> Option<&[u8]> {
        let i = self.members.binary_search(&component).ok()?;
        let offset = self.offsets[i] as usize;
        let size = self.sizes[i] as usize;
        Some(&self.rows.row(row as usize)[offset..offset + size])
    }

    /// The mutable bytes of one member's element in one row.
    pub(crate) fn cell_mut(&mut self, row: u32, component: Entity) -> Option<&mut [u8]> {
        let i = self.members.binary_search(&component).ok()?;
        let offset = self.offsets[i] as usize;
        let size = self.sizes[i] as usize;
        Some(&mut self.rows.row_mut(row as usize)[offset..offset + size])
    }

    /// The full byte slice of one row.
    #[inline]
    pub fn row(&self, row: u32) -> &[u8] {
        self.rows.row(row as usize)
    }

    /// The underlying row buffer, mutably.
    #[inline]
    pub(crate) fn rows_mut(&mut self) -> &mut RowBuffer {
        &mut self.rows
    }

    /// Record a system as interested in this table.
    pub(crate) fn add_frame_system(&mut self, system: Entity) {
        self.frame_systems.push(system);
    }

    /// Systems whose matcher admitted this table.
    #[inline]
    pub fn frame_systems(&self) -> &[Entity] {
        &self.frame_systems
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u64) -> Entity {
        Entity::from_raw(raw)
    }

    #[test]
    fn layout_uses_natural_alignment() {
        // Given - an 8-byte and a 4-byte component
        let members = vec![handle(10), handle(11)];
        let infos = [ComponentInfo::sized(8), ComponentInfo::sized(4)];

        // When
        let table = Table::new(TableId::new(0), FamilyId::from_raw(1), members, &infos);

        // Then - offsets 0 and 8, stride padded to the largest alignment
        assert_eq!(table.column_offset(handle(10)), 0);
        assert_eq!(table.column_offset(handle(11)), 8);
        assert_eq!(table.stride(), 16);
        assert_eq!(table.column_offset(handle(12)), -1);
    }

    #[test]
    fn layout_pads_between_members() {
        // Given - a 1-byte member followed by a 4-byte member
        let members = vec![handle(10), handle(11)];
        let infos = [ComponentInfo::sized(1), ComponentInfo::sized(4)];

        // When
        let table = Table::new(TableId::new(0), FamilyId::from_raw(1), members, &infos);

        // Then - second member skips the padding bytes
        assert_eq!(table.column_offset(handle(10)), 0);
        assert_eq!(table.column_offset(handle(11)), 4);
        assert_eq!(table.stride(), 8);
    }

    #[test]
    fn zero_size_members_take_no_bytes() {
        // Given - a marker between two sized members
        let members = vec![handle(10), handle(11), handle(12)];
        let infos = [
            ComponentInfo::sized(4),
            ComponentInfo::MARKER,
            ComponentInfo::sized(4),
        ];

        // When
        let table = Table::new(TableId::new(0), FamilyId::from_raw(1), members, &infos);

        // Then
        assert_eq!(table.stride(), 8);
        assert_eq!(table.column_size(handle(11)), 0);
        assert_eq!(table.column_offset(handle(12)), 4);
    }

    #[test]
    fn insert_and_cell_access() {
        // Given
        let members = vec![handle(10), handle(11)];
        let infos = [ComponentInfo::sized(4), ComponentInfo::sized(4)];
        let mut table = Table::new(TableId::new(0), FamilyId::from_raw(1), members, &infos);

        // When
        let row = table.insert(handle(100));
        table
            .cell_mut(row, handle(11))
            .unwrap()
            .copy_from_slice(&7u32.to_le_bytes());

        // Then
        assert_eq!(table.len(), 1);
        assert_eq!(table.entity(row), Some(handle(100)));
        assert_eq!(table.cell(row, handle(10)).unwrap(), &[0, 0, 0, 0]);
        assert_eq!(table.cell(row, handle(11)).unwrap(), &7u32.to_le_bytes());
        assert!(table.cell(row, handle(12)).is_none());
    }

    #[test]
    fn delete_reports_the_displaced_entity() {
        // Given
        let members = vec![handle(10)];
        let infos = [ComponentInfo::sized(4)];
        let mut table = Table::new(TableId::new(0), FamilyId::from_raw(1), members, &infos);
        table.insert(handle(100));
        table.insert(handle(101));
        table.insert(handle(102));

        // When - delete the first row
        let moved = table.delete(0);

        // Then - the last entity moved into row 0
        assert_eq!(moved, Some(handle(102)));
        assert_eq!(table.entity(0), Some(handle(102)));
        assert_eq!(table.len(), 2);

        // When - delete the final row
        let moved = table.delete(1);

        // Then
        assert_eq!(moved, None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn has_components_is_a_membership_test() {
        // Given
        let members = vec![handle(10), handle(11)];
        let infos = [ComponentInfo::sized(4), ComponentInfo::sized(4)];
        let table = Table::new(TableId::new(0), FamilyId::from_raw(1), members, &infos);

        // Then
        assert!(table.has_components(&[handle(10)]));
        assert!(table.has_components(&[handle(10), handle(11)]));
        assert!(!table.has_components(&[handle(10), handle(12)]));
    }
}
