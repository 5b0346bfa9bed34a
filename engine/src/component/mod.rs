//! Component registration metadata.
//!
//! Components are plain-data record types registered at runtime with a fixed
//! byte size. A registered component is itself an entity: its handle lives in
//! the entity index, and its metadata record (size and alignment) occupies a
//! row in the builtin metadata table. That self-hosting is what allows
//! families to treat components, prefabs, and systems as one handle space.

use dashmap::DashMap;

use crate::entity::Entity;

/// The builtin component holding every component's metadata record.
///
/// Registered components belong to the `{COMPONENT}` family; their metadata
/// row is a [`ComponentInfo`] encoded with [`ComponentInfo::to_bytes`].
pub const COMPONENT: Entity = Entity::from_raw(1);

/// The builtin zero-size marker that tags prefab entities.
///
/// Tables whose family carries this marker are data sources only and are
/// never matched by systems.
pub const PREFAB: Entity = Entity::from_raw(2);

/// The first handle available to user registrations.
pub const FIRST_USER_HANDLE: u64 = 3;

/// The metadata record of a registered component.
///
/// Immutable after registration. Stored as 8 little-endian bytes in the
/// metadata table so the record itself is plain row data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    /// Element size in bytes. Zero-size markers are valid components.
    pub size: u32,

    /// Element alignment in bytes; always a power of two, at least 1.
    pub align: u32,
}

impl ComponentInfo {
    /// The encoded size of a metadata record.
    pub const BYTES: usize = 8;

    /// The record describing the metadata component itself.
    pub const META: Self = Self { size: 8, align: 4 };

    /// The record of a zero-size marker.
    pub const MARKER: Self = Self { size: 0, align: 1 };

    /// Build a record, inferring alignment from the size.
    ///
    /// The inferred alignment is the largest power of two dividing `size`,
    /// capped at 8. Size zero gets alignment 1.
    pub fn sized(size: u32) -> Self {
        Self {
            size,
            align: infer_align(size),
        }
    }

    /// Build a record with an explicit alignment.
    ///
    /// # Panics
    /// Panics if `align` is zero or not a power of two.
    pub fn aligned(size: u32, align: u32) -> Self {
        assert!(
            align.is_power_of_two(),
            "alignment must be a power of two, got {align}"
        );
        Self { size, align }
    }

    /// Encode the record as row bytes.
    pub fn to_bytes(self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        out[..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..].copy_from_slice(&self.align.to_le_bytes());
        out
    }

    /// Decode a record from row bytes.
    ///
    /// # Panics
    /// Panics if the slice is shorter than [`Self::BYTES`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let size = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let align = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        Self { size, align }
    }
}

fn infer_align(size: u32) -> u32 {
    if size == 0 {
        return 1;
    }
    (1 << size.trailing_zeros()).min(8)
}

/// Bidirectional name registry for components, declared families, prefabs,
/// and systems.
///
/// Backed by concurrent maps so signature resolution and diagnostics can read
/// names while systems execute; writes only happen through registration
/// calls on the main thread.
#[derive(Default)]
pub struct Names {
    by_name: DashMap<String, Entity>,
    by_handle: DashMap<Entity, String>,
}

impl Names {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a name to a handle. Rebinding an existing name is a programmer
    /// error.
    pub fn insert(&self, name: &str, handle: Entity) {
        let previous = self.by_name.insert(name.to_owned(), handle);
        assert!(
            previous.is_none_or(|p| p == handle),
            "name `{name}` is already bound"
        );
        self.by_handle.insert(handle, name.to_owned());
    }

    /// Resolve a name to its handle.
    pub fn resolve(&self, name: &str) -> Option<Entity> {
        self.by_name.get(name).map(|entry| *entry.value())
    }

    /// The name bound to a handle, if any.
    pub fn name_of(&self, handle: Entity) -> Option<String> {
        self.by_handle.get(&handle).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_round_trips_through_bytes() {
        // Given
        let info = ComponentInfo::aligned(12, 4);

        // When
        let decoded = ComponentInfo::from_bytes(&info.to_bytes());

        // Then
        assert_eq!(decoded, info);
    }

    #[test]
    fn alignment_is_inferred_from_size() {
        assert_eq!(ComponentInfo::sized(8).align, 8);
        assert_eq!(ComponentInfo::sized(4).align, 4);
        assert_eq!(ComponentInfo::sized(12).align, 4);
        assert_eq!(ComponentInfo::sized(6).align, 2);
        assert_eq!(ComponentInfo::sized(7).align, 1);
        assert_eq!(ComponentInfo::sized(32).align, 8);
        assert_eq!(ComponentInfo::sized(0).align, 1);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn bad_alignment_panics() {
        let _ = ComponentInfo::aligned(8, 3);
    }

    #[test]
    fn names_resolve_both_ways() {
        // Given
        let names = Names::new();
        let handle = Entity::from_raw(9);

        // When
        names.insert("Position", handle);

        // Then
        assert_eq!(names.resolve("Position"), Some(handle));
        assert_eq!(names.name_of(handle).as_deref(), Some("Position"));
        assert_eq!(names.resolve("Velocity"), None);
    }
}
