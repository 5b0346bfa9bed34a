//! An archetype ECS runtime with runtime-registered components.
//!
//! State lives as plain-data components attached to opaque 64-bit entity
//! handles. Entities sharing a component composition (a *family*) are stored
//! together in dense byte-row tables; *systems* declare a signature string
//! and run over exactly the tables whose family satisfies it, through
//! descriptors precomputed at registration time.
//!
//! Components are registered at runtime by name and size, not as Rust types:
//! the crate is the storage and scheduling core under a language-neutral
//! shell, and component layout is fixed at registration.
//!
//! ```no_run
//! use slate_engine::{SystemKind, World};
//!
//! let mut world = World::new();
//!
//! let position = world.register_component("Position", 8);
//! let speed = world.register_component("Speed", 4);
//! let object = world.declare_family("Object", &[position, speed]).unwrap();
//!
//! world
//!     .new_system("Move", SystemKind::OnFrame, "Position, Speed", |batch| {
//!         for row in 0..batch.row_count() {
//!             let dt = batch.delta_time();
//!             // SAFETY: Position was registered as two little-endian f32s.
//!             let position: &mut [f32; 2] = unsafe { batch.get_mut(row, 0) }.unwrap();
//!             position[0] += dt;
//!         }
//!     })
//!     .unwrap();
//!
//! world.new_entity(object).unwrap();
//! while world.progress(0.016) {}
//! ```

pub mod component;
pub mod entity;
pub mod error;
pub mod family;
pub mod jobs;
pub mod signature;
pub mod stage;
pub mod storage;
pub mod system;
pub mod world;

pub use component::{COMPONENT, ComponentInfo, PREFAB};
pub use entity::{Entity, Location};
pub use error::Error;
pub use family::FamilyId;
pub use signature::{Op, Source};
pub use stage::StagedOp;
pub use storage::TableId;
pub use system::{Batch, SystemKind};
pub use world::World;
