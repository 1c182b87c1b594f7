//! Server-side room model and registry.

pub mod password;
pub mod registry;
pub mod state;
pub mod store;

pub use registry::{RegistryLimits, RoomEvent, RoomRegistry};
pub use state::{CreationOptions, Room, RoomInfo, RoomSummary, SettingsPatch};
pub use store::{MemoryRoomStore, RoomStore};

/// Capacity of a room created without an explicit `maxParticipants`.
pub const DEFAULT_CAPACITY: usize = 10;
