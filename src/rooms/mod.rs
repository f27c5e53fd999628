pub mod registry;
pub mod room;

pub use registry::{Registry, CRASH_ROOM_ID, POOL_FLIP_ROOM_ID};
pub use room::{GameState, Room, RoomHandle};
