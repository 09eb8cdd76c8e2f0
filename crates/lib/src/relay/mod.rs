//! The relay: room message in, random matching image posted back to the room.

mod handler;
mod picker;

pub use handler::{
    relay_room_message, room_message, RelayError, RelayState, MODERATION_LEVEL, ROOM_MESSAGE_ROUTE,
};
pub use picker::Picker;
