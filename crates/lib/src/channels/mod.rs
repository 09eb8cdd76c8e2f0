//! Chat channel: HipChat room-message webhooks in, room notifications out.
//!
//! The relay talks to the chat platform only through [`RoomNotifier`], so tests
//! can substitute a recording notifier for the real HipChat client.

mod hipchat;
mod inbound;
mod notifier;

pub use hipchat::{HipChatClient, HipChatError, Room};
pub use inbound::{EventMessage, EventRoom, InboundEvent, RoomMessageEvent, RoomMessageItem};
pub use notifier::{Notification, RoomNotifier};
