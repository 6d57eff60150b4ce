//! Real-time layer: connection hub, per-connection actors and the JSON envelope.

pub mod actor;
pub mod handler;
pub mod hub;
pub mod protocol;

pub use hub::{spawn_hub, ConnectionHandle, ConnectionId, Hub, HubHandle};
pub use protocol::{ChatMessage, Envelope, Frame, OnlineUser};
