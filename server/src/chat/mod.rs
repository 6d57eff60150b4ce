//! Private message persistence and user/presence listings.

pub mod messages;
pub mod presence;
