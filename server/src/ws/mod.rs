//! `/ws` endpoint: upgrade, per-connection pumps and the JSON wire protocol.

pub mod actor;
pub mod events;
pub mod handler;
pub mod protocol;
