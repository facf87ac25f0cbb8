//! Client fan-out: websocket sessions, subscription indexing, the
//! ranking/ticker broadcaster, and the wire serialization boundary.

pub mod broadcaster;
pub mod index;
pub mod session;
pub mod wire;

pub use index::SubscriptionIndex;
