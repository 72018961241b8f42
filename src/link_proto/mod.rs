//! Eval link protocol: message types, framing, session state, and the
//! WebSocket client that ties them together.

pub mod backoff;
pub mod client;
pub mod rpc;
pub mod session;
pub mod wire;

pub use self::client::{listen, LinkClient};
