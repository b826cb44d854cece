//! Relay server module
//!
//! Accepts WebSocket connections from browser clients, routes their messages
//! and relays chat traffic to participants and observers.

mod handler;
mod protocol;
mod router;
mod websocket;

pub use handler::*;
#[allow(unused_imports)]
pub use protocol::*;
#[allow(unused_imports)]
pub use router::*;
pub use websocket::*;
