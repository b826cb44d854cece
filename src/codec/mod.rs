//! Wire codec module
//!
//! WebSocket handshake, frame encoding/decoding and the chat payload cipher.

mod cipher;
mod frame;
mod handshake;

pub use cipher::*;
pub use frame::*;
pub use handshake::*;
