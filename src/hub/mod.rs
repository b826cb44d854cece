//! Connection hub module
//!
//! Tracks upgraded connections by role and fans messages out to them.

mod connection;
mod registry;

pub use connection::*;
pub use registry::*;
