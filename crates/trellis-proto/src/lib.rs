//! Wire protocol for the trellis mesh.
//!
//! Everything in this crate is pure: no I/O, no clocks, no randomness. The
//! frame codec turns byte buffers into [`Frame`]s and back; the payload
//! layouts are fixed per frame type. Transports and the peer-connection
//! layer live in `trellis-core`.

mod agent;
mod error;
mod frame;
mod payload;

pub use agent::*;
pub use error::*;
pub use frame::*;
pub use payload::*;

/// Protocol version carried in PEER_HELLO.
pub const PROTOCOL_VERSION: u16 = 1;
