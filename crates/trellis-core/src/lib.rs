//! Engine of the trellis mesh agent.
//!
//! The [`agent::Agent`] orchestrator owns everything: it loads an identity,
//! validates a [`config::Settings`] tree, binds transport listeners, dials
//! configured peers, and wires frames between the stream manager, the route
//! table, the flood handler, the SOCKS5 ingress and the exit handler. All
//! cross-component references go through explicit handles; there are no
//! ambient globals.

pub mod agent;
pub mod config;
pub mod crypto;
pub mod error;
pub mod exit;
pub mod flood;
pub mod forward;
pub mod identity;
pub mod peer;
pub mod relay;
pub mod route;
pub mod socks;
pub mod stream;
pub mod transport;

pub use agent::Agent;
pub use config::Settings;
pub use error::{AgentError, CryptoError, StreamError, TransportError};
pub use identity::Identity;
pub use trellis_proto::AgentId;

/// Milliseconds since an arbitrary process-local epoch.
///
/// Cheap monotonic timestamps for activity tracking; never compared across
/// processes.
pub(crate) fn mono_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Wall-clock unix time in seconds, for handshake skew checks.
pub(crate) fn unix_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Wall-clock unix time in milliseconds, echoed through keepalives.
pub(crate) fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}
