//! Network core: buffers, connections, the registry, workers, the acceptor,
//! and the per-connection state machine.
//!
//! Concurrency boundary in the steady state is exactly one structure: each
//! worker's hand-off queue. Everything per-connection is owned by a single
//! worker from hand-off to close.

pub mod acceptor;
pub mod buffer;
pub mod connection;
pub mod machine;
pub mod protocol;
pub mod worker;
