//! Protocol handler implementations.
//!
//! The network core only knows the `PacketHandler` contract; session logic
//! lives here. Handlers are selected per server by `ProtocolKind` and built
//! fresh for every session.

pub mod echo;
pub mod ping;

use clap::ValueEnum;
use serde::Deserialize;

use crate::net::protocol::PacketHandler;

/// Which handler newly accepted connections get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Echo,
    Ping,
}

/// Build a handler for one session.
pub fn make_handler(kind: ProtocolKind) -> Box<dyn PacketHandler> {
    match kind {
        ProtocolKind::Echo => Box::new(echo::EchoHandler::new()),
        ProtocolKind::Ping => Box::new(ping::PingHandler::new()),
    }
}
