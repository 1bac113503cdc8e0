//! Message transports.
//!
//! A transport moves serialized messages from a sender's post office to
//! the peer that asked for them. The model is pull based: the server
//! side sits in front of the sender's outboxes, and the client side
//! calls [`TransportClient::get_message`], which blocks until the far
//! side has produced a message for the requested receiver endpoint.
//!
//! Two implementations exist. The direct transport routes through an
//! in-process [`Multiplexer`] and is used when coupled instances run as
//! threads of one process; the TCP transport covers everything else.
//! Both preserve per-receiver FIFO order and lose no messages on a
//! clean close.

pub mod direct;
pub mod tcp;

pub use direct::{DirectClient, DirectServer, Multiplexer};
pub use tcp::{TcpTransportClient, TcpTransportServer};

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::reference::Reference;

/// Upper bound on a single wire frame. Keeps a corrupt length prefix
/// from allocating unbounded memory.
pub(crate) const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Serves messages from a post office to connecting peers.
pub trait TransportServer: Send {
    /// The location string peers pass to a client to reach this server.
    fn location(&self) -> String;

    /// Stops serving. Safe to call more than once.
    fn stop(&mut self);
}

/// Fetches messages from one peer instance.
pub trait TransportClient: Send {
    /// Returns the oldest message addressed to `receiver`, blocking
    /// until the peer has deposited one.
    fn get_message(&mut self, receiver: &Reference) -> Result<Vec<u8>>;

    fn close(&mut self);
}

/// Connects to a peer that advertised the given locations.
///
/// The direct transport is preferred when the peer is reachable through
/// our multiplexer; otherwise the first TCP location wins.
pub fn connect(
    locations: &[String],
    multiplexer: Option<&Arc<Multiplexer>>,
) -> Result<Box<dyn TransportClient>> {
    if let Some(mux) = multiplexer {
        for location in locations {
            if mux.can_connect_to(location) {
                return Ok(Box::new(DirectClient::connect(mux.clone(), location)?));
            }
        }
    }
    for location in locations {
        if TcpTransportClient::can_connect_to(location) {
            return Ok(Box::new(TcpTransportClient::connect(location)?));
        }
    }
    Err(Error::Config(format!(
        "no transport can reach a peer at any of {:?}",
        locations
    )))
}
