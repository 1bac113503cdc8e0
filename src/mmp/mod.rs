//! The manager protocol.
//!
//! Instances talk to the manager over a request/response connection:
//! register at startup, resolve peers, fetch the base settings, forward
//! log records, deregister at shutdown. This module defines the message
//! kinds; [`client`] and [`server`] implement the two ends. Frames are
//! length-prefixed bincode, the same framing the peer-to-peer transport
//! uses.

pub mod client;
pub mod server;

pub use client::MMPClient;
pub use server::MMPServer;

use serde::{Deserialize, Serialize};

use crate::logging::LogMessage;
use crate::model::{Conduit, Operator};
use crate::reference::Reference;
use crate::settings::Configuration;

/// Declared port metadata, as sent along with a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    pub name: String,
    pub operator: Operator,
}

/// Outcome of a manager call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Success,
    /// Transient: retry after a backoff.
    Pending,
    Error,
}

/// The multiplicity of one peer kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDimensions {
    pub peer_name: Reference,
    pub dimensions: Vec<usize>,
}

/// The registered network locations of one peer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLocations {
    pub instance_name: Reference,
    pub locations: Vec<String>,
}

/// A request from an instance to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    RegisterInstance {
        instance_name: Reference,
        locations: Vec<String>,
        ports: Vec<PortDescription>,
    },
    RequestPeers {
        instance_name: Reference,
    },
    GetConfiguration,
    DeregisterInstance {
        instance_name: Reference,
    },
    SubmitLogMessage(LogMessage),
}

/// The manager's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Register {
        status: ResultStatus,
        error_message: Option<String>,
    },
    Peers {
        status: ResultStatus,
        conduits: Vec<Conduit>,
        peer_dimensions: Vec<PeerDimensions>,
        peer_locations: Vec<PeerLocations>,
        error_message: Option<String>,
    },
    Configuration(Configuration),
    Deregister {
        status: ResultStatus,
    },
    Log,
}

impl Response {
    /// An empty peers answer with the given status, for the pending and
    /// error paths.
    pub(crate) fn peers_status(status: ResultStatus, error_message: Option<String>) -> Response {
        Response::Peers {
            status,
            conduits: Vec::new(),
            peer_dimensions: Vec::new(),
            peer_locations: Vec::new(),
            error_message,
        }
    }
}
