//! Error types for the coupling runtime.
//!
//! Library code returns [`Result`] and propagates with `?`. Each variant
//! corresponds to one failure class an embedding program may want to tell
//! apart: startup configuration problems, protocol violations between
//! coupled instances, transport failures, and parameter lookup issues.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the coupling runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid model document, port declaration, or command line flag.
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A violation of the coupling protocol, such as receiving the wrong
    /// message type on a control port or receiving twice on the same slot
    /// without an intervening `reuse_instance`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Receive on an unconnected port without a default value.
    #[error("port '{0}' is not connected and no default value was given")]
    NotConnected(String),

    /// Send or receive on a port that was never declared.
    #[error("port '{port}' does not exist on '{instance}'")]
    NoSuchPort { port: String, instance: String },

    /// Inconsistent configuration overlays received within one cycle.
    /// This indicates a miswired ensemble.
    #[error("received data from a parallel universe on port '{port}': \
             my settings are {ours} but the message came from a universe \
             with {theirs}")]
    ParallelUniverse {
        port: String,
        ours: String,
        theirs: String,
    },

    /// Parameter lookup failed in both overlay and base settings.
    #[error("no parameter named '{0}' was set")]
    NoSuchParameter(String),

    /// A parameter value exists but does not match the requested type.
    #[error("parameter '{parameter}' is of type {actual}, expected {expected}")]
    TypeMismatch {
        parameter: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Attempt to resize a scalar port, or a vector port whose length is
    /// fixed by the topology.
    #[error("port '{0}' is not resizable")]
    NotResizable(String),

    /// A second registration for an instance name the manager already has.
    #[error("instance '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Peer lookup for an instance name that the topology does not declare.
    #[error("unknown instance '{0}' in the topology")]
    UnknownInstance(String),

    /// Connection drop or other I/O failure. Fatal to the instance.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Wire encoding or decoding failure. Fatal to the instance.
    #[error("transport error: message encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    /// One or more instances run by the in-process launcher failed.
    #[error("instance '{instance}' failed: {cause}")]
    InstanceFailure { instance: String, cause: String },
}
