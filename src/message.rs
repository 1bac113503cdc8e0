//! Messages exchanged between coupled instances.
//!
//! A [`Message`] is what users send and receive: a timestamp, an
//! optional next timestamp, a payload, and an optional configuration
//! overlay. On the wire it travels as a [`WireMessage`], which also
//! carries sender and receiver endpoint references so that it can be
//! routed, and on which the overlay is always present (empty if unset).
//!
//! Wire frames are bincode with a four byte little-endian length prefix.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reference::Reference;
use crate::settings::Configuration;

/// The timestamp used on end-of-stream messages.
pub const CLOSE_TIMESTAMP: f64 = f64::INFINITY;

/// The payload of a message.
///
/// `ClosePort` is the in-band end-of-stream sentinel; `Configuration`
/// carries a settings overlay on the implicit parameters port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Payload>),
    Map(HashMap<String, Payload>),
    Configuration(Configuration),
    ClosePort,
}

impl Payload {
    pub fn is_close_port(&self) -> bool {
        matches!(self, Payload::ClosePort)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::String(value.to_string())
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Int(value)
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Float(value)
    }
}

/// A message as seen by the user of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Simulation time this message is valid for.
    pub timestamp: f64,
    /// Simulation time of the next message on this port, if known.
    /// Used by receivers to detect whether the sender will continue.
    pub next_timestamp: Option<f64>,
    pub data: Payload,
    /// Settings overlay attached to this message. Stripped on receive
    /// unless explicitly requested.
    pub configuration: Option<Configuration>,
}

impl Message {
    pub fn new(timestamp: f64, next_timestamp: Option<f64>, data: Payload) -> Self {
        Message { timestamp, next_timestamp, data, configuration: None }
    }

    pub fn with_configuration(
        timestamp: f64,
        next_timestamp: Option<f64>,
        data: Payload,
        configuration: Configuration,
    ) -> Self {
        Message { timestamp, next_timestamp, data, configuration: Some(configuration) }
    }
}

/// A routed message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Sending endpoint, `kernel[index].port[slot]`.
    pub sender: Reference,
    /// Receiving endpoint the message is addressed to.
    pub receiver: Reference,
    /// Current length of the sending vector port, carried so that a
    /// resizable receiving port can fix its length on first receive.
    pub port_length: Option<u64>,
    pub timestamp: f64,
    pub next_timestamp: Option<f64>,
    /// Always present on the wire; empty when the sender had no overlay.
    pub configuration: Configuration,
    pub data: Payload,
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Converts to the user-visible form, attaching the overlay.
    pub fn into_message(self) -> Message {
        Message {
            timestamp: self.timestamp,
            next_timestamp: self.next_timestamp,
            data: self.data,
            configuration: Some(self.configuration),
        }
    }
}
