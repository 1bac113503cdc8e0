//! Port metadata.
//!
//! A port is a named endpoint on an instance. Vector ports have multiple
//! slots; how many is determined by the multiplicity of the peer kernel,
//! or set at runtime when the port is resizable. Construction checks the
//! rank rules: a port and its peers may differ in multiplicity rank by
//! at most one, with the extra rank on the vector side.

use crate::error::{Error, Result};
use crate::model::Operator;
use crate::reference::Reference;

#[derive(Debug, Clone)]
pub struct Port {
    name: String,
    pub operator: Operator,
    vector: bool,
    length: Option<usize>,
    resizable: bool,
    connected: bool,
    peer_ports: Vec<Reference>,
    peer_dims: Vec<usize>,
}

impl Port {
    /// Creates a port.
    ///
    /// `our_ndims` is the rank of the owning instance's index vector and
    /// `peer_dims` the multiplicity of the peer kernel; for an
    /// unconnected port the peer fields are empty and no rank checking
    /// applies.
    pub fn new(
        name: &str,
        operator: Operator,
        vector: bool,
        connected: bool,
        our_ndims: usize,
        peer_dims: Vec<usize>,
        peer_ports: Vec<Reference>,
    ) -> Result<Port> {
        let mut length = if vector { None } else { Some(1) };
        let mut resizable = false;

        if connected {
            if vector {
                if peer_dims.len() == our_ndims {
                    // The slot dimension is free on both sides; the
                    // sender fixes it at runtime.
                    resizable = true;
                } else if peer_dims.len() == our_ndims + 1 {
                    length = Some(peer_dims[our_ndims..].iter().product());
                } else {
                    return Err(Error::Config(format!(
                        "vector port '{}' cannot be connected to a peer of \
                         multiplicity rank {}; the ranks may differ by at \
                         most one",
                        name,
                        peer_dims.len()
                    )));
                }
            } else if peer_dims.len() > our_ndims {
                return Err(Error::Config(format!(
                    "scalar port '{}' is connected to a peer with higher \
                     multiplicity; declare it as a vector port '{}[]'",
                    name, name
                )));
            } else if our_ndims > peer_dims.len() + 1 {
                return Err(Error::Config(format!(
                    "port '{}' cannot be connected to a peer of multiplicity \
                     rank {}; the ranks may differ by at most one",
                    name,
                    peer_dims.len()
                )));
            }
        }

        Ok(Port {
            name: name.to_string(),
            operator,
            vector,
            length,
            resizable,
            connected,
            peer_ports,
            peer_dims,
        })
    }

    /// An unconnected port, as built from a declaration the topology does
    /// not wire up.
    pub fn unconnected(name: &str, operator: Operator, vector: bool) -> Port {
        Port {
            name: name.to_string(),
            operator,
            vector,
            length: if vector { None } else { Some(1) },
            resizable: false,
            connected: false,
            peer_ports: Vec::new(),
            peer_dims: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_vector(&self) -> bool {
        self.vector
    }

    pub fn is_resizable(&self) -> bool {
        self.resizable
    }

    pub fn peer_ports(&self) -> &[Reference] {
        &self.peer_ports
    }

    pub fn peer_dims(&self) -> &[usize] {
        &self.peer_dims
    }

    /// Current number of slots. Scalar ports have one; a resizable
    /// vector port has zero until someone sets or receives a length.
    pub fn length(&self) -> usize {
        self.length.unwrap_or(0)
    }

    /// Whether a length is known yet.
    pub fn length_set(&self) -> bool {
        self.length.is_some()
    }

    /// Resizes the port. Only valid on resizable vector ports.
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        if !self.resizable {
            return Err(Error::NotResizable(self.name.clone()));
        }
        self.length = Some(length);
        Ok(())
    }

    /// Fixes the length from an incoming message without the resizable
    /// check; the sender owns the length of a resizable pair.
    pub(crate) fn learn_length(&mut self, length: usize) {
        if self.resizable {
            self.length = Some(length);
        }
    }
}
