//! Model description: the structured form of the simulation plan.
//!
//! A plan names the compute elements of the coupled simulation, the
//! conduits that connect their ports, and the base settings. The text
//! front end that produces the document is external; the manager
//! consumes the structured form defined here, and loads it from JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reference::Reference;
use crate::settings::{Configuration, ParameterValue};

/// The operator a port belongs to.
///
/// Operators define the canonical per-step sequence of a submodel,
/// F_INIT, then zero or more (O_I, S) rounds, then O_F. The declaration
/// order here gives `Ord` that sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Operator {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "F_INIT")]
    FInit,
    #[serde(rename = "O_I")]
    OI,
    #[serde(rename = "S")]
    S,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "O_F")]
    OF,
}

impl Operator {
    /// Whether ports of this operator send messages.
    pub fn allows_sending(self) -> bool {
        matches!(self, Operator::OI | Operator::OF)
    }

    /// Whether ports of this operator receive messages.
    pub fn allows_receiving(self) -> bool {
        matches!(self, Operator::FInit | Operator::S | Operator::B)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::None => "NONE",
            Operator::FInit => "F_INIT",
            Operator::OI => "O_I",
            Operator::S => "S",
            Operator::B => "B",
            Operator::OF => "O_F",
        }
    }
}

/// A directed edge from one port to another in the topology.
///
/// Both endpoints are references of the form `kernel.port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conduit {
    pub sender: Reference,
    pub receiver: Reference,
}

impl Conduit {
    pub fn new(sender: &str, receiver: &str) -> Result<Self> {
        let conduit = Conduit {
            sender: Reference::new(sender)?,
            receiver: Reference::new(receiver)?,
        };
        conduit.sending_port()?;
        conduit.receiving_port()?;
        Ok(conduit)
    }

    /// The kernel that owns the sending port.
    pub fn sending_component(&self) -> Result<Reference> {
        self.sender.parent()
    }

    /// The kernel that owns the receiving port.
    pub fn receiving_component(&self) -> Result<Reference> {
        self.receiver.parent()
    }

    pub fn sending_port(&self) -> Result<&str> {
        self.sender.last_identifier().ok_or_else(|| {
            Error::Config(format!("conduit sender '{}' does not end in a port", self.sender))
        })
    }

    pub fn receiving_port(&self) -> Result<&str> {
        self.receiver.last_identifier().ok_or_else(|| {
            Error::Config(format!(
                "conduit receiver '{}' does not end in a port",
                self.receiver
            ))
        })
    }
}

/// One declared compute element: an implementation name and an optional
/// multiplicity vector. An empty multiplicity means a single instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeElementDecl {
    pub implementation: String,
    pub multiplicity: Vec<usize>,
}

/// The model section of a plan: elements plus conduits.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: Reference,
    pub compute_elements: BTreeMap<Reference, ComputeElementDecl>,
    pub conduits: Vec<Conduit>,
}

/// A complete simulation plan: the model and the base settings.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub model: Model,
    pub settings: Configuration,
}

impl SimulationPlan {
    /// Parses a plan from its JSON document form.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: PlanDocument = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid simulation plan: {}", e)))?;
        doc.into_plan()
    }
}

// The on-disk document shape. Compute elements may be a bare
// implementation name or a table with multiplicity; conduits are a map
// from sender endpoint to receiver endpoint.
#[derive(Deserialize)]
struct PlanDocument {
    #[allow(dead_code)]
    ymmsl_version: String,
    model: ModelDocument,
    #[serde(default)]
    settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ModelDocument {
    name: String,
    compute_elements: BTreeMap<String, ComputeElementEntry>,
    #[serde(default)]
    conduits: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ComputeElementEntry {
    Bare(String),
    Full {
        implementation: String,
        #[serde(default)]
        multiplicity: Vec<usize>,
    },
}

impl PlanDocument {
    fn into_plan(self) -> Result<SimulationPlan> {
        let mut compute_elements = BTreeMap::new();
        for (name, entry) in self.model.compute_elements {
            let decl = match entry {
                ComputeElementEntry::Bare(implementation) => ComputeElementDecl {
                    implementation,
                    multiplicity: Vec::new(),
                },
                ComputeElementEntry::Full { implementation, multiplicity } => {
                    ComputeElementDecl { implementation, multiplicity }
                }
            };
            compute_elements.insert(Reference::new(&name)?, decl);
        }

        let mut conduits = Vec::new();
        for (sender, receiver) in &self.model.conduits {
            conduits.push(Conduit::new(sender, receiver)?);
        }

        let mut settings = Configuration::new();
        for (name, value) in self.settings {
            let value = ParameterValue::try_from(value).map_err(|e| {
                Error::Config(format!("invalid value for setting '{}': {}", name, e))
            })?;
            settings.insert(Reference::new(&name)?, value);
        }

        Ok(SimulationPlan {
            model: Model {
                name: Reference::new(&self.model.name)?,
                compute_elements,
                conduits,
            },
            settings,
        })
    }
}
