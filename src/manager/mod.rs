//! The central manager.
//!
//! The manager is the only party that knows the whole model: which
//! compute elements exist, how many instances each has, and which
//! conduits connect them. Instances register at startup, ask it who
//! their peers are and where to find them, fetch the base settings, and
//! deregister on shutdown. After startup the manager is out of the data
//! path entirely; messages flow directly between instances.

pub mod logger;
pub mod registry;
pub mod topology;

pub use logger::Logger;
pub use registry::InstanceRegistry;
pub use topology::TopologyStore;

use std::sync::Mutex;

use tracing::{debug, info};

use crate::communicator::PARAMETERS_IN_PORT;
use crate::error::{Error, Result};
use crate::mmp::{
    PeerDimensions, PeerLocations, PortDescription, Request, Response, ResultStatus,
};
use crate::model::{Conduit, Model, SimulationPlan};
use crate::reference::Reference;
use crate::settings::Configuration;

pub struct Manager {
    registry: Mutex<InstanceRegistry>,
    topology: TopologyStore,
    settings: Configuration,
    expected_instances: Vec<Reference>,
    logger: Logger,
}

impl Manager {
    pub fn new(plan: &SimulationPlan, logger: Logger) -> Result<Manager> {
        let topology = TopologyStore::new(&plan.model)?;
        let expected_instances = elements_for_model(&plan.model);
        info!(
            "managing model '{}' with {} instances",
            plan.model.name,
            expected_instances.len()
        );
        Ok(Manager {
            registry: Mutex::new(InstanceRegistry::new()),
            topology,
            settings: plan.settings.clone(),
            expected_instances,
            logger,
        })
    }

    /// Serves one request. All state access is serialized behind the
    /// registry lock, so this may be called concurrently.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::RegisterInstance { instance_name, locations, ports } => {
                self.register_instance(instance_name, locations, ports)
            }
            Request::RequestPeers { instance_name } => self.request_peers(&instance_name),
            Request::GetConfiguration => Response::Configuration(self.settings.clone()),
            Request::DeregisterInstance { instance_name } => {
                self.deregister_instance(&instance_name)
            }
            Request::SubmitLogMessage(message) => {
                self.logger.log(&message);
                Response::Log
            }
        }
    }

    /// True once every expected instance has registered and deregistered
    /// again; the simulation is then complete.
    pub fn is_done(&self) -> bool {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.is_empty()
            && self
                .expected_instances
                .iter()
                .all(|name| registry.ever_registered().contains(name))
    }

    fn register_instance(
        &self,
        name: Reference,
        locations: Vec<String>,
        ports: Vec<PortDescription>,
    ) -> Response {
        debug!("registering instance {} at {:?}", name, locations);
        let error = |e: Error| Response::Register {
            status: ResultStatus::Error,
            error_message: Some(e.to_string()),
        };

        let kernel = match name.split_instance() {
            Ok((kernel, _)) => kernel,
            Err(e) => return error(e),
        };

        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if let Err(e) = registry.add(name.clone(), locations, ports) {
            return error(e);
        }

        // Check the stored declarations against the topology right away,
        // so a miswired instance hears about it at registration instead
        // of a peer tripping over it later.
        let declared = registry.ports(&name).cloned().unwrap_or_default();
        if let Err(e) = self.check_declared_ports(&kernel, &declared) {
            registry.remove(&name);
            return error(e);
        }

        Response::Register { status: ResultStatus::Success, error_message: None }
    }

    /// An instance that declares ports must have declared every port the
    /// conduits attach to its kernel, with an operator that permits the
    /// direction. An empty declaration means the ports will be inferred
    /// from the conduits, so there is nothing to check yet.
    fn check_declared_ports(
        &self,
        kernel: &Reference,
        declared: &[PortDescription],
    ) -> Result<()> {
        if declared.is_empty() {
            return Ok(());
        }
        for conduit in self.topology.conduits_for(kernel) {
            if &conduit.sending_component()? == kernel {
                check_attachment(&conduit, declared, kernel, conduit.sending_port()?, true)?;
            }
            if &conduit.receiving_component()? == kernel {
                let port_name = conduit.receiving_port()?;
                if port_name != PARAMETERS_IN_PORT {
                    check_attachment(&conduit, declared, kernel, port_name, false)?;
                }
            }
        }
        Ok(())
    }

    fn deregister_instance(&self, name: &Reference) -> Response {
        debug!("deregistering instance {}", name);
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.remove(name);
        Response::Deregister { status: ResultStatus::Success }
    }

    /// Answers a peer query: every conduit incident to the requesting
    /// kernel, the multiplicity of each peer kernel, and the locations
    /// of each peer instance. Pending until all peers have registered.
    fn request_peers(&self, name: &Reference) -> Response {
        let kernel = match name.split_instance() {
            Ok((kernel, _)) => kernel,
            Err(e) => return Response::peers_status(ResultStatus::Error, Some(e.to_string())),
        };
        if !self.topology.has_kernel(&kernel) {
            return Response::peers_status(
                ResultStatus::Error,
                Some(format!("unknown instance '{}' in the topology", name)),
            );
        }

        let conduits = self.topology.conduits_for(&kernel);

        // Peer kernels in conduit order, without duplicates.
        let mut peer_kernels: Vec<Reference> = Vec::new();
        for conduit in &conduits {
            for endpoint_kernel in [
                conduit.sending_component(),
                conduit.receiving_component(),
            ] {
                let endpoint_kernel = match endpoint_kernel {
                    Ok(endpoint_kernel) => endpoint_kernel,
                    Err(e) => {
                        return Response::peers_status(
                            ResultStatus::Error,
                            Some(e.to_string()),
                        )
                    }
                };
                if endpoint_kernel != kernel && !peer_kernels.contains(&endpoint_kernel) {
                    peer_kernels.push(endpoint_kernel);
                }
            }
        }

        let mut peer_dimensions = Vec::new();
        let mut peer_locations = Vec::new();
        let registry = self.registry.lock().expect("registry lock poisoned");
        for peer_kernel in &peer_kernels {
            let dimensions = match self.topology.kernel_dimensions(peer_kernel) {
                Some(dimensions) => dimensions.clone(),
                None => {
                    return Response::peers_status(
                        ResultStatus::Error,
                        Some(format!("unknown instance '{}' in the topology", peer_kernel)),
                    )
                }
            };

            for index in index_space(&dimensions) {
                let mut instance = peer_kernel.clone();
                for i in index {
                    instance.push_index(i);
                }
                match registry.locations(&instance) {
                    Some(locations) => peer_locations.push(PeerLocations {
                        instance_name: instance,
                        locations: locations.clone(),
                    }),
                    None => {
                        debug!("peers of {} pending on {}", name, instance);
                        return Response::peers_status(ResultStatus::Pending, None);
                    }
                }
            }

            peer_dimensions.push(PeerDimensions {
                peer_name: peer_kernel.clone(),
                dimensions,
            });
        }

        Response::Peers {
            status: ResultStatus::Success,
            conduits,
            peer_dimensions,
            peer_locations,
            error_message: None,
        }
    }
}

/// Checks that one conduit endpoint lands on a declared port whose
/// operator permits the direction.
fn check_attachment(
    conduit: &Conduit,
    declared: &[PortDescription],
    kernel: &Reference,
    port_name: &str,
    sending: bool,
) -> Result<()> {
    let port = declared.iter().find(|p| p.name == port_name).ok_or_else(|| {
        Error::Config(format!(
            "conduit {} -> {} is attached to port '{}', which '{}' does not \
             declare",
            conduit.sender, conduit.receiver, port_name, kernel
        ))
    })?;
    let legal = if sending {
        port.operator.allows_sending()
    } else {
        port.operator.allows_receiving()
    };
    if !legal {
        return Err(Error::Config(format!(
            "conduit {} -> {} cannot {} on port '{}' with operator {}",
            conduit.sender,
            conduit.receiver,
            if sending { "send" } else { "receive" },
            port_name,
            port.operator.as_str()
        )));
    }
    Ok(())
}

/// Expands each compute element's multiplicity into the full set of
/// expected instance names. A scalar element yields its bare name; a
/// multiplicity `[n1, n2]` yields `n1 * n2` bracketed names covering the
/// whole index space in row-major order.
pub fn elements_for_model(model: &Model) -> Vec<Reference> {
    let mut names = Vec::new();
    for (kernel, declaration) in &model.compute_elements {
        for index in index_space(&declaration.multiplicity) {
            let mut name = kernel.clone();
            for i in index {
                name.push_index(i);
            }
            names.push(name);
        }
    }
    names
}

/// All index vectors of the given dimensions, row-major. No dimensions
/// means the single empty index.
fn index_space(dimensions: &[usize]) -> Vec<Vec<i64>> {
    let mut space = vec![Vec::new()];
    for &dimension in dimensions {
        let mut next = Vec::with_capacity(space.len() * dimension);
        for prefix in &space {
            for i in 0..dimension {
                let mut index = prefix.clone();
                index.push(i as i64);
                next.push(index);
            }
        }
        space = next;
    }
    space
}
