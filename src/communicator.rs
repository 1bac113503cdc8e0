//! Per-instance message exchange.
//!
//! The communicator owns an instance's ports, its post office, and its
//! transport servers and clients. Sending serializes a message once per
//! peer and deposits it; receiving asks the sending peer's transport for
//! the message addressed to our own endpoint and blocks until it is
//! there.
//!
//! ## Addressing
//!
//! Every instance has an index vector (`micro[3][7]` has `[3, 7]`), and
//! kernels joined by a conduit may differ in index rank by at most one.
//! The peer endpoint for a local `(port, slot)` follows from
//! concatenating our index with the slot and splitting the result at the
//! peer's rank: the leading part selects the peer instance, the
//! remainder is the peer-side slot. With equal ranks that is a
//! one-to-one link; one extra rank on our side makes a fan-in to a
//! vector port on the peer; one extra rank on the peer side makes our
//! port a vector fanning out over the peer instances.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{Message, Payload, WireMessage, CLOSE_TIMESTAMP};
use crate::model::{Conduit, Operator};
use crate::port::Port;
use crate::post_office::PostOffice;
use crate::reference::{validate_identifier, Reference, ReferencePart};
use crate::settings::Configuration;
use crate::transport::{
    self, DirectServer, Multiplexer, TcpTransportServer, TransportClient, TransportServer,
};

/// Name of the implicit per-instance settings input port.
pub const PARAMETERS_IN_PORT: &str = "muscle_parameters_in";

/// One end of a conduit, fully addressed down to the slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub kernel: Reference,
    pub index: Vec<i64>,
    pub port: String,
    pub slot: Vec<i64>,
}

impl Endpoint {
    /// The instance this endpoint lives on, `kernel[index...]`.
    pub fn instance(&self) -> Reference {
        let mut parts = self.kernel.parts().to_vec();
        parts.extend(self.index.iter().map(|i| ReferencePart::Index(*i)));
        Reference::from_parts_unchecked(parts)
    }

    /// The full reference messages are addressed by,
    /// `kernel[index...].port[slot...]`.
    pub fn reference(&self) -> Reference {
        let mut parts = self.kernel.parts().to_vec();
        parts.extend(self.index.iter().map(|i| ReferencePart::Index(*i)));
        parts.push(ReferencePart::Identifier(self.port.clone()));
        parts.extend(self.slot.iter().map(|s| ReferencePart::Index(*s)));
        Reference::from_parts_unchecked(parts)
    }
}

/// Handles all message traffic for one instance.
pub struct Communicator {
    kernel: Reference,
    index: Vec<i64>,
    declared_ports: Option<HashMap<Operator, Vec<String>>>,
    post_office: Arc<PostOffice>,
    servers: Vec<Box<dyn TransportServer>>,
    clients: HashMap<Reference, Box<dyn TransportClient>>,
    multiplexer: Option<Arc<Multiplexer>>,
    ports: HashMap<String, Port>,
    parameters_in: Port,
    /// Local port name to the peer endpoints its conduits attach it to.
    peers: HashMap<String, Vec<Reference>>,
    /// Peer kernel to its multiplicity.
    peer_dims: HashMap<Reference, Vec<usize>>,
    /// Peer instance to its registered locations.
    peer_locations: HashMap<Reference, Vec<String>>,
}

impl Communicator {
    /// Creates a communicator and starts its transport servers. The
    /// multiplexer handle comes from the process launcher when coupled
    /// instances share a process.
    pub fn new(
        kernel: Reference,
        index: Vec<i64>,
        declared_ports: Option<HashMap<Operator, Vec<String>>>,
        multiplexer: Option<Arc<Multiplexer>>,
    ) -> Result<Communicator> {
        let post_office = Arc::new(PostOffice::new());

        let mut instance = kernel.clone();
        for i in &index {
            instance.push_index(*i);
        }

        let mut servers: Vec<Box<dyn TransportServer>> = Vec::new();
        if let Some(mux) = &multiplexer {
            servers.push(Box::new(DirectServer::start(
                mux.clone(),
                instance,
                post_office.clone(),
            )));
        }
        servers.push(Box::new(TcpTransportServer::start(post_office.clone())?));

        Ok(Communicator {
            kernel,
            index,
            declared_ports,
            post_office,
            servers,
            clients: HashMap::new(),
            multiplexer,
            ports: HashMap::new(),
            parameters_in: Port::unconnected(PARAMETERS_IN_PORT, Operator::FInit, false),
            peers: HashMap::new(),
            peer_dims: HashMap::new(),
            peer_locations: HashMap::new(),
        })
    }

    /// The locations peers can reach this instance's servers at.
    pub fn get_locations(&self) -> Vec<String> {
        self.servers.iter().map(|server| server.location()).collect()
    }

    /// Wires this instance up from the manager's answer: records peers
    /// per local port and builds the port registry.
    pub fn connect(
        &mut self,
        conduits: &[Conduit],
        peer_dims: HashMap<Reference, Vec<usize>>,
        peer_locations: HashMap<Reference, Vec<String>>,
    ) -> Result<()> {
        self.peers.clear();
        for conduit in conduits {
            if conduit.sending_component()? == self.kernel {
                let port_name = conduit.sending_port()?;
                self.check_conduit_attachment(conduit, port_name, true)?;
                self.peers
                    .entry(port_name.to_string())
                    .or_default()
                    .push(conduit.receiver.clone());
            }
            if conduit.receiving_component()? == self.kernel {
                let port_name = conduit.receiving_port()?;
                self.check_conduit_attachment(conduit, port_name, false)?;
                self.peers
                    .entry(port_name.to_string())
                    .or_default()
                    .push(conduit.sender.clone());
            }
        }
        self.peer_dims = peer_dims;
        self.peer_locations = peer_locations;

        self.ports = match self.declared_ports.clone() {
            Some(declared) => self.ports_from_declared(&declared)?,
            None => self.ports_from_conduits(conduits)?,
        };
        self.parameters_in = self.build_port(
            PARAMETERS_IN_PORT,
            Operator::FInit,
            false,
        )?;
        Ok(())
    }

    /// Port names per operator. The implicit settings port is not
    /// listed. Vector ports appear without their `[]` suffix.
    pub fn list_ports(&self) -> HashMap<Operator, Vec<String>> {
        let mut result: HashMap<Operator, Vec<String>> = HashMap::new();
        for port in self.ports.values() {
            result
                .entry(port.operator)
                .or_default()
                .push(port.name().to_string());
        }
        for names in result.values_mut() {
            names.sort();
        }
        result
    }

    pub fn port_exists(&self, port_name: &str) -> bool {
        self.ports.contains_key(port_name) || port_name == PARAMETERS_IN_PORT
    }

    pub fn port(&self, port_name: &str) -> Result<&Port> {
        if port_name == PARAMETERS_IN_PORT {
            return Ok(&self.parameters_in);
        }
        self.ports.get(port_name).ok_or_else(|| self.no_such_port(port_name))
    }

    pub fn port_mut(&mut self, port_name: &str) -> Result<&mut Port> {
        if port_name == PARAMETERS_IN_PORT {
            return Ok(&mut self.parameters_in);
        }
        let error = self.no_such_port(port_name);
        self.ports.get_mut(port_name).ok_or(error)
    }

    pub fn parameters_in_connected(&self) -> bool {
        self.parameters_in.is_connected()
    }

    /// Sends a message on a port. One copy is deposited per peer; this
    /// does not wait for any receiver.
    pub fn send_message(
        &mut self,
        port_name: &str,
        message: &Message,
        slot: Option<usize>,
    ) -> Result<()> {
        let port = self
            .ports
            .get(port_name)
            .ok_or_else(|| self.no_such_port(port_name))?;
        Self::check_slot(port, slot)?;

        if !port.is_connected() {
            debug!("not sending on unconnected port {}", port_name);
            return Ok(());
        }

        let port_length = if port.is_resizable() && port.length_set() {
            Some(port.length() as u64)
        } else {
            None
        };

        let slot: Vec<i64> = slot.map(|s| vec![s as i64]).unwrap_or_default();
        let sender = Endpoint {
            kernel: self.kernel.clone(),
            index: self.index.clone(),
            port: port_name.to_string(),
            slot: slot.clone(),
        }
        .reference();

        let peer_refs = self.peers.get(port_name).cloned().unwrap_or_default();
        for peer_ref in peer_refs {
            let receiver = self.peer_endpoint(&peer_ref, &slot)?.reference();
            let wire = WireMessage {
                sender: sender.clone(),
                receiver: receiver.clone(),
                port_length,
                timestamp: message.timestamp,
                next_timestamp: message.next_timestamp,
                configuration: message.configuration.clone().unwrap_or_default(),
                data: message.data.clone(),
            };
            debug!("sending {} -> {}", sender, receiver);
            self.post_office.deposit(&receiver, wire.to_bytes()?);
        }
        Ok(())
    }

    /// Receives the next message addressed to `(port, slot)`, blocking
    /// until the sender has produced one. On an unconnected port the
    /// default is returned as given, or the call fails without one.
    pub fn receive_message(
        &mut self,
        port_name: &str,
        slot: Option<usize>,
        default: Option<Message>,
    ) -> Result<Message> {
        let port = self.port(port_name)?;
        Self::check_slot(port, slot)?;

        if !port.is_connected() {
            return default.ok_or_else(|| Error::NotConnected(port_name.to_string()));
        }

        let slot_vec: Vec<i64> = slot.map(|s| vec![s as i64]).unwrap_or_default();
        let receiver = Endpoint {
            kernel: self.kernel.clone(),
            index: self.index.clone(),
            port: port_name.to_string(),
            slot: slot_vec.clone(),
        }
        .reference();

        // A receiving port has exactly one conduit feeding it.
        let peer_ref = self
            .peers
            .get(port_name)
            .and_then(|peers| peers.first())
            .cloned()
            .ok_or_else(|| Error::NotConnected(port_name.to_string()))?;
        let sender_instance = self.peer_endpoint(&peer_ref, &slot_vec)?.instance();

        debug!("receiving {} from {}", receiver, sender_instance);
        let bytes = self.client_for(&sender_instance)?.get_message(&receiver)?;
        let wire = WireMessage::from_bytes(&bytes)?;

        if let Some(length) = wire.port_length {
            self.port_mut(port_name)?.learn_length(length as usize);
        }
        Ok(wire.into_message())
    }

    /// Sends the end-of-stream sentinel on one slot of a port.
    pub fn close_port(&mut self, port_name: &str, slot: Option<usize>) -> Result<()> {
        let message = Message::with_configuration(
            CLOSE_TIMESTAMP,
            None,
            Payload::ClosePort,
            Configuration::new(),
        );
        debug!("closing port {} slot {:?}", port_name, slot);
        self.send_message(port_name, &message, slot)
    }

    /// Waits for peers to pick up everything we sent, then stops the
    /// transports. The close protocol has already made peers drain their
    /// inputs, so the wait ends.
    pub fn shutdown(&mut self) {
        self.post_office.wait_until_empty();
        for client in self.clients.values_mut() {
            client.close();
        }
        for server in &mut self.servers {
            server.stop();
        }
    }

    fn no_such_port(&self, port_name: &str) -> Error {
        Error::NoSuchPort {
            port: port_name.to_string(),
            instance: self.kernel.to_string(),
        }
    }

    fn check_slot(port: &Port, slot: Option<usize>) -> Result<()> {
        match slot {
            Some(_) if !port.is_vector() => Err(Error::Protocol(format!(
                "port '{}' is scalar but a slot was given",
                port.name()
            ))),
            Some(s) if port.length_set() && s >= port.length() => {
                Err(Error::Protocol(format!(
                    "slot {} is out of range on port '{}' of length {}",
                    s,
                    port.name(),
                    port.length()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Resolves the peer endpoint reached from a local slot through the
    /// conduit towards `peer_ref`.
    fn peer_endpoint(&self, peer_ref: &Reference, slot: &[i64]) -> Result<Endpoint> {
        let peer_kernel = peer_ref.parent()?;
        let peer_port = peer_ref
            .last_identifier()
            .ok_or_else(|| {
                Error::Config(format!("'{}' does not name a peer port", peer_ref))
            })?
            .to_string();
        let peer_rank = self
            .peer_dims
            .get(&peer_kernel)
            .ok_or_else(|| {
                Error::Config(format!("no multiplicity known for peer '{}'", peer_kernel))
            })?
            .len();

        let mut total_index = self.index.clone();
        total_index.extend_from_slice(slot);
        if total_index.len() < peer_rank {
            return Err(Error::Protocol(format!(
                "cannot address an instance of '{}' from here without a slot",
                peer_kernel
            )));
        }
        let peer_slot = total_index.split_off(peer_rank);
        Ok(Endpoint {
            kernel: peer_kernel,
            index: total_index,
            port: peer_port,
            slot: peer_slot,
        })
    }

    fn client_for(&mut self, instance: &Reference) -> Result<&mut Box<dyn TransportClient>> {
        match self.clients.entry(instance.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let locations = self.peer_locations.get(instance).ok_or_else(|| {
                    Error::Config(format!("no locations known for peer instance '{}'", instance))
                })?;
                let client = transport::connect(locations, self.multiplexer.as_ref())?;
                Ok(entry.insert(client))
            }
        }
    }

    fn declared_operator(&self, port_name: &str) -> Option<Operator> {
        let declared = self.declared_ports.as_ref()?;
        for (&operator, names) in declared {
            for name in names {
                if name.trim_end_matches("[]") == port_name {
                    return Some(operator);
                }
            }
        }
        None
    }

    /// Checks that a conduit endpoint lands on a declared port whose
    /// operator permits the direction.
    fn check_conduit_attachment(
        &self,
        conduit: &Conduit,
        port_name: &str,
        sending: bool,
    ) -> Result<()> {
        if self.declared_ports.is_none() {
            return Ok(());
        }
        if !sending && port_name == PARAMETERS_IN_PORT {
            return Ok(());
        }
        let operator = self.declared_operator(port_name).ok_or_else(|| {
            Error::Config(format!(
                "conduit {} -> {} is attached to port '{}', which '{}' does \
                 not declare",
                conduit.sender, conduit.receiver, port_name, self.kernel
            ))
        })?;
        let legal = if sending { operator.allows_sending() } else { operator.allows_receiving() };
        if !legal {
            return Err(Error::Config(format!(
                "conduit {} -> {} cannot {} on port '{}' with operator {}",
                conduit.sender,
                conduit.receiver,
                if sending { "send" } else { "receive" },
                port_name,
                operator.as_str()
            )));
        }
        Ok(())
    }

    fn ports_from_declared(
        &self,
        declared: &HashMap<Operator, Vec<String>>,
    ) -> Result<HashMap<String, Port>> {
        let mut ports = HashMap::new();
        for (&operator, names) in declared {
            for declared_name in names {
                let vector = declared_name.ends_with("[]");
                let name = declared_name.trim_end_matches("[]");
                validate_identifier(name)?;
                if name == PARAMETERS_IN_PORT {
                    return Err(Error::Config(format!(
                        "port name '{}' is reserved",
                        PARAMETERS_IN_PORT
                    )));
                }
                ports.insert(name.to_string(), self.build_port(name, operator, vector)?);
            }
        }
        Ok(ports)
    }

    /// Without declarations, ports are inferred from the conduits: every
    /// incoming conduit makes an F_INIT port, every outgoing one an O_F
    /// port. This is how mappers with arbitrary port sets work.
    fn ports_from_conduits(&self, conduits: &[Conduit]) -> Result<HashMap<String, Port>> {
        let mut ports = HashMap::new();
        for conduit in conduits {
            let (port_name, operator) = if conduit.sending_component()? == self.kernel {
                (conduit.sending_port()?, Operator::OF)
            } else if conduit.receiving_component()? == self.kernel {
                (conduit.receiving_port()?, Operator::FInit)
            } else {
                continue;
            };
            if port_name == PARAMETERS_IN_PORT || ports.contains_key(port_name) {
                continue;
            }
            ports.insert(
                port_name.to_string(),
                self.build_port(port_name, operator, false)?,
            );
        }
        Ok(ports)
    }

    fn build_port(&self, name: &str, operator: Operator, vector: bool) -> Result<Port> {
        let peer_list = self.peers.get(name).cloned().unwrap_or_default();
        if peer_list.is_empty() {
            return Ok(Port::unconnected(name, operator, vector));
        }
        let dims = self.common_peer_dims(name, &peer_list)?;
        Port::new(name, operator, vector, true, self.index.len(), dims, peer_list)
    }

    /// All peers of a port must have the same multiplicity, or slots
    /// would be ambiguous.
    fn common_peer_dims(&self, name: &str, peer_list: &[Reference]) -> Result<Vec<usize>> {
        let mut dims: Option<Vec<usize>> = None;
        for peer_ref in peer_list {
            let peer_kernel = peer_ref.parent()?;
            let peer_dims = self.peer_dims.get(&peer_kernel).ok_or_else(|| {
                Error::Config(format!("no multiplicity known for peer '{}'", peer_kernel))
            })?;
            match &dims {
                None => dims = Some(peer_dims.clone()),
                Some(existing) if existing == peer_dims => {}
                Some(_) => {
                    return Err(Error::Config(format!(
                        "the peers of port '{}' have differing multiplicities",
                        name
                    )))
                }
            }
        }
        Ok(dims.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(text: &str) -> Reference {
        Reference::new(text).unwrap()
    }

    fn declared(entries: &[(Operator, &[&str])]) -> Option<HashMap<Operator, Vec<String>>> {
        Some(
            entries
                .iter()
                .map(|(op, names)| {
                    (*op, names.iter().map(|n| n.to_string()).collect())
                })
                .collect(),
        )
    }

    fn dims(entries: &[(&str, &[usize])]) -> HashMap<Reference, Vec<usize>> {
        entries
            .iter()
            .map(|(name, d)| (reference(name), d.to_vec()))
            .collect()
    }

    struct TestNet {
        multiplexer: Arc<Multiplexer>,
    }

    impl TestNet {
        fn new() -> TestNet {
            TestNet { multiplexer: Multiplexer::new() }
        }

        fn communicator(
            &self,
            kernel: &str,
            index: &[i64],
            ports: Option<HashMap<Operator, Vec<String>>>,
        ) -> Communicator {
            Communicator::new(
                reference(kernel),
                index.to_vec(),
                ports,
                Some(self.multiplexer.clone()),
            )
            .unwrap()
        }

        fn locations(&self, instances: &[&str]) -> HashMap<Reference, Vec<String>> {
            instances
                .iter()
                .map(|name| {
                    let instance = reference(name);
                    let address = self.multiplexer.address_for(&instance);
                    (instance, vec![address])
                })
                .collect()
        }
    }

    #[test]
    fn endpoint_references() {
        let endpoint = Endpoint {
            kernel: reference("micro"),
            index: vec![3, 7],
            port: "out".to_string(),
            slot: vec![2],
        };
        assert_eq!(endpoint.instance().to_string(), "micro[3][7]");
        assert_eq!(endpoint.reference().to_string(), "micro[3][7].out[2]");
    }

    #[test]
    fn one_to_one_send_receive_is_fifo() {
        let net = TestNet::new();
        let mut sender = net.communicator(
            "sender",
            &[],
            declared(&[(Operator::OF, &["out"])]),
        );
        let mut receiver = net.communicator(
            "receiver",
            &[],
            declared(&[(Operator::FInit, &["in"])]),
        );

        let conduits = vec![Conduit::new("sender.out", "receiver.in").unwrap()];
        let locations = net.locations(&["sender", "receiver"]);
        sender
            .connect(&conduits, dims(&[("receiver", &[])]), locations.clone())
            .unwrap();
        receiver
            .connect(&conduits, dims(&[("sender", &[])]), locations)
            .unwrap();

        for i in 0..3i64 {
            sender
                .send_message(
                    "out",
                    &Message::with_configuration(
                        i as f64,
                        Some(i as f64 + 1.0),
                        Payload::Int(i),
                        Configuration::new(),
                    ),
                    None,
                )
                .unwrap();
        }

        for i in 0..3i64 {
            let message = receiver.receive_message("in", None, None).unwrap();
            assert_eq!(message.data, Payload::Int(i));
            assert_eq!(message.timestamp, i as f64);
            assert_eq!(message.configuration, Some(Configuration::new()));
        }

        sender.shutdown();
        receiver.shutdown();
    }

    #[test]
    fn fan_out_addresses_each_peer_by_slot() {
        let net = TestNet::new();
        let mut macro_comm = net.communicator(
            "macro",
            &[],
            declared(&[(Operator::OF, &["out[]"])]),
        );
        let conduits = vec![Conduit::new("macro.out", "micro.in").unwrap()];
        let locations =
            net.locations(&["macro", "micro[0]", "micro[1]", "micro[2]"]);
        macro_comm
            .connect(&conduits, dims(&[("micro", &[3])]), locations.clone())
            .unwrap();
        assert_eq!(macro_comm.port("out").unwrap().length(), 3);

        let mut micros: Vec<Communicator> = (0..3)
            .map(|i| {
                let mut comm = net.communicator(
                    "micro",
                    &[i],
                    declared(&[(Operator::FInit, &["in"])]),
                );
                comm.connect(&conduits, dims(&[("macro", &[])]), locations.clone())
                    .unwrap();
                comm
            })
            .collect();

        for slot in 0..3usize {
            macro_comm
                .send_message(
                    "out",
                    &Message::new(0.0, None, Payload::Int(slot as i64 * 10)),
                    Some(slot),
                )
                .unwrap();
        }

        for (i, micro) in micros.iter_mut().enumerate() {
            let message = micro.receive_message("in", None, None).unwrap();
            assert_eq!(message.data, Payload::Int(i as i64 * 10));
        }

        macro_comm.shutdown();
        for mut micro in micros {
            micro.shutdown();
        }
    }

    #[test]
    fn fan_in_arrives_on_the_matching_slot() {
        let net = TestNet::new();
        let conduits = vec![Conduit::new("micro.out", "macro.in").unwrap()];
        let locations =
            net.locations(&["macro", "micro[0]", "micro[1]", "micro[2]"]);

        let mut macro_comm = net.communicator(
            "macro",
            &[],
            declared(&[(Operator::FInit, &["in[]"])]),
        );
        macro_comm
            .connect(&conduits, dims(&[("micro", &[3])]), locations.clone())
            .unwrap();
        assert_eq!(macro_comm.port("in").unwrap().length(), 3);

        let mut micros: Vec<Communicator> = (0..3i64)
            .map(|i| {
                let mut micro = net.communicator(
                    "micro",
                    &[i],
                    declared(&[(Operator::OF, &["out"])]),
                );
                micro
                    .connect(&conduits, dims(&[("macro", &[])]), locations.clone())
                    .unwrap();
                micro
                    .send_message("out", &Message::new(0.0, None, Payload::Int(i)), None)
                    .unwrap();
                micro
            })
            .collect();

        for slot in 0..3usize {
            let message =
                macro_comm.receive_message("in", Some(slot), None).unwrap();
            assert_eq!(message.data, Payload::Int(slot as i64));
        }

        for micro in &mut micros {
            micro.shutdown();
        }
        macro_comm.shutdown();
    }

    #[test]
    fn unconnected_receive_uses_the_default() {
        let net = TestNet::new();
        let mut comm = net.communicator(
            "solo",
            &[],
            declared(&[(Operator::FInit, &["in"])]),
        );
        comm.connect(&[], HashMap::new(), HashMap::new()).unwrap();

        let default = Message::new(0.0, None, Payload::Bool(true));
        let message = comm
            .receive_message("in", None, Some(default.clone()))
            .unwrap();
        assert_eq!(message, default);

        assert!(matches!(
            comm.receive_message("in", None, None),
            Err(Error::NotConnected(name)) if name == "in"
        ));
        comm.shutdown();
    }

    #[test]
    fn unknown_port_is_rejected() {
        let net = TestNet::new();
        let mut comm = net.communicator("solo", &[], declared(&[]));
        comm.connect(&[], HashMap::new(), HashMap::new()).unwrap();
        assert!(matches!(
            comm.send_message("nope", &Message::new(0.0, None, Payload::Int(1)), None),
            Err(Error::NoSuchPort { .. })
        ));
        comm.shutdown();
    }

    #[test]
    fn scalar_port_to_higher_rank_peer_is_rejected_at_connect() {
        let net = TestNet::new();
        let mut comm = net.communicator(
            "macro",
            &[],
            declared(&[(Operator::OF, &["out"])]),
        );
        let conduits = vec![Conduit::new("macro.out", "micro.in").unwrap()];
        let result = comm.connect(
            &conduits,
            dims(&[("micro", &[3])]),
            net.locations(&["macro"]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
        comm.shutdown();
    }

    #[test]
    fn conduit_direction_must_match_the_operator() {
        let net = TestNet::new();
        let mut comm = net.communicator(
            "macro",
            &[],
            declared(&[(Operator::FInit, &["out"])]),
        );
        let conduits = vec![Conduit::new("macro.out", "micro.in").unwrap()];
        let result = comm.connect(
            &conduits,
            dims(&[("micro", &[])]),
            net.locations(&["macro"]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
        comm.shutdown();
    }

    #[test]
    fn inferred_ports_follow_the_conduits() {
        let net = TestNet::new();
        let mut comm = net.communicator("dm", &[], None);
        let conduits = vec![
            Conduit::new("dm.out1", "first.in").unwrap(),
            Conduit::new("dm.out2", "second.in").unwrap(),
        ];
        comm.connect(
            &conduits,
            dims(&[("first", &[]), ("second", &[])]),
            net.locations(&["dm", "first", "second"]),
        )
        .unwrap();

        let ports = comm.list_ports();
        assert_eq!(
            ports.get(&Operator::OF),
            Some(&vec!["out1".to_string(), "out2".to_string()])
        );
        comm.shutdown();
    }

    #[test]
    fn resizable_port_length_travels_with_messages() {
        let net = TestNet::new();
        let conduits = vec![Conduit::new("left.out", "right.in").unwrap()];
        let locations = net.locations(&["left", "right"]);

        let mut left = net.communicator(
            "left",
            &[],
            declared(&[(Operator::OF, &["out[]"])]),
        );
        left.connect(&conduits, dims(&[("right", &[])]), locations.clone())
            .unwrap();
        assert!(left.port("out").unwrap().is_resizable());
        left.port_mut("out").unwrap().set_length(2).unwrap();

        let mut right = net.communicator(
            "right",
            &[],
            declared(&[(Operator::FInit, &["in[]"])]),
        );
        right
            .connect(&conduits, dims(&[("left", &[])]), locations)
            .unwrap();
        assert!(!right.port("in").unwrap().length_set());

        for slot in 0..2usize {
            left.send_message(
                "out",
                &Message::new(0.0, None, Payload::Int(slot as i64)),
                Some(slot),
            )
            .unwrap();
        }

        let first = right.receive_message("in", Some(0), None).unwrap();
        assert_eq!(first.data, Payload::Int(0));
        assert_eq!(right.port("in").unwrap().length(), 2);
        let second = right.receive_message("in", Some(1), None).unwrap();
        assert_eq!(second.data, Payload::Int(1));

        left.shutdown();
        right.shutdown();
    }
}
