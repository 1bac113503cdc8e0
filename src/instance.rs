//! The instance library.
//!
//! An [`Instance`] is what a simulation component embeds to take part in
//! a coupled run. On construction it registers with the manager,
//! resolves its peers, and fetches the base settings; after that the
//! user runs a reuse loop:
//!
//! ```ignore
//! let mut instance = Instance::new("micro", ports, InstanceOptions::default())?;
//! while instance.reuse_instance()? {
//!     // F_INIT: receive on F_INIT ports
//!     // then (O_I send, S receive) repeated, then O_F send
//! }
//! ```
//!
//! [`reuse_instance`](Instance::reuse_instance) decides whether to run
//! another iteration. It consumes the settings overlay for the coming
//! iteration, pre-receives all F_INIT messages into a cache the user
//! then reads from, and on the last iteration runs the close protocol:
//! every outgoing slot gets an end-of-stream message and every incoming
//! slot is drained until one arrives, so both sides agree the stream is
//! over and no message is lost.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::cli;
use crate::communicator::{Communicator, PARAMETERS_IN_PORT};
use crate::error::{Error, Result};
use crate::logging::{self, LogLevel, LogMessage, Timestamp};
use crate::message::{Message, Payload};
use crate::mmp::{MMPClient, PortDescription};
use crate::model::Operator;
use crate::reference::Reference;
use crate::settings::{Configuration, ConfigurationStore, ParameterType, ParameterValue};
use crate::transport::Multiplexer;

/// Ways to override what is normally taken from the command line.
///
/// An embedding program usually passes `InstanceOptions::default()` and
/// lets the `--muscle-*` flags decide; the in-process launcher fills
/// these in explicitly instead, including the shared multiplexer.
#[derive(Default, Clone)]
pub struct InstanceOptions {
    /// Manager endpoint, `host:port`.
    pub manager_location: Option<String>,
    /// Index to prepend to the index embedded in the instance id.
    pub index: Option<Vec<i64>>,
    /// Log file path, or a directory to put the default file name in.
    pub log_file: Option<PathBuf>,
    /// In-process message routing, when instances share a process.
    pub multiplexer: Option<Arc<Multiplexer>>,
}

type FInitCache = HashMap<(String, Option<usize>), Message>;

/// One running instance of a compute element.
pub struct Instance {
    name: Reference,
    manager: MMPClient,
    communicator: Communicator,
    configuration_store: ConfigurationStore,
    first_run: bool,
    f_init_cache: FInitCache,
    deregistered: bool,
    _log_guard: Option<WorkerGuard>,
}

impl Instance {
    /// Creates an instance, registers it with the manager, and connects
    /// it to its peers. Blocks until all peers have registered.
    ///
    /// `instance_id` may carry an index (`micro[3]`); an index from the
    /// command line or options is prepended to it. `ports` maps each
    /// operator to its port names, `"name[]"` declaring a vector port;
    /// mappers may pass `None` to have their ports inferred from the
    /// conduits.
    pub fn new(
        instance_id: &str,
        ports: Option<HashMap<Operator, Vec<String>>>,
        options: InstanceOptions,
    ) -> Result<Instance> {
        let id = Reference::new(instance_id)?;
        let (kernel, embedded_index) = id.split_instance()?;

        let args = cli::process_args();
        let mut index = match options.index {
            Some(index) => index,
            None => cli::extract_index(&args)?,
        };
        index.extend(embedded_index);

        let mut name = kernel.clone();
        for i in &index {
            name.push_index(*i);
        }

        let log_path = logging::instance_log_file(
            &name,
            options.log_file.or_else(|| cli::extract_log_file(&args)),
        );
        let log_guard = logging::init_instance_logging(&log_path);

        let manager_location = options
            .manager_location
            .or_else(|| cli::extract_manager_location(&args))
            .unwrap_or_else(|| cli::DEFAULT_MANAGER_LOCATION.to_string());

        let mut manager = MMPClient::connect(&manager_location)?;
        let mut communicator =
            Communicator::new(kernel, index, ports.clone(), options.multiplexer)?;

        manager.register_instance(
            &name,
            communicator.get_locations(),
            declared_port_descriptions(&ports),
        )?;
        info!("instance {} registered with the manager", name);

        let (conduits, peer_dims, peer_locations) = manager.request_peers(&name)?;
        communicator.connect(&conduits, peer_dims, peer_locations)?;

        let mut configuration_store = ConfigurationStore::new();
        configuration_store.base = manager.get_configuration()?;
        debug!("instance {} connected to its peers", name);

        Ok(Instance {
            name,
            manager,
            communicator,
            configuration_store,
            first_run: true,
            f_init_cache: HashMap::new(),
            deregistered: false,
            _log_guard: log_guard,
        })
    }

    /// The full name of this instance, including its index.
    pub fn name(&self) -> &Reference {
        &self.name
    }

    /// Decides whether to run another iteration of the reuse loop,
    /// applying any received settings overlay.
    ///
    /// Call this at the top of the reuse loop, before any receive of the
    /// iteration. When it returns false the instance has closed its
    /// ports and deregistered, and the loop must be left.
    pub fn reuse_instance(&mut self) -> Result<bool> {
        self.reuse_instance_with_overlay(true)
    }

    /// Like [`reuse_instance`](Self::reuse_instance), but leaves received
    /// overlays attached to the messages instead of applying them. For
    /// ensemble-aware components that pass overlays on explicitly with
    /// [`receive_message_with_parameters`](Self::receive_message_with_parameters).
    pub fn reuse_instance_with_overlay(&mut self, apply_overlay: bool) -> Result<bool> {
        let mut do_reuse = self.receive_parameters()?;

        if !self.f_init_cache.is_empty() {
            self.forward_warning(
                "unreceived messages from the previous iteration were discarded",
            );
        }
        self.pre_receive_f_init(apply_overlay)?;

        let ports = self.communicator.list_ports();
        let f_init_connected = match ports.get(&Operator::FInit) {
            Some(names) => names
                .iter()
                .any(|name| self.is_connected(name).unwrap_or(false)),
            None => false,
        };

        if !f_init_connected && !self.communicator.parameters_in_connected() {
            // Nothing tells this instance when to stop, so it runs
            // exactly once.
            do_reuse = self.first_run;
            self.first_run = false;
        } else if self
            .f_init_cache
            .values()
            .any(|message| message.data.is_close_port())
        {
            do_reuse = false;
        }

        if !do_reuse {
            info!("instance {} is shutting down", self.name);
            self.close_ports()?;
            self.communicator.shutdown();
            self.deregister()?;
        }
        Ok(do_reuse)
    }

    /// Sends a message on a port. Non-blocking; the message is stored
    /// until the receiver picks it up. The current overlay is attached
    /// unless the message already carries a configuration.
    pub fn send_message(
        &mut self,
        port_name: &str,
        mut message: Message,
        slot: Option<usize>,
    ) -> Result<()> {
        if message.configuration.is_none() {
            message.configuration = Some(self.configuration_store.overlay.clone());
        }
        self.communicator.send_message(port_name, &message, slot)
    }

    /// Receives a message from a port, blocking until one is available.
    /// The configuration attribute of the returned message is `None`.
    ///
    /// On an unconnected port the default is returned as given; with no
    /// default the call fails.
    pub fn receive_message(
        &mut self,
        port_name: &str,
        slot: Option<usize>,
        default: Option<Message>,
    ) -> Result<Message> {
        self.receive(port_name, slot, default, false)
    }

    /// Receives a message with its settings overlay still attached. Not
    /// for use in submodels; ensemble-aware components use this to pass
    /// overlays on explicitly.
    pub fn receive_message_with_parameters(
        &mut self,
        port_name: &str,
        slot: Option<usize>,
        default: Option<Message>,
    ) -> Result<Message> {
        self.receive(port_name, slot, default, true)
    }

    /// Looks up a setting, checking the current overlay first.
    pub fn get_parameter_value(
        &self,
        name: &str,
        expected: Option<ParameterType>,
    ) -> Result<ParameterValue> {
        self.configuration_store
            .get_parameter(&self.name, &Reference::new(name)?, expected)
    }

    /// The ports of this instance per operator, without vector suffixes.
    pub fn list_ports(&self) -> HashMap<Operator, Vec<String>> {
        self.communicator.list_ports()
    }

    pub fn is_connected(&self, port_name: &str) -> Result<bool> {
        Ok(self.communicator.port(port_name)?.is_connected())
    }

    pub fn is_vector_port(&self, port_name: &str) -> Result<bool> {
        Ok(self.communicator.port(port_name)?.is_vector())
    }

    pub fn is_resizable(&self, port_name: &str) -> Result<bool> {
        Ok(self.communicator.port(port_name)?.is_resizable())
    }

    /// The current length of a vector port.
    pub fn get_port_length(&self, port_name: &str) -> Result<usize> {
        let port = self.communicator.port(port_name)?;
        if !port.is_vector() {
            return Err(Error::Protocol(format!(
                "port '{}' is scalar and has no length",
                port_name
            )));
        }
        Ok(port.length())
    }

    /// Resizes a vector port. Check
    /// [`is_resizable`](Self::is_resizable) first; whether a port can be
    /// resized depends on how it is wired up.
    pub fn set_port_length(&mut self, port_name: &str, length: usize) -> Result<()> {
        self.communicator.port_mut(port_name)?.set_length(length)
    }

    /// Best-effort shutdown after a fatal error: reports the cause to
    /// the manager and deregisters, swallowing secondary failures so the
    /// original cause stays visible.
    pub fn error_shutdown(&mut self, cause: &str) {
        warn!("instance {} shutting down after an error: {}", self.name, cause);
        let record = LogMessage {
            instance_id: self.name.clone(),
            operator: Operator::None,
            timestamp: Timestamp::now(),
            level: LogLevel::Critical,
            text: cause.to_string(),
        };
        let _ = self.manager.submit_log_message(record);
        if !self.deregistered {
            let _ = self.manager.deregister_instance(&self.name);
            self.deregistered = true;
        }
    }

    fn receive(
        &mut self,
        port_name: &str,
        slot: Option<usize>,
        default: Option<Message>,
        with_parameters: bool,
    ) -> Result<Message> {
        let port = self.communicator.port(port_name)?;
        let operator = port.operator;
        let connected = port.is_connected();

        if operator == Operator::FInit {
            match self.f_init_cache.remove(&(port_name.to_string(), slot)) {
                Some(message) => {
                    if with_parameters && message.configuration.is_none() {
                        return Err(Error::Protocol(
                            "receiving with parameters on an F_INIT port requires \
                             calling reuse_instance with apply_overlay set to false"
                                .to_string(),
                        ));
                    }
                    Ok(message)
                }
                None if connected => Err(Error::Protocol(format!(
                    "tried to receive twice on port '{}' within one iteration; \
                     did you forget to call reuse_instance in your reuse loop?",
                    port_name
                ))),
                None => default.ok_or_else(|| Error::NotConnected(port_name.to_string())),
            }
        } else {
            let mut message = self.communicator.receive_message(port_name, slot, default)?;
            if !with_parameters {
                self.check_compatibility(port_name, message.configuration.as_ref())?;
                message.configuration = None;
            }
            Ok(message)
        }
    }

    /// Receives the overlay for the coming iteration on the implicit
    /// settings port. Returns false iff the port is connected and the
    /// sender closed it.
    fn receive_parameters(&mut self) -> Result<bool> {
        let default = Message::with_configuration(
            0.0,
            None,
            Payload::Configuration(Configuration::new()),
            Configuration::new(),
        );
        let message =
            self.communicator
                .receive_message(PARAMETERS_IN_PORT, None, Some(default))?;
        match message.data {
            Payload::ClosePort => Ok(false),
            Payload::Configuration(diff) => {
                let mut overlay = message.configuration.unwrap_or_default();
                overlay.update(&diff);
                self.configuration_store.overlay = overlay;
                Ok(true)
            }
            _ => Err(Error::Protocol(format!(
                "'{}' received a message on {} that is not a settings \
                 overlay; the simulation is miswired or the sending instance \
                 is broken",
                self.name, PARAMETERS_IN_PORT
            ))),
        }
    }

    /// Receives once on every connected F_INIT port (slot by slot for
    /// vector ports) into the cache the user will read from.
    fn pre_receive_f_init(&mut self, apply_overlay: bool) -> Result<()> {
        self.f_init_cache.clear();
        let names = self
            .communicator
            .list_ports()
            .remove(&Operator::FInit)
            .unwrap_or_default();
        for name in names {
            let port = self.communicator.port(&name)?;
            let (connected, vector) = (port.is_connected(), port.is_vector());
            if !connected {
                continue;
            }
            if !vector {
                self.pre_receive(&name, None, apply_overlay)?;
            } else {
                // Slot 0 carries the length if it was not fixed by the
                // topology, so it must come in first.
                self.pre_receive(&name, Some(0), apply_overlay)?;
                let length = self.communicator.port(&name)?.length();
                for slot in 1..length {
                    self.pre_receive(&name, Some(slot), apply_overlay)?;
                }
            }
        }
        Ok(())
    }

    fn pre_receive(
        &mut self,
        port_name: &str,
        slot: Option<usize>,
        apply_overlay: bool,
    ) -> Result<()> {
        let mut message = self.communicator.receive_message(port_name, slot, None)?;
        if apply_overlay {
            if let Some(configuration) = &message.configuration {
                if self.configuration_store.overlay.is_empty() && !configuration.is_empty()
                {
                    self.configuration_store.overlay = configuration.clone();
                }
            }
            self.check_compatibility(port_name, message.configuration.as_ref())?;
            message.configuration = None;
        }
        self.f_init_cache.insert((port_name.to_string(), slot), message);
        Ok(())
    }

    /// Every overlay received within one iteration must equal the
    /// current one; anything else means the ensemble is miswired.
    fn check_compatibility(
        &self,
        port_name: &str,
        overlay: Option<&Configuration>,
    ) -> Result<()> {
        let Some(overlay) = overlay else { return Ok(()) };
        if &self.configuration_store.overlay != overlay {
            return Err(Error::ParallelUniverse {
                port: port_name.to_string(),
                ours: self.configuration_store.overlay.to_string(),
                theirs: overlay.to_string(),
            });
        }
        Ok(())
    }

    /// The close protocol: tell every receiver we are done, then wait
    /// until every sender has told us.
    fn close_ports(&mut self) -> Result<()> {
        self.close_outgoing_ports()?;
        self.drain_f_init_ports()?;
        self.close_incoming_ports()?;
        Ok(())
    }

    /// Sends an end-of-stream message on every slot of every sending
    /// port.
    fn close_outgoing_ports(&mut self) -> Result<()> {
        for (operator, names) in self.communicator.list_ports() {
            if !operator.allows_sending() {
                continue;
            }
            for name in names {
                let port = self.communicator.port(&name)?;
                let (vector, length) = (port.is_vector(), port.length());
                if vector {
                    for slot in 0..length {
                        self.communicator.close_port(&name, Some(slot))?;
                    }
                } else {
                    self.communicator.close_port(&name, None)?;
                }
            }
        }
        Ok(())
    }

    /// Receives on a port until the sender closes it.
    fn drain_incoming_port(&mut self, port_name: &str) -> Result<()> {
        loop {
            let message = self.communicator.receive_message(port_name, None, None)?;
            if message.data.is_close_port() {
                return Ok(());
            }
        }
    }

    /// Vector variant: a full pass over all slots per round, slot 0
    /// first since it carries the length.
    fn drain_incoming_vector_port(&mut self, port_name: &str) -> Result<()> {
        loop {
            let head = self.communicator.receive_message(port_name, Some(0), None)?;
            let length = self.communicator.port(port_name)?.length();
            for slot in 1..length {
                self.communicator.receive_message(port_name, Some(slot), None)?;
            }
            if head.data.is_close_port() {
                return Ok(());
            }
        }
    }

    /// F_INIT ports drain through the cache: the head slot decides
    /// whether the sender already closed; cached messages for the other
    /// slots are discarded either way.
    fn drain_f_init_ports(&mut self) -> Result<()> {
        let names = self
            .communicator
            .list_ports()
            .remove(&Operator::FInit)
            .unwrap_or_default();
        for name in names {
            if let Some(head) = self.f_init_cache.remove(&(name.clone(), None)) {
                if !head.data.is_close_port() {
                    self.drain_incoming_port(&name)?;
                }
            } else if let Some(head) = self.f_init_cache.remove(&(name.clone(), Some(0))) {
                let length = self.communicator.port(&name)?.length();
                for slot in 1..length {
                    self.f_init_cache.remove(&(name.clone(), Some(slot)));
                }
                if !head.data.is_close_port() {
                    self.drain_incoming_vector_port(&name)?;
                }
            }
        }
        self.f_init_cache.clear();
        Ok(())
    }

    /// Drains every other connected receiving port until its sender
    /// closes it, so senders are free to shut down.
    fn close_incoming_ports(&mut self) -> Result<()> {
        for (operator, names) in self.communicator.list_ports() {
            if operator == Operator::FInit || !operator.allows_receiving() {
                continue;
            }
            for name in names {
                let port = self.communicator.port(&name)?;
                let (connected, vector) = (port.is_connected(), port.is_vector());
                if !connected {
                    continue;
                }
                if vector {
                    self.drain_incoming_vector_port(&name)?;
                } else {
                    self.drain_incoming_port(&name)?;
                }
            }
        }
        Ok(())
    }

    fn deregister(&mut self) -> Result<()> {
        if !self.deregistered {
            self.manager.deregister_instance(&self.name)?;
            self.manager.close();
            self.deregistered = true;
            info!("instance {} deregistered", self.name);
        }
        Ok(())
    }

    /// Warns locally and forwards the warning to the manager's log sink.
    fn forward_warning(&mut self, text: &str) {
        warn!("{}: {}", self.name, text);
        let record = LogMessage {
            instance_id: self.name.clone(),
            operator: Operator::None,
            timestamp: Timestamp::now(),
            level: LogLevel::Warning,
            text: text.to_string(),
        };
        if let Err(e) = self.manager.submit_log_message(record) {
            debug!("could not forward a log record to the manager: {}", e);
        }
    }
}

/// The port list sent along with a registration: names with the vector
/// suffix stripped, plus their operators.
fn declared_port_descriptions(
    ports: &Option<HashMap<Operator, Vec<String>>>,
) -> Vec<PortDescription> {
    let mut descriptions = Vec::new();
    if let Some(ports) = ports {
        for (&operator, names) in ports {
            for name in names {
                descriptions.push(PortDescription {
                    name: name.trim_end_matches("[]").to_string(),
                    operator,
                });
            }
        }
    }
    descriptions.sort_by(|a, b| a.name.cmp(&b.name));
    descriptions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_ports_lose_their_vector_suffix() {
        let mut ports = HashMap::new();
        ports.insert(
            Operator::FInit,
            vec!["in[]".to_string(), "settings".to_string()],
        );
        ports.insert(Operator::OF, vec!["out".to_string()]);

        let descriptions = declared_port_descriptions(&Some(ports));
        assert_eq!(descriptions.len(), 3);
        assert_eq!(descriptions[0].name, "in");
        assert_eq!(descriptions[0].operator, Operator::FInit);
        assert_eq!(descriptions[1].name, "out");
        assert_eq!(descriptions[2].name, "settings");

        assert!(declared_port_descriptions(&None).is_empty());
    }
}
