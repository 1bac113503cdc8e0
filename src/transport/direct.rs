//! In-process transport.
//!
//! When coupled instances run as threads of a single process, messages
//! do not need to cross a socket: the receiver can pull straight from
//! the sender's post office. The [`Multiplexer`] makes that possible
//! without the instances holding pointers to each other. It is owned by
//! the process launcher and a handle is passed to every spawned
//! instance; each instance registers its post office under its own name
//! and looks peers up by the address the manager handed out.
//!
//! Addresses carry a per-multiplexer id so that an address from another
//! process is recognized as unreachable and the TCP transport takes
//! over.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;
use uuid::Uuid;

use super::{TransportClient, TransportServer};
use crate::error::{Error, Result};
use crate::post_office::PostOffice;
use crate::reference::Reference;

/// Routing table connecting the instances of one process.
pub struct Multiplexer {
    id: Uuid,
    post_offices: RwLock<HashMap<Reference, Arc<PostOffice>>>,
}

impl Multiplexer {
    pub fn new() -> Arc<Multiplexer> {
        Arc::new(Multiplexer {
            id: Uuid::new_v4(),
            post_offices: RwLock::new(HashMap::new()),
        })
    }

    /// The address peers use to reach the given instance through this
    /// multiplexer.
    pub fn address_for(&self, instance: &Reference) -> String {
        format!("direct:{}/{}", self.id, instance)
    }

    /// Whether the address names an instance behind this multiplexer.
    /// Addresses minted by another process have a different id.
    pub fn can_connect_to(&self, location: &str) -> bool {
        match Self::split_address(location) {
            Some((id, _)) => id == self.id.to_string(),
            None => false,
        }
    }

    fn split_address(location: &str) -> Option<(&str, &str)> {
        location.strip_prefix("direct:")?.split_once('/')
    }

    fn register(&self, instance: Reference, post_office: Arc<PostOffice>) {
        debug!("registering {} with the multiplexer", instance);
        self.post_offices
            .write()
            .expect("multiplexer lock poisoned")
            .insert(instance, post_office);
    }

    fn deregister(&self, instance: &Reference) {
        debug!("deregistering {} from the multiplexer", instance);
        self.post_offices
            .write()
            .expect("multiplexer lock poisoned")
            .remove(instance);
    }

    fn post_office_for(&self, instance: &Reference) -> Option<Arc<PostOffice>> {
        self.post_offices
            .read()
            .expect("multiplexer lock poisoned")
            .get(instance)
            .cloned()
    }
}

/// The serving side of the direct transport: a registration of one
/// instance's post office with the multiplexer.
pub struct DirectServer {
    multiplexer: Arc<Multiplexer>,
    instance: Reference,
    active: bool,
}

impl DirectServer {
    pub fn start(
        multiplexer: Arc<Multiplexer>,
        instance: Reference,
        post_office: Arc<PostOffice>,
    ) -> DirectServer {
        multiplexer.register(instance.clone(), post_office);
        DirectServer { multiplexer, instance, active: true }
    }
}

impl TransportServer for DirectServer {
    fn location(&self) -> String {
        self.multiplexer.address_for(&self.instance)
    }

    fn stop(&mut self) {
        if self.active {
            self.multiplexer.deregister(&self.instance);
            self.active = false;
        }
    }
}

impl Drop for DirectServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The requesting side: holds the peer's post office and pulls from it.
pub struct DirectClient {
    post_office: Arc<PostOffice>,
}

impl DirectClient {
    pub fn connect(multiplexer: Arc<Multiplexer>, location: &str) -> Result<DirectClient> {
        let (_, instance) = Multiplexer::split_address(location).ok_or_else(|| {
            Error::Config(format!("'{}' is not a direct transport address", location))
        })?;
        let instance = Reference::new(instance)?;
        let post_office = multiplexer.post_office_for(&instance).ok_or_else(|| {
            Error::Config(format!(
                "instance '{}' is not registered with this multiplexer",
                instance
            ))
        })?;
        Ok(DirectClient { post_office })
    }
}

impl TransportClient for DirectClient {
    fn get_message(&mut self, receiver: &Reference) -> Result<Vec<u8>> {
        self.post_office.retrieve(receiver)
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(text: &str) -> Reference {
        Reference::new(text).unwrap()
    }

    #[test]
    fn round_trip_through_the_multiplexer() {
        let multiplexer = Multiplexer::new();
        let post_office = Arc::new(PostOffice::new());
        let mut server = DirectServer::start(
            multiplexer.clone(),
            reference("macro"),
            post_office.clone(),
        );

        let location = server.location();
        assert!(multiplexer.can_connect_to(&location));

        post_office.deposit(&reference("micro[0].in"), vec![1, 2, 3]);
        let mut client =
            DirectClient::connect(multiplexer.clone(), &location).unwrap();
        assert_eq!(
            client.get_message(&reference("micro[0].in")).unwrap(),
            vec![1, 2, 3]
        );

        server.stop();
        assert!(DirectClient::connect(multiplexer, &location).is_err());
    }

    #[test]
    fn foreign_addresses_are_not_connectable() {
        let ours = Multiplexer::new();
        let theirs = Multiplexer::new();
        let address = theirs.address_for(&reference("macro"));
        assert!(!ours.can_connect_to(&address));
        assert!(!ours.can_connect_to("tcp:127.0.0.1:9000"));
        assert!(theirs.can_connect_to(&address));
    }
}
