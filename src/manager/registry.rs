//! The manager's instance registry.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::mmp::PortDescription;
use crate::reference::Reference;

/// Where each running instance can be reached and which ports it
/// declared. Entries appear on register and disappear on deregister;
/// the set of names ever seen is kept so the manager can tell when a
/// run has completed.
#[derive(Default)]
pub struct InstanceRegistry {
    locations: HashMap<Reference, Vec<String>>,
    ports: HashMap<Reference, Vec<PortDescription>>,
    ever_registered: HashSet<Reference>,
}

impl InstanceRegistry {
    pub fn new() -> InstanceRegistry {
        InstanceRegistry::default()
    }

    /// Adds an instance. Registering a name twice is an error.
    pub fn add(
        &mut self,
        name: Reference,
        locations: Vec<String>,
        ports: Vec<PortDescription>,
    ) -> Result<()> {
        if self.locations.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        self.ever_registered.insert(name.clone());
        self.ports.insert(name.clone(), ports);
        self.locations.insert(name, locations);
        Ok(())
    }

    pub fn contains(&self, name: &Reference) -> bool {
        self.locations.contains_key(name)
    }

    pub fn locations(&self, name: &Reference) -> Option<&Vec<String>> {
        self.locations.get(name)
    }

    pub fn ports(&self, name: &Reference) -> Option<&Vec<PortDescription>> {
        self.ports.get(name)
    }

    /// Removes an instance. Removing an unknown name is a no-op.
    pub fn remove(&mut self, name: &Reference) {
        self.locations.remove(name);
        self.ports.remove(name);
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn ever_registered(&self) -> &HashSet<Reference> {
        &self.ever_registered
    }
}
