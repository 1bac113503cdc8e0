//! In-process launcher for coupled instances.
//!
//! Small simulations and tests run every instance as a thread of one
//! process. The launcher owns the multiplexer that routes messages
//! between them and hands each instance a pre-wired options handle, so
//! instance code stays identical to what would run in separate
//! processes.

use std::thread;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::instance::InstanceOptions;
use crate::transport::Multiplexer;

/// The body of one instance: receives its pre-wired options and runs
/// its reuse loop to completion.
pub type InstanceBody = Box<dyn FnOnce(InstanceOptions) -> Result<()> + Send>;

/// Runs a set of instances to completion, one thread each.
///
/// Every body gets options carrying the manager location and a handle to
/// a shared multiplexer, so messages between the instances never touch a
/// socket. Returns the first failure if any instance failed or panicked.
pub fn run_instances(
    manager_location: &str,
    instances: Vec<(String, InstanceBody)>,
) -> Result<()> {
    let multiplexer = Multiplexer::new();
    info!("launching {} instances", instances.len());

    let mut handles = Vec::with_capacity(instances.len());
    for (name, body) in instances {
        let options = InstanceOptions {
            manager_location: Some(manager_location.to_string()),
            multiplexer: Some(multiplexer.clone()),
            ..InstanceOptions::default()
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(options))?;
        handles.push((name, handle));
    }

    let mut failure = None;
    for (name, handle) in handles {
        match handle.join() {
            Ok(Ok(())) => debug!("instance {} finished", name),
            Ok(Err(e)) => {
                failure.get_or_insert(Error::InstanceFailure {
                    instance: name,
                    cause: e.to_string(),
                });
            }
            Err(_) => {
                failure.get_or_insert(Error::InstanceFailure {
                    instance: name,
                    cause: "instance thread panicked".to_string(),
                });
            }
        }
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
