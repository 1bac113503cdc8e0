//! An acyclic run through a duplication mapper: one sender with two
//! output ports, two receivers, everything wired through the in-process
//! launcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rusty_muscle::manager::{Logger, Manager};
use rusty_muscle::mmp::MMPServer;
use rusty_muscle::model::{ComputeElementDecl, Model, SimulationPlan};
use rusty_muscle::runner::{run_instances, InstanceBody};
use rusty_muscle::settings::Configuration;
use rusty_muscle::{Conduit, Instance, Message, Operator, Payload, Reference};

fn duplication_plan() -> SimulationPlan {
    let mut compute_elements = BTreeMap::new();
    for name in ["dm", "first", "second"] {
        compute_elements.insert(
            Reference::new(name).unwrap(),
            ComputeElementDecl {
                implementation: format!("{}_implementation", name),
                multiplicity: vec![],
            },
        );
    }
    SimulationPlan {
        model: Model {
            name: Reference::new("test_model").unwrap(),
            compute_elements,
            conduits: vec![
                Conduit::new("dm.out1", "first.in").unwrap(),
                Conduit::new("dm.out2", "second.in").unwrap(),
            ],
        },
        settings: Configuration::new(),
    }
}

/// The mapper declares no ports; they are inferred from the conduits.
fn duplication_mapper(log_dir: std::path::PathBuf) -> InstanceBody {
    Box::new(move |mut options| {
        options.log_file = Some(log_dir);
        let mut instance = Instance::new("dm", None, options)?;
        while instance.reuse_instance()? {
            let out_ports = instance
                .list_ports()
                .remove(&Operator::OF)
                .unwrap_or_default();
            assert_eq!(out_ports.len(), 2);
            for port in out_ports {
                instance.send_message(
                    &port,
                    Message::new(0.0, None, Payload::from("testing")),
                    None,
                )?;
            }
        }
        Ok(())
    })
}

fn receiver(
    name: &'static str,
    log_dir: std::path::PathBuf,
    iterations: Arc<AtomicUsize>,
) -> InstanceBody {
    Box::new(move |mut options| {
        options.log_file = Some(log_dir);
        let mut ports = HashMap::new();
        ports.insert(Operator::FInit, vec!["in".to_string()]);
        let mut instance = Instance::new(name, Some(ports), options)?;
        while instance.reuse_instance()? {
            let message = instance.receive_message("in", None, None)?;
            assert_eq!(message.data, Payload::from("testing"));
            assert_eq!(message.configuration, None);
            iterations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    })
}

#[test]
fn duplication_mapper_feeds_both_receivers_once() {
    let log_dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(
        Manager::new(&duplication_plan(), Logger::to_writer(Box::new(std::io::sink())))
            .unwrap(),
    );
    let mut server = MMPServer::start(manager.clone(), "127.0.0.1:0").unwrap();

    let first_iterations = Arc::new(AtomicUsize::new(0));
    let second_iterations = Arc::new(AtomicUsize::new(0));

    run_instances(
        &server.location(),
        vec![
            (
                "dm".to_string(),
                duplication_mapper(log_dir.path().to_path_buf()),
            ),
            (
                "first".to_string(),
                receiver("first", log_dir.path().to_path_buf(), first_iterations.clone()),
            ),
            (
                "second".to_string(),
                receiver(
                    "second",
                    log_dir.path().to_path_buf(),
                    second_iterations.clone(),
                ),
            ),
        ],
    )
    .unwrap();

    // Each receiver saw exactly one message and then a closed port.
    assert_eq!(first_iterations.load(Ordering::SeqCst), 1);
    assert_eq!(second_iterations.load(Ordering::SeqCst), 1);
    assert!(manager.is_done());

    server.stop();
}
