//! Peer resolution against the manager, at the dispatch level and over
//! a real connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rusty_muscle::manager::{elements_for_model, Logger, Manager};
use rusty_muscle::mmp::{
    MMPClient, MMPServer, PeerDimensions, PeerLocations, PortDescription, Request,
    Response, ResultStatus,
};
use rusty_muscle::model::{ComputeElementDecl, Model, SimulationPlan};
use rusty_muscle::settings::Configuration;
use rusty_muscle::{Conduit, Operator, Reference};

fn reference(text: &str) -> Reference {
    Reference::new(text).unwrap()
}

/// A scalar macro model coupled to micro instances of the given
/// multiplicity, both ways.
fn macro_micro_plan(multiplicity: Vec<usize>) -> SimulationPlan {
    let mut compute_elements = BTreeMap::new();
    compute_elements.insert(
        reference("macro"),
        ComputeElementDecl {
            implementation: "macro_implementation".to_string(),
            multiplicity: vec![],
        },
    );
    compute_elements.insert(
        reference("micro"),
        ComputeElementDecl {
            implementation: "micro_implementation".to_string(),
            multiplicity,
        },
    );
    SimulationPlan {
        model: Model {
            name: reference("test_model"),
            compute_elements,
            conduits: vec![
                Conduit::new("macro.out", "micro.in").unwrap(),
                Conduit::new("micro.out", "macro.in").unwrap(),
            ],
        },
        settings: Configuration::new(),
    }
}

fn quiet_manager(plan: &SimulationPlan) -> Manager {
    Manager::new(plan, Logger::to_writer(Box::new(std::io::sink()))).unwrap()
}

fn ports() -> Vec<PortDescription> {
    vec![
        PortDescription { name: "in".to_string(), operator: Operator::FInit },
        PortDescription { name: "out".to_string(), operator: Operator::OF },
    ]
}

fn register(manager: &Manager, name: &str) {
    let response = manager.handle(Request::RegisterInstance {
        instance_name: reference(name),
        locations: vec![format!("direct:{}", name)],
        ports: ports(),
    });
    assert!(
        matches!(
            response,
            Response::Register { status: ResultStatus::Success, .. }
        ),
        "registration of {} failed: {:?}",
        name,
        response
    );
}

fn fully_registered_manager() -> Manager {
    let plan = macro_micro_plan(vec![10, 10]);
    let manager = quiet_manager(&plan);
    register(&manager, "macro");
    for i in 0..10 {
        for j in 0..10 {
            register(&manager, &format!("micro[{}][{}]", i, j));
        }
    }
    manager
}

#[test]
fn request_peers_fans_out_over_all_micro_instances() {
    let manager = fully_registered_manager();

    let response =
        manager.handle(Request::RequestPeers { instance_name: reference("macro") });
    let Response::Peers { status, conduits, peer_dimensions, peer_locations, .. } =
        response
    else {
        panic!("unexpected response kind");
    };

    assert_eq!(status, ResultStatus::Success);
    assert_eq!(conduits[0], Conduit::new("macro.out", "micro.in").unwrap());
    assert_eq!(conduits[1], Conduit::new("micro.out", "macro.in").unwrap());
    assert_eq!(
        peer_dimensions,
        vec![PeerDimensions {
            peer_name: reference("micro"),
            dimensions: vec![10, 10],
        }]
    );

    assert_eq!(peer_locations.len(), 100);
    for (i, locations) in peer_locations.iter().enumerate() {
        let instance = format!("micro[{}][{}]", i / 10, i % 10);
        assert_eq!(
            locations,
            &PeerLocations {
                instance_name: reference(&instance),
                locations: vec![format!("direct:{}", instance)],
            }
        );
    }
}

#[test]
fn request_peers_fans_in_to_the_single_macro() {
    let manager = fully_registered_manager();

    let response = manager
        .handle(Request::RequestPeers { instance_name: reference("micro[4][3]") });
    let Response::Peers { status, conduits, peer_dimensions, peer_locations, .. } =
        response
    else {
        panic!("unexpected response kind");
    };

    assert_eq!(status, ResultStatus::Success);
    assert_eq!(conduits[0], Conduit::new("macro.out", "micro.in").unwrap());
    assert_eq!(conduits[1], Conduit::new("micro.out", "macro.in").unwrap());
    assert_eq!(
        peer_dimensions,
        vec![PeerDimensions { peer_name: reference("macro"), dimensions: vec![] }]
    );
    assert_eq!(
        peer_locations,
        vec![PeerLocations {
            instance_name: reference("macro"),
            locations: vec!["direct:macro".to_string()],
        }]
    );
}

#[test]
fn request_peers_is_pending_before_registration() {
    let manager = quiet_manager(&macro_micro_plan(vec![10, 10]));
    let response = manager
        .handle(Request::RequestPeers { instance_name: reference("micro[0][0]") });
    assert!(matches!(
        response,
        Response::Peers { status: ResultStatus::Pending, .. }
    ));
}

#[test]
fn request_peers_for_an_unknown_name_is_an_error() {
    let manager = quiet_manager(&macro_micro_plan(vec![10, 10]));
    let response = manager
        .handle(Request::RequestPeers { instance_name: reference("does_not_exist") });
    let Response::Peers { status, error_message, .. } = response else {
        panic!("unexpected response kind");
    };
    assert_eq!(status, ResultStatus::Error);
    assert!(error_message.unwrap().contains("does_not_exist"));
}

#[test]
fn double_registration_is_rejected_with_the_name() {
    let manager = quiet_manager(&macro_micro_plan(vec![10, 10]));
    register(&manager, "macro");

    let response = manager.handle(Request::RegisterInstance {
        instance_name: reference("macro"),
        locations: vec!["direct:macro".to_string()],
        ports: ports(),
    });
    let Response::Register { status, error_message } = response else {
        panic!("unexpected response kind");
    };
    assert_eq!(status, ResultStatus::Error);
    assert!(error_message.unwrap().contains("macro"));
}

#[test]
fn registration_rejects_ports_that_contradict_the_topology() {
    let manager = quiet_manager(&macro_micro_plan(vec![10, 10]));

    // 'in' is on the receiving end of micro.out -> macro.in, but O_F
    // cannot receive.
    let response = manager.handle(Request::RegisterInstance {
        instance_name: reference("macro"),
        locations: vec!["direct:macro".to_string()],
        ports: vec![
            PortDescription { name: "in".to_string(), operator: Operator::OF },
            PortDescription { name: "out".to_string(), operator: Operator::OF },
        ],
    });
    let Response::Register { status, error_message } = response else {
        panic!("unexpected response kind");
    };
    assert_eq!(status, ResultStatus::Error);
    assert!(error_message.unwrap().contains("'in'"));

    // The rejected registration left no entry behind, so a corrected
    // one goes through.
    register(&manager, "macro");
}

#[test]
fn registration_rejects_a_missing_declared_port() {
    let manager = quiet_manager(&macro_micro_plan(vec![10, 10]));

    let response = manager.handle(Request::RegisterInstance {
        instance_name: reference("micro[0][0]"),
        locations: vec!["direct:micro[0][0]".to_string()],
        ports: vec![PortDescription {
            name: "out".to_string(),
            operator: Operator::OF,
        }],
    });
    let Response::Register { status, error_message } = response else {
        panic!("unexpected response kind");
    };
    assert_eq!(status, ResultStatus::Error);
    let message = error_message.unwrap();
    assert!(message.contains("'in'") && message.contains("does not declare"));
}

#[test]
fn elements_for_model_covers_the_index_space() {
    let plan = macro_micro_plan(vec![10, 10]);
    let names = elements_for_model(&plan.model);
    assert_eq!(names.len(), 101);
    assert!(names.contains(&reference("macro")));
    assert!(names.contains(&reference("micro[0][0]")));
    assert!(names.contains(&reference("micro[9][9]")));
}

/// Over a real connection: a client polling for peers is released once
/// the last peer registers, and a completed run leaves the manager done.
#[test]
fn client_backoff_is_released_by_late_registration() {
    let plan = macro_micro_plan(vec![2]);
    let manager = Arc::new(quiet_manager(&plan));
    let mut server = MMPServer::start(manager.clone(), "127.0.0.1:0").unwrap();
    let location = server.location();

    let mut client = MMPClient::connect(&location).unwrap();
    client
        .register_instance(&reference("macro"), vec!["direct:macro".to_string()], ports())
        .unwrap();

    let late = {
        let location = location.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let mut client = MMPClient::connect(&location).unwrap();
            for name in ["micro[0]", "micro[1]"] {
                client
                    .register_instance(
                        &reference(name),
                        vec![format!("direct:{}", name)],
                        ports(),
                    )
                    .unwrap();
            }
        })
    };

    let start = Instant::now();
    let (conduits, peer_dims, peer_locations) =
        client.request_peers(&reference("macro")).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert_eq!(conduits.len(), 2);
    assert_eq!(peer_dims[&reference("micro")], vec![2]);
    assert_eq!(peer_locations[&reference("micro[1]")], vec!["direct:micro[1]".to_string()]);
    late.join().unwrap();

    assert_eq!(client.get_configuration().unwrap(), Configuration::new());

    assert!(!manager.is_done());
    for name in ["macro", "micro[0]", "micro[1]"] {
        client.deregister_instance(&reference(name)).unwrap();
    }
    assert!(manager.is_done());

    client.close();
    server.stop();
}
