//! End-to-end admission scenarios driven through the public controller API.

use std::sync::Arc;

use admissoor::admission::{
    AdmissionController, AdmissionStatus, ClientDescriptor, FlowDescriptor, QueueDescriptor,
};
use admissoor::calculus::SncAlgorithm;
use admissoor::enforcer::{EnforcerEvent, RecordingEnforcer};
use admissoor::snc::arrival::MmbpArrival;
use admissoor::snc::operators::{BoundArena, LatencyBound};
use admissoor::trace::{ProcessedTrace, TraceReader, WorkEstimator};

/// Host uplink/downlink bandwidth in bytes per second (1 Gbps).
const LINK_BANDWIDTH: f64 = 1.25e8;

/// Byte-for-byte estimator for server-to-tenant traffic.
fn byte_estimator() -> WorkEstimator {
    WorkEstimator::NetworkOut {
        non_data_constant: 0.0,
        non_data_factor: 0.0,
        data_constant: 0.0,
        data_factor: 1.0,
    }
}

/// Fit an arrival model from a constant-rate trace of 1500-byte gets.
fn fitted_arrival(requests_per_sec: u64, seconds: u64) -> MmbpArrival {
    let mut text = String::new();
    for second in 0..seconds {
        for i in 0..requests_per_sec {
            let ns = second * 1_000_000_000 + i * (1_000_000_000 / requests_per_sec);
            text.push_str(&format!("{ns},5dc,Get\n"));
        }
    }
    let mut trace = ProcessedTrace::new(TraceReader::from_text(&text), byte_estimator());
    MmbpArrival::from_trace(&mut trace)
}

fn arrival_info(requests_per_sec: u64) -> serde_json::Value {
    serde_json::to_value(fitted_arrival(requests_per_sec, 3)).unwrap()
}

fn queue(name: &str, bandwidth: f64) -> QueueDescriptor {
    QueueDescriptor {
        name: Some(name.to_string()),
        bandwidth: Some(bandwidth),
    }
}

fn flow(name: &str, queues: &[&str], requests_per_sec: u64) -> FlowDescriptor {
    FlowDescriptor {
        name: Some(name.to_string()),
        queues: Some(queues.iter().map(|q| q.to_string()).collect()),
        arrival_info: Some(arrival_info(requests_per_sec)),
        priority: None,
        enforcer_addr: None,
        dst_addr: None,
        src_addr: None,
    }
}

fn client(name: &str, slo: f64, flows: Vec<FlowDescriptor>) -> ClientDescriptor {
    ClientDescriptor {
        name: Some(name.to_string()),
        slo: Some(slo),
        slo_percentile: Some(99.9),
        flows: Some(flows),
        dependencies: None,
    }
}

fn controller(algorithm: SncAlgorithm) -> (AdmissionController, Arc<RecordingEnforcer>) {
    let enforcer = Arc::new(RecordingEnforcer::default());
    (
        AdmissionController::new(algorithm, Box::new(enforcer.clone())),
        enforcer,
    )
}

fn flow_priority(ctrl: &AdmissionController, name: &str) -> u32 {
    let id = ctrl.registry().flow_id_by_name(name).unwrap();
    ctrl.registry().flow(id).unwrap().priority
}

fn flow_latency(ctrl: &AdmissionController, name: &str) -> f64 {
    let id = ctrl.registry().flow_id_by_name(name).unwrap();
    ctrl.registry().flow(id).unwrap().latency
}

#[test]
fn test_single_tenant_single_hop_is_admitted() {
    let (mut ctrl, enforcer) = controller(SncAlgorithm::Aggregate);
    assert_eq!(ctrl.add_queue(&queue("q", LINK_BANDWIDTH)), AdmissionStatus::Success);

    let mut f = flow("f", &["q"], 1000);
    f.enforcer_addr = Some("host0".to_string());
    f.dst_addr = Some("10.0.0.2".to_string());
    f.src_addr = Some("10.0.0.1".to_string());

    let outcome = ctrl.add_clients(&[client("tenant", 0.01, vec![f])]);
    assert_eq!(outcome.status, AdmissionStatus::Success);
    assert!(outcome.admitted);

    assert_eq!(flow_priority(&ctrl, "f"), 0);
    let latency = flow_latency(&ctrl, "f");
    assert!(latency.is_finite());
    assert!(latency > 0.0);
    assert!(latency <= 0.01);

    let events = enforcer.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], EnforcerEvent::Update { priority: 0, .. }));
}

#[test]
fn test_two_tenants_shared_hop_priorities_by_slo() {
    let (mut ctrl, _) = controller(SncAlgorithm::Aggregate);
    ctrl.add_queue(&queue("q", LINK_BANDWIDTH));

    let outcome = ctrl.add_clients(&[
        client("a", 0.005, vec![flow("fa", &["q"], 1000)]),
        client("b", 0.020, vec![flow("fb", &["q"], 1000)]),
    ]);
    assert!(outcome.admitted);

    assert_eq!(flow_priority(&ctrl, "fa"), 0);
    assert_eq!(flow_priority(&ctrl, "fb"), 1);
    assert!(flow_latency(&ctrl, "fa") <= 0.005);
    assert!(flow_latency(&ctrl, "fb") <= 0.020);
}

#[test]
fn test_infeasible_overload_rejected_and_registry_unchanged() {
    let (mut ctrl, enforcer) = controller(SncAlgorithm::Aggregate);
    ctrl.add_queue(&queue("q", LINK_BANDWIDTH));

    // Ten tenants of 10k requests/s of 1500 bytes each want 1.5e8 B/s
    // against a 1.25e8 B/s link.
    let batch: Vec<ClientDescriptor> = (0..10)
        .map(|i| {
            client(
                &format!("tenant{i}"),
                0.001,
                vec![flow(&format!("flow{i}"), &["q"], 10_000)],
            )
        })
        .collect();

    let outcome = ctrl.add_clients(&batch);
    assert_eq!(outcome.status, AdmissionStatus::Success);
    assert!(!outcome.admitted);

    for i in 0..10 {
        assert_eq!(ctrl.registry().client_id_by_name(&format!("tenant{i}")), None);
        assert_eq!(ctrl.registry().flow_id_by_name(&format!("flow{i}")), None);
    }
    assert!(ctrl.registry().queue_id_by_name("q").is_some());
    assert!(enforcer.events().is_empty());
}

#[test]
fn test_two_hop_aggregate_matches_manual_operator_dag() {
    let (mut ctrl, _) = controller(SncAlgorithm::Aggregate);
    ctrl.add_queue(&queue("up_a", LINK_BANDWIDTH));
    ctrl.add_queue(&queue("up_b", LINK_BANDWIDTH));
    ctrl.add_queue(&queue("down", LINK_BANDWIDTH));

    let outcome = ctrl.add_clients(&[
        client("a", 0.01, vec![flow("fa", &["up_a", "down"], 1000)]),
        client("b", 0.01, vec![flow("fb", &["up_b", "down"], 1000)]),
    ]);
    assert!(outcome.admitted);

    let registry = ctrl.registry();
    let fa = registry.flow(registry.flow_id_by_name("fa").unwrap()).unwrap();
    let fb = registry.flow(registry.flow_id_by_name("fb").unwrap()).unwrap();

    // Manual DAG for fa: the rival's output bound enters the shared
    // downlink, whose leftover convolves with fa's own uplink.
    let mut arena = BoundArena::new();
    let own_uplink = arena.constant_service(LINK_BANDWIDTH);
    let rival = arena.mmbp(&fb.arrival);
    let rival_uplink = arena.constant_service(LINK_BANDWIDTH);
    let rival_out = arena.output_arrival(rival, rival_uplink);
    let down_base = arena.constant_service(LINK_BANDWIDTH);
    let down_service = arena.leftover_service(rival_out, down_base);
    let tandem = arena.convolution_service(own_uplink, down_service);
    let own = arena.mmbp(&fa.arrival);
    let manual = LatencyBound::new(&mut arena, own, tandem, fa.epsilon).calc_latency();

    let via_controller = flow_latency(&ctrl, "fa");
    assert!(via_controller.is_finite());
    assert!((via_controller - manual).abs() < 1e-9);
}

#[test]
fn test_dependent_clients_engage_hoelder_and_loosen_bound() {
    let build = |with_dependency: bool| {
        let (mut ctrl, _) = controller(SncAlgorithm::Aggregate);
        ctrl.add_queue(&queue("up_a", LINK_BANDWIDTH));
        ctrl.add_queue(&queue("up_b", LINK_BANDWIDTH));
        ctrl.add_queue(&queue("down", LINK_BANDWIDTH));

        let mut b = client("b", 0.01, vec![flow("fb", &["up_b", "down"], 1000)]);
        if with_dependency {
            b.dependencies = Some(vec!["a".to_string()]);
        }
        let outcome = ctrl.add_clients(&[
            client("a", 0.01, vec![flow("fa", &["up_a", "down"], 1000)]),
            b,
        ]);
        assert!(outcome.admitted);
        ctrl
    };

    let independent = build(false);
    let dependent = build(true);

    // The declared dependency is symmetric and visible in the arrivals.
    let registry = dependent.registry();
    let fa = registry.flow(registry.flow_id_by_name("fa").unwrap()).unwrap();
    let fb = registry.flow(registry.flow_id_by_name("fb").unwrap()).unwrap();
    assert!(fa.arrival.dependencies().contains(fb.id));
    assert!(fb.arrival.dependencies().contains(fa.id));

    // A bound over the dependent pair registers Hoelder sub-bounds.
    let mut arena = BoundArena::new();
    let arr_b = arena.mmbp(&fb.arrival);
    let service = arena.constant_service(LINK_BANDWIDTH);
    let rival = arena.mmbp(&fa.arrival);
    let leftover = arena.leftover_service(rival, service);
    let bound = LatencyBound::new(&mut arena, arr_b, leftover, fb.epsilon);
    assert!(bound.dependent_count() > 0);

    // Hoelder-parameterized bounds can only be looser than the independent
    // analysis of the same topology.
    let without = flow_latency(&independent, "fb");
    let with = flow_latency(&dependent, "fb");
    assert!(without.is_finite() && with.is_finite());
    assert!(with >= without - 1e-12);
}

#[test]
fn test_delete_and_readmit_with_stricter_slo_wins_priority() {
    let (mut ctrl, _) = controller(SncAlgorithm::Aggregate);
    ctrl.add_queue(&queue("q", LINK_BANDWIDTH));

    assert!(ctrl
        .add_clients(&[client("a", 0.020, vec![flow("fa", &["q"], 1000)])])
        .admitted);
    assert!(ctrl
        .add_clients(&[client("b", 0.010, vec![flow("fb", &["q"], 1000)])])
        .admitted);
    assert_eq!(flow_priority(&ctrl, "fb"), 0);
    assert_eq!(flow_priority(&ctrl, "fa"), 1);

    assert_eq!(ctrl.del_client("a"), AdmissionStatus::Success);
    assert!(ctrl
        .add_clients(&[client("a", 0.005, vec![flow("fa", &["q"], 1000)])])
        .admitted);

    assert!(flow_priority(&ctrl, "fa") < flow_priority(&ctrl, "fb"));
    assert_eq!(flow_priority(&ctrl, "fa"), 0);
}

#[test]
fn test_hop_by_hop_and_convolution_admit_tandem_tenants() {
    for algorithm in [SncAlgorithm::HopByHop, SncAlgorithm::Convolution] {
        let (mut ctrl, _) = controller(algorithm);
        ctrl.add_queue(&queue("up", LINK_BANDWIDTH));
        ctrl.add_queue(&queue("down", LINK_BANDWIDTH));

        let outcome = ctrl.add_clients(&[
            client("a", 0.01, vec![flow("fa", &["up", "down"], 1000)]),
            client("b", 0.02, vec![flow("fb", &["up", "down"], 1000)]),
        ]);
        assert!(outcome.admitted, "{algorithm:?} rejected a feasible pair");
        for name in ["fa", "fb"] {
            let latency = flow_latency(&ctrl, name);
            assert!(latency.is_finite() && latency > 0.0, "{algorithm:?} {name}");
        }
    }
}

#[test]
fn test_incumbent_violation_rejects_new_tenant() {
    let (mut ctrl, _) = controller(SncAlgorithm::Aggregate);
    ctrl.add_queue(&queue("q", LINK_BANDWIDTH));

    // The incumbent uses most of the link on its own: 8e4 req/s of 1500
    // bytes is 1.2e8 B/s against 1.25e8 B/s.
    assert!(ctrl
        .add_clients(&[client("incumbent", 0.005, vec![flow("fi", &["q"], 80_000)])])
        .admitted);
    let incumbent_latency = flow_latency(&ctrl, "fi");
    assert!(incumbent_latency <= 0.005);

    // The newcomer is light and easily meets its own tighter SLO, but at
    // higher priority it starves the incumbent outright; the batch must be
    // rejected and the incumbent kept intact.
    let outcome = ctrl.add_clients(&[client(
        "newcomer",
        0.002,
        vec![flow("fn", &["q"], 20_000)],
    )]);
    assert_eq!(outcome.status, AdmissionStatus::Success);
    assert!(!outcome.admitted);

    assert_eq!(ctrl.registry().client_id_by_name("newcomer"), None);
    assert!(ctrl.registry().client_id_by_name("incumbent").is_some());
    assert_eq!(flow_latency(&ctrl, "fi"), incumbent_latency);
    assert_eq!(flow_priority(&ctrl, "fi"), 0);
}
