//! Protocol round-trip tests — encode a network, push it through JSON, and
//! rebuild networks from progress messages.

use approx::assert_abs_diff_eq;
use formfind::objectives::Objective;
use formfind::protocol::{decode, encode, OptimizationRequest, OptimizationSettings, ProgressMessage};
use formfind::session::{apply_inbound, SessionSnapshot, SessionState};
use formfind::{FdmError, Network, Segment};

/// Four-bar net hanging between three anchors; node order by first sight:
/// 0 anchor, 1 free, 2 anchor, 3 free, 4 anchor.
fn net() -> Network {
    Network::build(
        vec![
            Segment::new([0.0, 0.0, 0.0], [1.0, 0.5, 0.0]),
            Segment::new([1.0, 0.5, 0.0], [2.0, 0.0, 0.0]),
            Segment::new([1.0, 0.5, 0.0], [1.0, 1.5, 0.0]),
            Segment::new([1.0, 1.5, 0.0], [1.0, 2.5, 0.0]),
        ],
        vec![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [1.0, 2.5, 0.0]],
        &[1.0, 2.0, 3.0, 4.0],
        0.01,
    )
    .unwrap()
}

fn settings() -> OptimizationSettings {
    OptimizationSettings {
        objectives: vec![
            Objective::Target { weight: 1.0 },
            Objective::MaxLength { weight: 0.5, value: 1.2 },
        ],
        ..Default::default()
    }
}

fn progress_json(finished: bool, iter: usize, q: &[f64], x: &[f64], y: &[f64], z: &[f64]) -> String {
    ProgressMessage {
        finished,
        iter,
        loss: 0.25,
        q: q.to_vec(),
        x: x.to_vec(),
        y: y.to_vec(),
        z: z.to_vec(),
        losstrace: vec![1.0, 0.5, 0.25],
    }
    .to_json()
    .unwrap()
}

#[test]
fn json_round_trip_preserves_counts_and_connectivity() {
    let network = net();
    let request = encode(&network, &settings(), &[[0.0, 0.0, -1.0]]).unwrap();
    let json = request.to_json().unwrap();
    let back = OptimizationRequest::from_json(&json).unwrap();

    assert_eq!(back, request);
    assert_eq!(back.ne, network.num_edges());
    assert_eq!(back.nn, network.num_nodes());
    assert_eq!(back.edge_indices().unwrap(), network.indices());
    assert_eq!(back.free_indices().unwrap(), network.free_indices());
    assert_eq!(back.fixed_indices().unwrap(), network.fixed_indices());
    assert_eq!(back.settings().unwrap(), settings());
}

#[test]
fn threshold_is_omitted_for_plain_objectives() {
    let request = encode(&net(), &settings(), &[[0.0; 3]]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
    let objectives = value["Objectives"].as_array().unwrap();
    assert_eq!(objectives[0]["id"], 0);
    assert!(objectives[0].get("value").is_none());
    assert_eq!(objectives[1]["id"], 5);
    assert_eq!(objectives[1]["value"], 1.2);
}

#[test]
fn request_rebuilds_the_linear_problem() {
    let network = net();
    let request = encode(&network, &settings(), &[[0.0; 3]]).unwrap();
    let problem = request.linear_problem().unwrap();
    assert_eq!(problem.edges, network.indices());
    assert_eq!(problem.free_node_indices, network.free_indices());
    assert_eq!(problem.force_densities, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(problem.fixed_positions.row(2).to_vec(), vec![1.0, 2.5, 0.0]);
}

#[test]
fn per_node_loads_follow_free_order() {
    let request = encode(&net(), &settings(), &[[0.0, 0.0, -1.0], [0.0, 0.0, -3.0]]).unwrap();
    assert_eq!(request.pz, vec![-1.0, -3.0]);
    assert!(matches!(
        encode(&net(), &settings(), &[[0.0; 3]; 3]),
        Err(FdmError::ArityMismatch { .. })
    ));
}

#[test]
fn streaming_then_idle_keeps_original_index_pairs() {
    let network = net();
    let mut snap = SessionSnapshot {
        state: SessionState::Streaming,
        network: Some(network.clone()),
        baseline: Some(network.clone()),
        ..SessionSnapshot::new()
    };

    let x = [0.0, 1.1, 2.0, 1.0, 1.0];
    let y = [0.0, 0.4, 0.0, 1.4, 2.5];
    let z = [0.0, -0.3, 0.0, -0.2, 0.0];

    snap = apply_inbound(&snap, &progress_json(false, 3, &[1.5, 2.5, 3.5, 4.5], &x, &y, &z));
    assert_eq!(snap.state, SessionState::Streaming);
    assert_eq!(snap.progress.as_ref().unwrap().iteration, 3);

    snap = apply_inbound(&snap, &progress_json(true, 9, &[2.0, 2.0, 2.0, 2.0], &x, &y, &z));
    assert_eq!(snap.state, SessionState::Idle);
    assert_eq!(snap.received, 2);

    let rebuilt = snap.network.unwrap();
    assert_eq!(rebuilt.indices(), network.indices());
    assert_eq!(rebuilt.free_indices(), network.free_indices());
    assert_eq!(rebuilt.force_densities(), vec![2.0; 4]);
    assert_abs_diff_eq!(rebuilt.nodes()[1].position[2], -0.3, epsilon = 1e-15);
    assert!(rebuilt.is_valid());
    // segments follow the new coordinates
    assert_eq!(rebuilt.segments()[0].end, [1.1, 0.4, -0.3]);
}

#[test]
fn mismatched_progress_is_dropped() {
    let network = net();
    let snap = SessionSnapshot {
        state: SessionState::Streaming,
        baseline: Some(network),
        ..SessionSnapshot::new()
    };
    // wrong number of force densities
    let next = apply_inbound(&snap, &progress_json(true, 1, &[1.0], &[0.0; 5], &[0.0; 5], &[0.0; 5]));
    assert_eq!(next.state, SessionState::Streaming);
    assert_eq!(next.dropped, 1);
    assert!(next.progress.is_none());
}

#[test]
fn decode_keeps_loss_history() {
    let progress = decode(&progress_json(false, 2, &[1.0], &[0.0], &[0.0], &[0.0])).unwrap();
    assert_eq!(progress.loss_history, vec![1.0, 0.5, 0.25]);
    assert!(!progress.finished);
}
