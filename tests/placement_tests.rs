// Placement tests: scoring bounds and how batches spread over nodes.

use fleet_vm_manager::hypervisor::NodeSnapshot;
use fleet_vm_manager::scheduler::{place, score, PlacementEstimate};
use rand::Rng;

const GIB: u64 = 1024 * 1024 * 1024;

#[test]
fn test_idle_node_scores_full_and_offline_scores_zero() {
    let idle = NodeSnapshot::idle("pve1", 8, 32 * GIB);
    assert!((score(&idle) - 100.0).abs() < 1e-9);

    let mut down = idle.clone();
    down.online = false;
    assert_eq!(score(&down), 0.0);
}

#[test]
fn test_single_node_takes_every_vm() {
    let nodes = vec![NodeSnapshot::idle("pve1", 8, 32 * GIB)];
    let assignments = place(&nodes, 5, &PlacementEstimate::default());
    assert_eq!(assignments, vec!["pve1"; 5]);
}

#[test]
fn test_identical_nodes_alternate() {
    let nodes = vec![
        NodeSnapshot::idle("pve1", 8, 16 * GIB),
        NodeSnapshot::idle("pve2", 8, 16 * GIB),
    ];
    let assignments = place(&nodes, 4, &PlacementEstimate::default());
    assert_eq!(assignments, ["pve1", "pve2", "pve1", "pve2"]);
}

#[test]
fn test_busy_node_gets_fewer_vms() {
    let mut busy = NodeSnapshot::idle("busy", 8, 32 * GIB);
    busy.cpu_pct = Some(80.0);
    busy.mem_used = Some(24 * GIB);
    let nodes = vec![busy, NodeSnapshot::idle("free", 8, 32 * GIB)];

    let assignments = place(&nodes, 6, &PlacementEstimate::default());
    let on_free = assignments.iter().filter(|n| *n == "free").count();
    assert!(on_free > 3, "expected most VMs on the free node, got {:?}", assignments);
}

#[test]
fn test_no_online_nodes_places_nothing() {
    let nodes = vec![NodeSnapshot::offline("pve1"), NodeSnapshot::offline("pve2")];
    assert!(place(&nodes, 3, &PlacementEstimate::default()).is_empty());
}

// Random telemetry, including garbage readings, never leaves [0, 100].
#[test]
fn test_score_bounds_with_random_telemetry() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let total = rng.gen_range(1..256) * GIB;
        let node = NodeSnapshot {
            node: "n".to_string(),
            online: rng.gen_bool(0.9),
            mem_used: rng.gen_bool(0.9).then(|| rng.gen_range(0..total * 2)),
            mem_total: rng.gen_bool(0.9).then_some(total),
            cpu_pct: rng.gen_bool(0.9).then(|| rng.gen_range(-50.0..250.0)),
            iowait_pct: rng.gen_bool(0.9).then(|| rng.gen_range(-50.0..250.0)),
            load_avg: rng.gen_bool(0.9).then(|| rng.gen_range(-1.0..200.0)),
            cores: rng.gen_bool(0.9).then(|| rng.gen_range(0..128)),
        };
        let s = score(&node);
        assert!((0.0..=100.0).contains(&s), "score {} out of range for {:?}", s, node);
    }
}
