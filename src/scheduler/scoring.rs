use serde::{Deserialize, Serialize};

use crate::hypervisor::NodeSnapshot;

// Weights in percent; they sum to 100 so an idle node scores exactly 100.
const MEMORY_WEIGHT: f64 = 40.0;
const CPU_WEIGHT: f64 = 30.0;
const IOWAIT_WEIGHT: f64 = 20.0;
const LOAD_WEIGHT: f64 = 10.0;

/// The load term reaches zero at a load average of 2.0 per core.
const LOAD_PENALTY_PER_CORE: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScore {
    pub node: String,
    pub online: bool,
    pub score: f64,
}

/// Clamped percentage; missing or garbage readings count as fully used.
fn used_pct(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 100.0),
        _ => 100.0,
    }
}

pub fn memory_pct(node: &NodeSnapshot) -> Option<f64> {
    match (node.mem_used, node.mem_total) {
        (Some(used), Some(total)) if total > 0 => Some(used as f64 / total as f64 * 100.0),
        _ => None,
    }
}

pub fn effective_cores(node: &NodeSnapshot) -> f64 {
    node.cores.filter(|cores| *cores > 0).unwrap_or(1) as f64
}

fn load_term(node: &NodeSnapshot) -> f64 {
    match node.load_avg {
        Some(load) if load.is_finite() && load >= 0.0 => {
            (100.0 - LOAD_PENALTY_PER_CORE * (load / effective_cores(node))).max(0.0)
        }
        _ => 0.0,
    }
}

/// Availability of a node in [0, 100], higher is better. Offline nodes score 0.
pub fn score(node: &NodeSnapshot) -> f64 {
    if !node.online {
        return 0.0;
    }

    let weighted = MEMORY_WEIGHT * (100.0 - used_pct(memory_pct(node)))
        + CPU_WEIGHT * (100.0 - used_pct(node.cpu_pct))
        + IOWAIT_WEIGHT * (100.0 - used_pct(node.iowait_pct))
        + LOAD_WEIGHT * load_term(node);

    (weighted / 100.0).clamp(0.0, 100.0)
}

/// Scores for every node, best first. Offline nodes are listed with 0.
pub fn rank(nodes: &[NodeSnapshot]) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = nodes
        .iter()
        .map(|node| NodeScore {
            node: node.node.clone(),
            online: node.online,
            score: score(node),
        })
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn half_loaded_node() {
        let node = NodeSnapshot {
            node: "pve1".to_string(),
            online: true,
            mem_used: Some(8 * GIB),
            mem_total: Some(16 * GIB),
            cpu_pct: Some(50.0),
            iowait_pct: Some(50.0),
            load_avg: Some(4.0),
            cores: Some(8),
        };
        // 0.4*50 + 0.3*50 + 0.2*50 + 0.1*75
        assert!((score(&node) - 52.5).abs() < 1e-9);
    }

    #[test]
    fn missing_telemetry_is_worst_case() {
        let mut node = NodeSnapshot::offline("pve1");
        node.online = true;
        assert_eq!(score(&node), 0.0);

        node.cpu_pct = Some(f64::NAN);
        node.iowait_pct = Some(250.0);
        assert_eq!(score(&node), 0.0);
    }

    #[test]
    fn overloaded_node_load_term_floors_at_zero() {
        let mut node = NodeSnapshot::idle("pve1", 2, 16 * GIB);
        node.load_avg = Some(40.0);
        assert!((score(&node) - 90.0).abs() < 1e-9);

        node.cores = Some(0);
        node.load_avg = Some(1.0);
        assert!((score(&node) - 95.0).abs() < 1e-9);
    }

    #[test]
    fn rank_puts_best_node_first() {
        let mut busy = NodeSnapshot::idle("busy", 4, 16 * GIB);
        busy.cpu_pct = Some(90.0);
        let idle = NodeSnapshot::idle("idle", 4, 16 * GIB);
        let ranked = rank(&[busy, NodeSnapshot::offline("down"), idle]);
        let names: Vec<&str> = ranked.iter().map(|s| s.node.as_str()).collect();
        assert_eq!(names, ["idle", "busy", "down"]);
    }
}
