use serde::{Deserialize, Serialize};
use tracing::debug;

use super::scoring::{effective_cores, score};
use crate::config::PlacementSettings;
use crate::hypervisor::{NodeSnapshot, VmConfig};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Resources one new VM is expected to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementEstimate {
    pub memory_mb: u64,
    pub cores: u32,
}

impl Default for PlacementEstimate {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cores: 1,
        }
    }
}

impl From<&PlacementSettings> for PlacementEstimate {
    fn from(settings: &PlacementSettings) -> Self {
        Self {
            memory_mb: settings.default_memory_mb,
            cores: settings.default_cores,
        }
    }
}

impl PlacementEstimate {
    /// Memory and cores of a template config, falling back field by field.
    pub fn from_config(config: &VmConfig, fallback: PlacementEstimate) -> Self {
        Self {
            memory_mb: config
                .memory_mb
                .filter(|mb| *mb > 0)
                .unwrap_or(fallback.memory_mb),
            cores: config.cores.filter(|c| *c > 0).unwrap_or(fallback.cores),
        }
    }
}

/// Books one VM onto the simulated node. Unknown readings stay unknown so
/// they keep scoring as worst case.
fn consume(node: &mut NodeSnapshot, estimate: &PlacementEstimate) {
    let cores = effective_cores(node);
    if let Some(used) = node.mem_used.as_mut() {
        *used = used.saturating_add(estimate.memory_mb.saturating_mul(BYTES_PER_MB));
    }
    if let Some(cpu) = node.cpu_pct.as_mut() {
        *cpu += estimate.cores as f64 / cores * 100.0;
    }
    if let Some(load) = node.load_avg.as_mut() {
        *load += 1.0;
    }
}

/// Assigns `count` VMs to online nodes, re-scoring the simulated cluster after
/// every assignment. Returns an empty list when no node is online.
pub fn place(nodes: &[NodeSnapshot], count: usize, estimate: &PlacementEstimate) -> Vec<String> {
    let mut simulated: Vec<NodeSnapshot> = nodes.iter().filter(|n| n.online).cloned().collect();
    if simulated.is_empty() {
        return Vec::new();
    }

    let mut assignments = Vec::with_capacity(count);
    for i in 0..count {
        let mut winner = 0;
        let mut best = f64::NEG_INFINITY;
        let mut all_zero = true;
        for (index, node) in simulated.iter().enumerate() {
            let s = score(node);
            if s != 0.0 {
                all_zero = false;
            }
            if s > best {
                best = s;
                winner = index;
            }
        }
        if all_zero {
            winner = i % simulated.len();
        }

        consume(&mut simulated[winner], estimate);
        assignments.push(simulated[winner].node.clone());
    }

    debug!(count, nodes = simulated.len(), "Placement computed");
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn estimate_falls_back_per_field() {
        let config = VmConfig {
            memory_mb: Some(4096),
            cores: None,
            ..VmConfig::default()
        };
        let estimate = PlacementEstimate::from_config(&config, PlacementEstimate::default());
        assert_eq!(estimate, PlacementEstimate { memory_mb: 4096, cores: 1 });
    }

    #[test]
    fn consume_moves_memory_cpu_and_load() {
        let mut node = NodeSnapshot::idle("pve1", 4, 16 * GIB);
        consume(&mut node, &PlacementEstimate { memory_mb: 2048, cores: 2 });
        assert_eq!(node.mem_used, Some(2 * GIB));
        assert_eq!(node.cpu_pct, Some(50.0));
        assert_eq!(node.load_avg, Some(1.0));
    }

    #[test]
    fn skips_offline_nodes() {
        let nodes = vec![
            NodeSnapshot::offline("down"),
            NodeSnapshot::idle("up", 4, 16 * GIB),
        ];
        assert_eq!(place(&nodes, 3, &PlacementEstimate::default()), ["up", "up", "up"]);
        let down = [NodeSnapshot::offline("down")];
        assert!(place(&down, 2, &PlacementEstimate::default()).is_empty());
    }

    #[test]
    fn zero_scores_fall_back_to_round_robin() {
        let mut a = NodeSnapshot::offline("a");
        a.online = true;
        let mut b = NodeSnapshot::offline("b");
        b.online = true;
        assert_eq!(place(&[a, b], 4, &PlacementEstimate::default()), ["a", "b", "a", "b"]);
    }
}
