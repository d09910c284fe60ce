//! Node selection: score nodes from live telemetry, then spread a batch of VMs
//! across them without going back to the hypervisor between assignments.

pub mod placement;
pub mod scoring;

pub use placement::{place, PlacementEstimate};
pub use scoring::{rank, score, NodeScore};
