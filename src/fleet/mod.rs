//! Class fleets: the records the engine keeps per class and the jobs that
//! create, maintain and remove them.

pub mod class;
mod maintain;
pub mod orchestrator;
mod provision;
pub mod store;
mod teardown;

pub use class::{BaseTier, ClassBase, ClassFleet, ClassRequest, ClassState, DiskMode, Mutation};
pub use orchestrator::FleetOrchestrator;
pub use store::{FleetStore, InMemoryFleetStore};
