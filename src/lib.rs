pub mod api;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod errors;
pub mod fleet;
pub mod hypervisor;
pub mod logging;
pub mod monitoring;
pub mod scheduler;

// Re-exports
pub use api::{create_router, AppState};
pub use errors::{FleetError, FleetResult};
pub use fleet::{ClassRequest, FleetOrchestrator, InMemoryFleetStore};
pub use monitoring::{JobProgress, JobStatus, ProgressTracker};
