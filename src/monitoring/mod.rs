pub mod progress;

pub use progress::{Counter, JobKind, JobProgress, JobStatus, ProgressTracker, ProgressUpdate};
