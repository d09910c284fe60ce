//! provides logging helpers

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::{prelude::*, registry};

/// initiate the global tracing subscriber; `RUST_LOG` overrides the INFO default
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer().with_target(true).with_filter(env_filter);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = registry().with(fmt_layer).try_init();
}
