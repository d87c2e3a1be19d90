pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod decrypt;
pub mod error;
pub mod hierarchy;
pub mod ownership;
pub mod quota;
pub mod router;
pub mod server;
pub mod status;
pub mod sync;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`
/// for the targets it names.
pub fn init_tracing(default_directive: &str) {
    let directive = default_directive
        .parse()
        .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into());
    let filter = EnvFilter::builder()
        .with_default_directive(directive)
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact())
        .with(filter)
        .try_init();
}
