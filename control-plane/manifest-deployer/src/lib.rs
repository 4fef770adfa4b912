pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod manifest;
pub mod readiness;

pub use error::DeployerError;
pub use manifest::{DeployerContext, DeployerSettings, Manifest};

use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init_tracing(default_env: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_env));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
