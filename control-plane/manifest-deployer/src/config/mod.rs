mod types;

pub use types::{ControllerConfig, DeployerConfig};
