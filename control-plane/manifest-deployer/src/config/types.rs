use std::time::Duration;

use envconfig::Envconfig;

use crate::manifest::DeployerSettings;
use crate::readiness::Backoff;

#[derive(Envconfig, Clone, Debug)]
pub struct DeployerConfig {
    /// Value of the instance label; deployers sharing a target cluster must differ.
    #[envconfig(from = "DEPLOYER_INSTANCE_ID", default = "default")]
    pub instance_id: String,

    #[envconfig(from = "DEPLOYER_DELETE_TIMEOUT_SECS", default = "60")]
    pub delete_timeout_secs: u64,

    #[envconfig(from = "DEPLOYER_DELETE_POLL_INTERVAL_SECS", default = "5")]
    pub delete_poll_interval_secs: u64,

    /// Upper bound on one health check, retries included.
    #[envconfig(from = "DEPLOYER_HEALTH_CHECK_TIMEOUT_SECS", default = "60")]
    pub health_check_timeout_secs: u64,

    #[envconfig(from = "DEPLOYER_HEALTH_CHECK_INTERVAL_SECS", default = "5")]
    pub health_check_interval_secs: u64,

    /// Delay multiplier between health check attempts; 0 keeps it constant.
    #[envconfig(from = "DEPLOYER_HEALTH_CHECK_FACTOR", default = "0")]
    pub health_check_factor: f64,

    #[envconfig(from = "DEPLOYER_HEALTH_CHECK_STEPS", default = "3")]
    pub health_check_steps: u32,

    #[envconfig(from = "DEPLOYER_REQUEST_TIMEOUT_SECS", default = "30")]
    pub request_timeout_secs: u64,

    #[envconfig(nested)]
    pub controller: ControllerConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ControllerConfig {
    #[envconfig(from = "DEPLOYER_RESYNC_SECS", default = "300")]
    pub resync_secs: u64,

    #[envconfig(from = "DEPLOYER_ERROR_REQUEUE_SECS", default = "30")]
    pub error_requeue_secs: u64,

    #[envconfig(from = "DEPLOYER_DELETING_REQUEUE_SECS", default = "5")]
    pub deleting_requeue_secs: u64,
}

impl DeployerConfig {
    pub fn settings(&self) -> anyhow::Result<DeployerSettings> {
        anyhow::ensure!(
            self.health_check_factor.is_finite() && self.health_check_factor >= 0.0,
            "DEPLOYER_HEALTH_CHECK_FACTOR must be a finite, non-negative number, got {}",
            self.health_check_factor
        );
        Ok(DeployerSettings {
            instance_id: self.instance_id.clone(),
            delete_timeout: Duration::from_secs(self.delete_timeout_secs),
            delete_poll_interval: Duration::from_secs(self.delete_poll_interval_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
            health_check: Backoff {
                initial_delay: Duration::from_secs(self.health_check_interval_secs),
                factor: self.health_check_factor,
                steps: self.health_check_steps,
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }
}
