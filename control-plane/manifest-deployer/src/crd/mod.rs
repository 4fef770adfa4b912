pub mod deploy_item;
pub mod provider;

pub use deploy_item::{
    DeployItem, DeployItemSpec, DeployItemStatus, FINALIZER, LastError, Phase,
};
pub use provider::{
    MANAGED_DEPLOY_ITEM_LABEL, MANAGED_INSTANCE_LABEL, ManagedResourceStatus,
    ManifestEntry, ManifestPolicy, ProviderConfiguration, ProviderStatus,
    TypedReference, UpdateStrategy,
};
