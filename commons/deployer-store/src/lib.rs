pub mod error;
pub mod k8s;
pub mod object;
pub mod traits;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub use error::*;
pub use k8s::KubeResourceStore;
pub use traits::*;
