pub mod compose;
pub mod deployer;
pub mod error;
mod exec;
pub mod helm;
pub mod monitor;
pub mod registry;

pub use compose::{ComposeRuntime, ComposeRuntimeConfig};
pub use deployer::Deployer;
pub use error::RuntimeError;
pub use helm::HelmRuntime;
pub use monitor::{Monitor, WorkloadHealth, WorkloadStatus};
pub use registry::RuntimeRegistry;
