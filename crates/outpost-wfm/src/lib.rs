pub mod auth;
pub mod bundle;
pub mod client;
pub mod error;
pub mod manifest;
pub mod types;

pub use auth::{ClientCredentialsTokenProvider, StaticToken, TokenProvider};
pub use bundle::{extract_bundle, verify_digest};
pub use client::WfmClient;
pub use error::WfmError;
pub use manifest::parse_deployment;
pub use types::{
    BundleRef, ComponentStatusReport, DeploymentRef, DeploymentStatus, OnboardingResponse,
    SyncOutcome, UnsignedAppStateManifest,
};
