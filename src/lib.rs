pub mod cli;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;

// Make test_support available for integration tests
pub mod test_support;

pub use domain::{
    AutomationApi, ContainerRuntime, ContainerSpec, EmulatorTarget, PortBinding, PulumiProgram,
    ReadinessProbe,
};
pub use error::{ContainerStartError, DeploymentError, Error, HealthCheckTimeout, NetworkConflict, Result};
pub use infra::{DockerAdapter, FoundryConfig, PulumiCli};
pub use services::{
    ContainerGuard, ContainerService, DeploySpec, Deployment, DeploymentService, Environment,
    Localstack, NetworkLease, NetworkManager, Orchestrator, Postgres,
};
