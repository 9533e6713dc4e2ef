mod container_service;
mod deployment_service;
mod localstack;
mod network_service;
mod orchestrator;
mod postgres;

pub use container_service::{ContainerGuard, ContainerService};
pub use deployment_service::{DeploySpec, Deployment, DeploymentService};
pub use localstack::{EDGE_PORT, HEALTH_PATHS, Localstack, LocalstackConnection, health_body_ready};
pub use network_service::{NetworkLease, NetworkManager};
pub use orchestrator::{Environment, EnvironmentConnection, Orchestrator};
pub use postgres::{POSTGRES_PORT, Postgres, PostgresConnection};
