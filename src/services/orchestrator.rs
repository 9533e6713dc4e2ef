use crate::domain::{AutomationApi, ContainerRuntime, ContainerSpec};
use crate::error::{Error, Result};
use crate::infra::{DockerAdapter, FoundryConfig, PulumiCli};
use crate::services::{
    ContainerGuard, ContainerService, Deployment, DeploySpec, DeploymentService, Localstack,
    LocalstackConnection, NetworkLease, NetworkManager, Postgres, PostgresConnection,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Entry point for assembling a test environment.
///
/// Every acquisition returns a guard. Guards are released when dropped, so
/// binding them as locals unwinds the environment in reverse order on every
/// exit path, panics included:
///
/// ```no_run
/// # fn main() -> fixture_foundry::Result<()> {
/// let foundry = fixture_foundry::Orchestrator::from_env()?;
/// let network = foundry.network()?;
/// let db = foundry.postgres(Some(&network))?;
/// let emulator = foundry.localstack(Some(&network))?;
/// println!("{} {}", db.dsn(), emulator.endpoint_url());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Orchestrator {
    config: FoundryConfig,
    networks: Arc<NetworkManager>,
    containers: ContainerService,
    deployments: DeploymentService,
}

impl Orchestrator {
    pub fn new(
        config: FoundryConfig,
        runtime: Arc<dyn ContainerRuntime>,
        automation: Arc<dyn AutomationApi>,
    ) -> Self {
        let networks = NetworkManager::new(Arc::clone(&runtime), config.teardown);
        let containers = ContainerService::new(runtime)
            .with_networks(Arc::clone(&networks))
            .with_host(&config.docker.published_host())
            .with_teardown(config.teardown);
        let deployments = DeploymentService::new(automation).with_teardown(config.teardown);

        Self {
            config,
            networks,
            containers,
            deployments,
        }
    }

    /// Real Docker and Pulumi backends for `config`. Fails fast when the
    /// engine does not answer.
    pub fn from_config(config: FoundryConfig) -> Result<Self> {
        let runtime = DockerAdapter::new(config.docker.host.clone());
        runtime.ping().map_err(Error::RuntimeUnavailable)?;

        let automation = PulumiCli::new(&config.pulumi.backend_url, &config.pulumi.passphrase);
        Ok(Self::new(config, Arc::new(runtime), Arc::new(automation)))
    }

    /// [`Self::from_config`] with configuration from `./fixture-foundry.toml`
    /// and the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_config(FoundryConfig::load(None)?)
    }

    pub fn config(&self) -> &FoundryConfig {
        &self.config
    }

    pub fn networks(&self) -> &Arc<NetworkManager> {
        &self.networks
    }

    /// The configured shared network.
    pub fn network(&self) -> Result<NetworkLease> {
        self.networks.acquire(&self.config.network.name)
    }

    /// Any other network, shared with every holder of the same name.
    pub fn network_named(&self, name: &str) -> Result<NetworkLease> {
        self.networks.acquire(name)
    }

    /// Any container, readiness-checked by its own probe. A network named in
    /// `spec` without a lease is leased for the container's lifetime.
    pub fn container(&self, spec: ContainerSpec, network: Option<&NetworkLease>) -> Result<ContainerGuard> {
        self.containers.start(spec, network)
    }

    pub fn postgres(&self, network: Option<&NetworkLease>) -> Result<Postgres> {
        Postgres::start(&self.containers, &self.config.postgres, network)
    }

    pub fn localstack(&self, network: Option<&NetworkLease>) -> Result<Localstack> {
        Localstack::start(&self.containers, &self.config.localstack, network)
    }

    /// Deploys `spec`, routed through `emulator` when given.
    pub fn deploy(&self, spec: &DeploySpec, emulator: Option<&Localstack>) -> Result<Deployment> {
        let target = emulator.map(Localstack::target);
        self.deployments.deploy(spec, target.as_ref())
    }

    /// Network, database and emulator wired together.
    pub fn environment(&self) -> Result<Environment> {
        let network = self.network()?;
        let postgres = self.postgres(Some(&network))?;
        let localstack = self.localstack(Some(&network))?;

        info!(network = %network.name(), "environment ready");
        Ok(Environment {
            localstack,
            postgres,
            network,
        })
    }
}

/// A full environment. Fields drop in declaration order: emulator, database,
/// then the network they share.
#[derive(Debug)]
pub struct Environment {
    pub localstack: Localstack,
    pub postgres: Postgres,
    pub network: NetworkLease,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentConnection {
    pub network: String,
    pub postgres: PostgresConnection,
    pub localstack: LocalstackConnection,
}

impl Environment {
    pub fn connection(&self) -> EnvironmentConnection {
        EnvironmentConnection {
            network: self.network.name().to_string(),
            postgres: self.postgres.connection(),
            localstack: self.localstack.connection(),
        }
    }
}
