use crate::domain::{
    BindMount, ContainerSpec, EmulatorTarget, HttpHealthProbe, PortBinding, ReadinessProbe,
    url_host,
};
use crate::error::{ContainerStartError, Error, Result};
use crate::infra::config::LocalstackConfig;
use crate::services::{ContainerGuard, ContainerService, NetworkLease};
use anyhow::anyhow;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// LocalStack's single edge port; every service is multiplexed on it.
pub const EDGE_PORT: u16 = 4566;
pub const HEALTH_PATHS: &[&str] = &["/_localstack/health", "/health"];

const STATE_DIR: &str = "/var/lib/localstack";
const DOCKER_SOCKET_TARGET: &str = "/var/run/docker.sock";

/// A ready LocalStack container.
#[derive(Debug)]
pub struct Localstack {
    container: ContainerGuard,
    port: u16,
    region: String,
    services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalstackConnection {
    pub endpoint_url: String,
    pub host: String,
    pub port: u16,
    pub region: String,
    pub services: String,
    pub container_id: String,
    pub container_name: String,
}

impl Localstack {
    /// Container spec for `config`. `network` becomes `LAMBDA_DOCKER_NETWORK`
    /// so Lambda containers started by LocalStack can reach their siblings.
    pub fn spec(config: &LocalstackConfig, network: Option<&str>, volume_dir: &Path) -> ContainerSpec {
        let probe = ReadinessProbe::new(
            HttpHealthProbe::new(EDGE_PORT, HEALTH_PATHS).accept(health_body_ready),
        )
        .with_timeout(Duration::from_secs(config.timeout_secs));

        let mut spec = ContainerSpec::new("localstack", &config.image, probe)
            .env("SERVICES", config.service_list().join(","))
            .env("LS_LOG", "warn")
            .env("AWS_DEFAULT_REGION", config.region.as_str())
            .env("DISABLE_CORS_CHECKS", "1")
            .port(PortBinding::tcp(EDGE_PORT, config.port))
            .mount(BindMount::new(volume_dir, STATE_DIR))
            .pull(config.pull);

        if config.mount_docker_socket {
            spec = spec.mount(BindMount::new(&config.docker_socket, DOCKER_SOCKET_TARGET));
        }
        if let Some(network) = network {
            spec = spec.env("LAMBDA_DOCKER_NETWORK", network);
        }
        spec
    }

    pub fn start(
        service: &ContainerService,
        config: &LocalstackConfig,
        network: Option<&NetworkLease>,
    ) -> Result<Self> {
        let volume_dir = prepare_volume_dir(&config.volume_dir)?;
        let spec = Self::spec(config, network.map(NetworkLease::name), &volume_dir);

        let container = service.start(spec, network)?;
        let port = container.host_port(EDGE_PORT).ok_or_else(|| {
            ContainerStartError::engine(
                &config.image,
                "publish",
                anyhow!("{EDGE_PORT}/tcp has no host port"),
            )
        })?;

        let localstack = Self {
            container,
            port,
            region: config.region.clone(),
            services: config.service_list(),
        };
        info!(endpoint = %localstack.endpoint_url(), "localstack ready");
        Ok(localstack)
    }

    pub fn host(&self) -> &str {
        self.container.host()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn container(&self) -> &ContainerGuard {
        &self.container
    }

    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}", url_host(self.host()), self.port)
    }

    /// Where a deployment should send its AWS calls.
    pub fn target(&self) -> EmulatorTarget {
        EmulatorTarget {
            endpoint_url: self.endpoint_url(),
            region: self.region.clone(),
            services: self.services.clone(),
        }
    }

    /// AWS SDK variables for child processes talking to the emulator.
    pub fn aws_env(&self) -> Vec<(String, String)> {
        vec![
            ("AWS_REGION".to_string(), self.region.clone()),
            ("AWS_DEFAULT_REGION".to_string(), self.region.clone()),
            ("AWS_ACCESS_KEY_ID".to_string(), "test".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "test".to_string()),
            ("AWS_ENDPOINT_URL".to_string(), self.endpoint_url()),
        ]
    }

    pub fn connection(&self) -> LocalstackConnection {
        LocalstackConnection {
            endpoint_url: self.endpoint_url(),
            host: self.host().to_string(),
            port: self.port,
            region: self.region.clone(),
            services: self.services.join(","),
            container_id: self.container.id().to_string(),
            container_name: self.container.name().to_string(),
        }
    }

    pub fn teardown(self) -> anyhow::Result<()> {
        self.container.teardown()
    }
}

/// LocalStack answers 200 before its services finish booting; only trust
/// bodies that say so.
pub fn health_body_ready(body: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => {
            map.get("initialized").and_then(|v| v.as_bool()) == Some(true)
                || map.contains_key("services")
        }
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Expands `~`, creates the directory and returns it absolute, as bind
/// mounts require.
fn prepare_volume_dir(dir: &Path) -> Result<PathBuf> {
    let raw = dir.to_string_lossy();
    let expanded = shellexpand::tilde(&raw);
    let path = PathBuf::from(expanded.as_ref());

    fs::create_dir_all(&path).map_err(|source| Error::Io {
        context: format!("creating localstack volume dir {}", path.display()),
        source,
    })?;
    let path = path.canonicalize().map_err(|source| Error::Io {
        context: format!("resolving {}", path.display()),
        source,
    })?;

    debug!("localstack state in {}", path.display());
    Ok(path)
}
