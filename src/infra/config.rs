use crate::error::{Error, Result};
use crate::infra::pulumi_adapter::DEFAULT_BACKEND_URL;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FILE: &str = "fixture-foundry.toml";
pub const DEFAULT_NETWORK: &str = "ls-dev";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_DATABASE: &str = "chinook";
pub const DEFAULT_DATABASE_IMAGE: &str = "postgis/postgis:16-3.4";
pub const DEFAULT_LOCALSTACK_IMAGE: &str = "localstack/localstack:latest";
pub const DEFAULT_LOCALSTACK_SERVICES: &str = "logs,iam,lambda,secretsmanager,apigateway,cloudwatch";

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Engine socket, forwarded as `DOCKER_HOST`.
    pub host: Option<String>,
}

impl DockerConfig {
    /// Host that published ports are reachable on: the daemon host for
    /// `tcp://` sockets, `localhost` otherwise. IPv6 literals come back
    /// without brackets.
    pub fn published_host(&self) -> String {
        self.host
            .as_deref()
            .and_then(|h| h.strip_prefix("tcp://"))
            .and_then(authority_host)
            .unwrap_or("localhost")
            .to_string()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NETWORK.to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PostgresConfig {
    pub image: String,
    pub database: String,
    pub username: String,
    pub password: String,
    /// 0 lets the engine pick a free host port.
    pub host_port: u16,
    pub startup_timeout_secs: u64,
    pub pull: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_DATABASE_IMAGE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            username: "test_user".to_string(),
            password: "test_password".to_string(),
            host_port: 0,
            startup_timeout_secs: 60,
            pull: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LocalstackConfig {
    pub image: String,
    /// Comma-separated service list handed to LocalStack and the provider config.
    pub services: String,
    /// Host edge port; 0 lets the engine pick.
    pub port: u16,
    pub timeout_secs: u64,
    pub region: String,
    pub volume_dir: PathBuf,
    /// Mount the engine socket so LocalStack can spawn Lambda containers.
    pub mount_docker_socket: bool,
    pub docker_socket: PathBuf,
    pub pull: bool,
}

impl Default for LocalstackConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_LOCALSTACK_IMAGE.to_string(),
            services: DEFAULT_LOCALSTACK_SERVICES.to_string(),
            port: 0,
            timeout_secs: 90,
            region: DEFAULT_REGION.to_string(),
            volume_dir: PathBuf::from("./volume"),
            mount_docker_socket: true,
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            pull: true,
        }
    }
}

impl LocalstackConfig {
    pub fn service_list(&self) -> Vec<String> {
        self.services
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PulumiConfig {
    pub backend_url: String,
    pub passphrase: String,
}

impl Default for PulumiConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            passphrase: String::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FoundryConfig {
    /// Tear resources down at scope exit. Disable to inspect a failed run.
    pub teardown: bool,
    pub docker: DockerConfig,
    pub network: NetworkConfig,
    pub postgres: PostgresConfig,
    pub localstack: LocalstackConfig,
    pub pulumi: PulumiConfig,
}

impl Default for FoundryConfig {
    fn default() -> Self {
        Self {
            teardown: true,
            docker: DockerConfig::default(),
            network: NetworkConfig::default(),
            postgres: PostgresConfig::default(),
            localstack: LocalstackConfig::default(),
            pulumi: PulumiConfig::default(),
        }
    }
}

impl FoundryConfig {
    /// Defaults, overlaid with the TOML file at `path` (or
    /// `./fixture-foundry.toml` when it exists), overlaid with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let local = PathBuf::from("./").join(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    Self::from_file(&local)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::Io {
            context: format!("reading {}", path.display()),
            source,
        })?;

        debug!("loaded configuration from {}", path.display());
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("FOUNDRY_TEARDOWN") {
            match parse_bool(&raw) {
                Some(value) => self.teardown = value,
                None => warn!("ignoring FOUNDRY_TEARDOWN={raw}: not a boolean"),
            }
        }
        if let Some(host) = lookup("DOCKER_HOST").filter(|h| !h.is_empty()) {
            self.docker.host = Some(host);
        }
        if let Some(name) = lookup("DOCKER_TEST_NETWORK").filter(|n| !n.is_empty()) {
            self.network.name = name;
        }

        if let Some(database) = lookup("FOUNDRY_DATABASE") {
            self.postgres.database = database;
        }
        if let Some(image) = lookup("FOUNDRY_DATABASE_IMAGE") {
            self.postgres.image = image;
        }

        if let Some(image) = lookup("LOCALSTACK_IMAGE") {
            self.localstack.image = image;
        }
        if let Some(services) = lookup("LOCALSTACK_SERVICES") {
            self.localstack.services = services;
        }
        if let Some(raw) = lookup("LOCALSTACK_TIMEOUT") {
            match raw.trim().parse() {
                Ok(secs) => self.localstack.timeout_secs = secs,
                Err(_) => warn!("ignoring LOCALSTACK_TIMEOUT={raw}: not a number of seconds"),
            }
        }
        if let Some(raw) = lookup("LOCALSTACK_PORT") {
            match raw.trim().parse() {
                Ok(port) => self.localstack.port = port,
                Err(_) => warn!("ignoring LOCALSTACK_PORT={raw}: not a port"),
            }
        }
        if let Some(dir) = lookup("LOCALSTACK_VOLUME_DIR") {
            self.localstack.volume_dir = PathBuf::from(dir);
        }
        if let Some(region) = lookup("AWS_REGION").or_else(|| lookup("AWS_DEFAULT_REGION")) {
            self.localstack.region = region;
        }

        if let Some(url) = lookup("PULUMI_BACKEND_URL") {
            self.pulumi.backend_url = url;
        }
        if let Some(passphrase) = lookup("PULUMI_CONFIG_PASSPHRASE") {
            self.pulumi.passphrase = passphrase;
        }
    }
}

/// Host part of `host[:port][/path]`, where `host` may be a bracketed IPv6
/// literal.
fn authority_host(authority: &str) -> Option<&str> {
    let authority = authority.split('/').next().unwrap_or_default();
    let host = match authority.strip_prefix('[') {
        Some(rest) => rest.split_once(']')?.0,
        None => authority.split(':').next().unwrap_or_default(),
    };
    (!host.is_empty()).then_some(host)
}

/// Accepts 1/true/yes/y and 0/false/no/n, case-insensitively.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = FoundryConfig::default();

        assert!(config.teardown);
        assert_eq!(config.network.name, "ls-dev");
        assert_eq!(config.postgres.image, "postgis/postgis:16-3.4");
        assert_eq!(config.postgres.database, "chinook");
        assert_eq!(config.localstack.port, 0);
        assert_eq!(config.localstack.timeout_secs, 90);
        assert_eq!(config.pulumi.backend_url, "file://~");
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let toml = r#"
teardown = false

[postgres]
image = "postgres:16"

[localstack]
services = "s3, lambda"
port = 4566
"#;

        let config: FoundryConfig = toml::from_str(toml).unwrap();

        assert!(!config.teardown);
        assert_eq!(config.postgres.image, "postgres:16");
        assert_eq!(config.postgres.username, "test_user");
        assert_eq!(config.localstack.port, 4566);
        assert_eq!(config.localstack.service_list(), vec!["s3", "lambda"]);
        assert_eq!(config.network.name, "ls-dev");
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = FoundryConfig::default();
        config.apply_env(lookup_from(&[
            ("FOUNDRY_TEARDOWN", "No"),
            ("DOCKER_TEST_NETWORK", "ci-net"),
            ("FOUNDRY_DATABASE_IMAGE", "postgres:15"),
            ("LOCALSTACK_PORT", "4566"),
            ("LOCALSTACK_TIMEOUT", "soon"),
            ("AWS_DEFAULT_REGION", "eu-west-1"),
        ]));

        assert!(!config.teardown);
        assert_eq!(config.network.name, "ci-net");
        assert_eq!(config.postgres.image, "postgres:15");
        assert_eq!(config.localstack.port, 4566);
        assert_eq!(config.localstack.timeout_secs, 90);
        assert_eq!(config.localstack.region, "eu-west-1");
    }

    #[test]
    fn unparseable_teardown_keeps_default() {
        let mut config = FoundryConfig::default();
        config.apply_env(lookup_from(&[("FOUNDRY_TEARDOWN", "maybe")]));
        assert!(config.teardown);
    }

    #[test]
    fn parses_booleans_like_the_cli_options() {
        for raw in ["1", "TRUE", "yes", "Y"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "false", "NO", "n"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn published_host_follows_tcp_docker_host() {
        let mut docker = DockerConfig::default();
        assert_eq!(docker.published_host(), "localhost");

        docker.host = Some("unix:///run/user/1000/docker.sock".into());
        assert_eq!(docker.published_host(), "localhost");

        docker.host = Some("tcp://10.0.0.5:2375".into());
        assert_eq!(docker.published_host(), "10.0.0.5");
    }

    #[test]
    fn published_host_unwraps_ipv6_literals() {
        let mut docker = DockerConfig {
            host: Some("tcp://[::1]:2375".into()),
        };
        assert_eq!(docker.published_host(), "::1");

        docker.host = Some("tcp://[fd00::5]".into());
        assert_eq!(docker.published_host(), "fd00::5");

        docker.host = Some("tcp://[::1".into());
        assert_eq!(docker.published_host(), "localhost");

        docker.host = Some("tcp://docker.internal:2376/".into());
        assert_eq!(docker.published_host(), "docker.internal");
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "[network]\nname = \"from-file\"\n").unwrap();

        let config = FoundryConfig::from_file(&path).unwrap();
        assert_eq!(config.network.name, "from-file");

        fs::write(&path, "teardown = \"sometimes\"").unwrap();
        assert!(matches!(FoundryConfig::from_file(&path), Err(Error::Config(_))));
    }
}
