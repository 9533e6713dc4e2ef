use crate::domain::{
    Container, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, NetworkInfo,
    PortMapping, Protocol,
};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

/// Label put on everything this crate creates.
pub const MANAGED_LABEL: &str = "dev.fixture-foundry.managed=true";

/// Drives the local engine through the `docker` CLI.
///
/// `host` is forwarded as `DOCKER_HOST`; when unset the CLI falls back to its
/// own environment and context.
#[derive(Debug, Clone, Default)]
pub struct DockerAdapter {
    host: Option<String>,
}

impl DockerAdapter {
    pub fn new(host: Option<String>) -> Self {
        Self { host }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(host) = &self.host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd
    }

    fn docker<I, S>(&self, args: I, context: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.docker_output(args, context)?;
        ensure_success(&output, context)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn docker_output<I, S>(&self, args: I, context: &str) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command()
            .args(args.into_iter().map(|item| item.as_ref().to_os_string()))
            .stdin(Stdio::null())
            .output()
            .with_context(|| context.to_string())
    }
}

impl ContainerRuntime for DockerAdapter {
    fn ping(&self) -> Result<()> {
        self.docker(
            ["version", "--format", "{{.Server.Version}}"],
            "contacting docker daemon",
        )
        .map(|_| ())
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        self.docker(["pull", "--quiet", image], &format!("pulling {image}"))
            .map(|_| ())
    }

    fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let id = self.docker(
            create_args(name, spec),
            &format!("creating container {name} from {}", spec.image),
        )?;

        if id.is_empty() {
            bail!("docker create returned no id for {name}");
        }
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<()> {
        self.docker(["start", id], &format!("starting container {id}"))
            .map(|_| ())
    }

    fn get_container(&self, id: &str) -> Result<Container> {
        let output = self.docker_output(
            ["container", "inspect", id],
            &format!("inspecting container {id}"),
        )?;

        if !output.status.success() {
            return Ok(Container::not_created(id));
        }

        parse_container_inspect(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("parsing inspect output of {id}"))
    }

    fn exec_in_container(
        &self,
        id: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput> {
        let mut args: Vec<String> = vec!["exec".into()];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(id.into());
        args.extend(command.iter().cloned());

        let output = self.docker_output(args, &format!("executing in {id}"))?;

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn container_logs(&self, id: &str, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        let output = self.docker_output(
            ["logs", "--tail", tail.as_str(), id],
            &format!("reading logs of {id}"),
        )?;
        ensure_success(&output, &format!("reading logs of {id}"))?;

        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let timeout = timeout.as_secs().to_string();
        self.docker(
            ["stop", "--time", timeout.as_str(), id],
            &format!("stopping container {id}"),
        )
        .map(|_| ())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.docker(["rm", "--force", "--volumes", id], &format!("removing container {id}"))
            .map(|_| ())
    }

    fn find_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        let output = self.docker_output(
            ["network", "inspect", name],
            &format!("looking up network {name}"),
        )?;

        if !output.status.success() {
            return Ok(None);
        }

        let networks: Vec<NetworkInspect> =
            serde_json::from_slice(&output.stdout).with_context(|| format!("parsing network {name}"))?;

        // `network inspect` also matches on id prefixes; only an exact name counts.
        Ok(networks
            .into_iter()
            .find(|n| n.name == name)
            .map(|n| NetworkInfo {
                id: n.id,
                name: n.name,
                driver: n.driver,
            }))
    }

    fn create_network(&self, name: &str, driver: &str) -> Result<NetworkInfo> {
        let id = self.docker(
            ["network", "create", "--driver", driver, "--label", MANAGED_LABEL, name],
            &format!("creating network {name}"),
        )?;

        Ok(NetworkInfo {
            id,
            name: name.to_string(),
            driver: driver.to_string(),
        })
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.docker(["network", "rm", name], &format!("removing network {name}"))
            .map(|_| ())
    }
}

/// Arguments for `docker create`.
pub fn create_args(name: &str, spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        name.into(),
        "--label".into(),
        MANAGED_LABEL.into(),
    ];

    if let Some(net) = &spec.network {
        args.push("--network".into());
        args.push(net.clone());
    }

    for port in &spec.ports {
        args.push("-p".into());
        if port.host_port == 0 {
            args.push(port.key());
        } else {
            args.push(format!("{}:{}", port.host_port, port.key()));
        }
    }

    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    for mount in &spec.mounts {
        let mut m = format!(
            "type=bind,source={},target={}",
            mount.source.display(),
            mount.target
        );
        if mount.read_only {
            m.push_str(",readonly");
        }
        args.push("--mount".into());
        args.push(m);
    }

    args.push(spec.image.clone());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    name: String,
    state: InspectState,
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInspect {
    id: String,
    name: String,
    driver: String,
}

fn parse_container_inspect(json: &str) -> Result<Container> {
    let mut inspected: Vec<ContainerInspect> = serde_json::from_str(json)?;
    let Some(raw) = inspected.pop() else {
        bail!("inspect returned no containers");
    };

    let state = match raw.state.status.as_str() {
        "running" => ContainerState::Running,
        "exited" | "dead" => ContainerState::Exited(raw.state.exit_code),
        _ => ContainerState::Created,
    };

    let mut ports = Vec::new();
    for (key, bindings) in raw.network_settings.ports.unwrap_or_default() {
        let Some((port, proto)) = key.split_once('/') else {
            continue;
        };
        let (Ok(container_port), Some(protocol)) = (port.parse::<u16>(), Protocol::parse(proto))
        else {
            continue;
        };

        // Prefer the IPv4 binding; Docker lists `::` as a second entry.
        let host_port = bindings
            .unwrap_or_default()
            .into_iter()
            .filter(|b| !b.host_port.is_empty())
            .min_by_key(|b| b.host_ip.contains(':'))
            .and_then(|b| b.host_port.parse::<u16>().ok());

        if let Some(host_port) = host_port {
            ports.push(PortMapping {
                container_port,
                protocol,
                host_port,
            });
        }
    }
    ports.sort_by_key(|p| (p.container_port, p.protocol));

    let mut container = Container::new(
        raw.id,
        raw.name.trim_start_matches('/').to_string(),
        state,
    );
    container.ports = ports;
    Ok(container)
}

fn ensure_success(output: &Output, context: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    bail!(
        "docker returned status {:?} ({context}): {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr).trim()
    )
}
