use super::probe::ReadinessProbe;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of a container owned by a [`crate::services::ContainerGuard`].
///
/// `Creating → Starting → HealthChecking → Ready → TearingDown → Destroyed`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Creating,
    Starting,
    HealthChecking,
    Ready,
    TearingDown,
    Destroyed,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (current, Failed) => !current.is_terminal(),
            (Creating, Starting)
            | (Starting, HealthChecking)
            | (HealthChecking, Ready)
            | (Ready, TearingDown)
            | (TearingDown, Destroyed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::HealthChecking => "health-checking",
            Self::Ready => "ready",
            Self::TearingDown => "tearing-down",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Engine-side state as reported by an inspect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i64),
    NotCreated,
}

#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub ports: Vec<PortMapping>,
}

impl Container {
    pub fn new(id: String, name: String, state: ContainerState) -> Self {
        Self {
            id,
            name,
            state,
            ports: Vec::new(),
        }
    }

    pub fn not_created(id: &str) -> Self {
        Self::new(id.to_string(), String::new(), ContainerState::NotCreated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

/// Requested publication of a container port. `host_port == 0` lets the
/// engine pick a free ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_port: u16,
}

impl PortBinding {
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            protocol: Protocol::Tcp,
            host_port,
        }
    }

    pub fn random(container_port: u16) -> Self {
        Self::tcp(container_port, 0)
    }

    /// Engine key for the port, e.g. `5432/tcp`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol.as_str())
    }
}

/// A published port after the engine resolved it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_port: u16,
}

impl PortMapping {
    pub fn matches(&self, binding: &PortBinding) -> bool {
        self.container_port == binding.container_port && self.protocol == binding.protocol
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to create one ephemeral container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Containers are named `<name_prefix>-<random suffix>` so repeated
    /// acquisitions never collide.
    pub name_prefix: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    /// Network joined at creation. Set from the lease when started through
    /// [`crate::services::ContainerService::start`] with a network.
    pub network: Option<String>,
    pub mounts: Vec<BindMount>,
    pub probe: ReadinessProbe,
    /// Pull the image before creating; a failed pull falls back to the local copy.
    pub pull: bool,
    pub stop_timeout: Duration,
}

impl ContainerSpec {
    pub fn new(name_prefix: &str, image: &str, probe: ReadinessProbe) -> Self {
        Self {
            name_prefix: name_prefix.to_string(),
            image: image.to_string(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            network: None,
            mounts: Vec::new(),
            probe,
            pull: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn port(mut self, binding: PortBinding) -> Self {
        self.ports.push(binding);
        self
    }

    pub fn network(mut self, name: &str) -> Self {
        self.network = Some(name.to_string());
        self
    }

    pub fn mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn pull(mut self, pull: bool) -> Self {
        self.pull = pull;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        self.probe.timeout
    }

    pub fn validate(&self) -> Result<(), String> {
        let prefix = self.name_prefix.as_str();
        let Some(first) = prefix.chars().next() else {
            return Err("container name prefix is empty".into());
        };
        if !first.is_ascii_alphanumeric() {
            return Err(format!(
                "container name prefix '{prefix}' must start with a letter or digit"
            ));
        }
        if let Some(c) = prefix
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '.' | '-'))
        {
            return Err(format!(
                "container name prefix '{prefix}' contains invalid character '{c}'"
            ));
        }

        if self.image.trim().is_empty() {
            return Err(format!("container '{prefix}' has no image"));
        }

        for (i, port) in self.ports.iter().enumerate() {
            if port.container_port == 0 {
                return Err(format!("container '{prefix}' publishes container port 0"));
            }
            if self.ports[..i]
                .iter()
                .any(|other| other.container_port == port.container_port && other.protocol == port.protocol)
            {
                return Err(format!(
                    "container '{prefix}' publishes {} twice",
                    port.key()
                ));
            }
        }

        if self.probe.interval.is_zero() {
            return Err(format!("container '{prefix}' has a zero probe interval"));
        }

        Ok(())
    }
}

/// A live container owned by exactly one guard.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub network: Option<String>,
    pub state: LifecycleState,
}

impl ContainerHandle {
    /// Host port published for a TCP container port.
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.container_port == container_port && p.protocol == Protocol::Tcp)
            .map(|p| p.host_port)
    }

    /// Moves to `next`, returning false (and leaving the state alone) on an
    /// illegal transition.
    pub fn transition(&mut self, next: LifecycleState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    /// Identifier usable with the runtime before the engine assigned an id.
    pub fn runtime_ref(&self) -> &str {
        if self.id.is_empty() { &self.name } else { &self.id }
    }
}
