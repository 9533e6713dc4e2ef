use super::container::{Container, ContainerSpec, ExecOutput};
use super::deployment::{StackOutputs, StackRef};
use super::network::NetworkInfo;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

/// Trait for container engine operations
pub trait ContainerRuntime: Send + Sync + Debug {
    /// Check that the engine answers
    fn ping(&self) -> Result<()>;

    /// Pull an image
    fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container named `name` from a spec, returning the engine id
    fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container
    fn start_container(&self, id: &str) -> Result<()>;

    /// Inspect a container; a missing container is `ContainerState::NotCreated`
    fn get_container(&self, id: &str) -> Result<Container>;

    /// Run a command inside a running container
    fn exec_in_container(
        &self,
        id: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput>;

    /// Last `tail` lines of the container log
    fn container_logs(&self, id: &str, tail: usize) -> Result<String>;

    /// Stop a container, killing it after `timeout`
    fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Remove a container and its anonymous volumes
    fn remove_container(&self, id: &str) -> Result<()>;

    /// Look up a network by exact name
    fn find_network(&self, name: &str) -> Result<Option<NetworkInfo>>;

    /// Create a network
    fn create_network(&self, name: &str, driver: &str) -> Result<NetworkInfo>;

    /// Remove a network
    fn remove_network(&self, name: &str) -> Result<()>;
}

/// Trait for infrastructure-as-code automation operations
pub trait AutomationApi: Send + Sync + Debug {
    fn select_or_create_stack(&self, stack: &StackRef) -> Result<()>;

    fn set_all_config(&self, stack: &StackRef, config: &BTreeMap<String, String>) -> Result<()>;

    fn refresh(&self, stack: &StackRef) -> Result<()>;

    /// Deploy the stack and return its outputs
    fn up(&self, stack: &StackRef) -> Result<StackOutputs>;

    fn destroy(&self, stack: &StackRef) -> Result<()>;

    /// Remove the stack and its configuration from the backend
    fn remove_stack(&self, stack: &StackRef) -> Result<()>;

    /// Names of the stacks known for the program in `work_dir`
    fn list_stacks(&self, work_dir: &Path) -> Result<Vec<String>>;
}
