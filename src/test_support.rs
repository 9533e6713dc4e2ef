use crate::domain::{
    AutomationApi, Container, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput,
    NetworkInfo, PortBinding, PortMapping, StackOutputs, StackRef,
};
use anyhow::{Result, bail};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

/// First host port handed out for bindings requested as 0.
const FIRST_EPHEMERAL_PORT: u16 = 49153;

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MockContainer {
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub env: BTreeMap<String, String>,
    pub bindings: Vec<PortBinding>,
    pub ports: Vec<PortMapping>,
    pub network: Option<String>,
    pub logs: String,
}

/// In-memory engine that records every call as `operation:argument`.
#[derive(Debug)]
pub struct MockRuntime {
    containers: RwLock<HashMap<String, MockContainer>>,
    networks: RwLock<HashMap<String, NetworkInfo>>,
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<Option<String>>,
    exec_exit_code: RwLock<i64>,
    exit_on_start: RwLock<Option<(i64, String)>>,
    next_port: AtomicU16,
    next_id: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashMap::new()),
            commands: RwLock::new(Vec::new()),
            fail_on: RwLock::new(None),
            exec_exit_code: RwLock::new(0),
            exit_on_start: RwLock::new(None),
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Makes the next calls of `operation` fail until cleared.
    pub fn set_fail_on(&self, operation: &str) {
        *self.fail_on.write().unwrap() = Some(operation.to_string());
    }

    pub fn clear_fail_on(&self) {
        *self.fail_on.write().unwrap() = None;
    }

    pub fn set_exec_exit_code(&self, code: i64) {
        *self.exec_exit_code.write().unwrap() = code;
    }

    /// Containers started from now on exit immediately with `code`, leaving `logs`.
    pub fn exit_on_start(&self, code: i64, logs: &str) {
        *self.exit_on_start.write().unwrap() = Some((code, logs.to_string()));
    }

    /// Registers a network that existed before the test.
    pub fn add_network(&self, name: &str, driver: &str) {
        self.networks.write().unwrap().insert(
            name.to_string(),
            NetworkInfo {
                id: format!("net-{name}"),
                name: name.to_string(),
                driver: driver.to_string(),
            },
        );
    }

    pub fn network_exists(&self, name: &str) -> bool {
        self.networks.read().unwrap().contains_key(name)
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.containers.read().unwrap().contains_key(id)
    }

    pub fn container_count(&self) -> usize {
        self.containers.read().unwrap().len()
    }

    pub fn get_state(&self, id: &str) -> Option<ContainerState> {
        self.containers
            .read()
            .unwrap()
            .get(id)
            .map(|c| c.state.clone())
    }

    pub fn get_container_record(&self, id: &str) -> Option<MockContainer> {
        self.containers.read().unwrap().get(id).cloned()
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }

    fn check_fail(&self, operation: &str) -> Result<()> {
        if let Some(ref fail_on) = *self.fail_on.read().unwrap() {
            if fail_on == operation {
                bail!("Mock failure on: {}", operation);
            }
        }
        Ok(())
    }

    /// Resolves a name or id to the id key, like the engine does.
    fn resolve(&self, reference: &str) -> Option<String> {
        let containers = self.containers.read().unwrap();
        if containers.contains_key(reference) {
            return Some(reference.to_string());
        }
        containers
            .iter()
            .find(|(_, c)| c.name == reference)
            .map(|(id, _)| id.clone())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for MockRuntime {
    fn ping(&self) -> Result<()> {
        self.record_command("ping");
        self.check_fail("ping")
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        self.record_command(&format!("pull:{}", image));
        self.check_fail("pull")
    }

    fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        self.record_command(&format!("create:{}", name));
        self.check_fail("create")?;

        if let Some(network) = &spec.network {
            if !self.network_exists(network) {
                bail!("network {} not found", network);
            }
        }

        let id = format!("mock-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.write().unwrap().insert(
            id.clone(),
            MockContainer {
                name: name.to_string(),
                image: spec.image.clone(),
                state: ContainerState::Created,
                env: spec.env.clone(),
                bindings: spec.ports.clone(),
                ports: Vec::new(),
                network: spec.network.clone(),
                logs: String::new(),
            },
        );
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<()> {
        self.record_command(&format!("start:{}", id));
        self.check_fail("start")?;

        let exit = self.exit_on_start.read().unwrap().clone();
        let mut containers = self.containers.write().unwrap();
        let Some(container) = containers.get_mut(id) else {
            bail!("no such container: {}", id);
        };

        if let Some((code, logs)) = exit {
            container.state = ContainerState::Exited(code);
            container.logs = logs;
            return Ok(());
        }

        container.ports = container
            .bindings
            .iter()
            .map(|b| PortMapping {
                container_port: b.container_port,
                protocol: b.protocol,
                host_port: if b.host_port == 0 {
                    self.next_port.fetch_add(1, Ordering::SeqCst)
                } else {
                    b.host_port
                },
            })
            .collect();
        container.state = ContainerState::Running;
        Ok(())
    }

    fn get_container(&self, id: &str) -> Result<Container> {
        self.record_command(&format!("inspect:{}", id));
        self.check_fail("inspect")?;

        let containers = self.containers.read().unwrap();
        Ok(match containers.get(id) {
            Some(c) => {
                let mut container = Container::new(id.to_string(), c.name.clone(), c.state.clone());
                container.ports = c.ports.clone();
                container
            }
            None => Container::not_created(id),
        })
    }

    fn exec_in_container(
        &self,
        id: &str,
        command: &[String],
        _env: &[(String, String)],
    ) -> Result<ExecOutput> {
        self.record_command(&format!("exec:{}:{}", id, command.join(" ")));
        self.check_fail("exec")?;

        let exit_code = *self.exec_exit_code.read().unwrap();
        Ok(ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "mock exec failure".to_string()
            },
        })
    }

    fn container_logs(&self, id: &str, _tail: usize) -> Result<String> {
        self.record_command(&format!("logs:{}", id));
        self.check_fail("logs")?;

        Ok(self
            .containers
            .read()
            .unwrap()
            .get(id)
            .map(|c| c.logs.clone())
            .unwrap_or_default())
    }

    fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.record_command(&format!("stop:{}", id));
        self.check_fail("stop")?;

        if let Some(container) = self.containers.write().unwrap().get_mut(id) {
            container.state = ContainerState::Exited(0);
        }
        Ok(())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.record_command(&format!("remove:{}", id));
        self.check_fail("remove")?;

        let Some(key) = self.resolve(id) else {
            bail!("no such container: {}", id);
        };
        self.containers.write().unwrap().remove(&key);
        Ok(())
    }

    fn find_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        self.record_command(&format!("network_find:{}", name));
        self.check_fail("find_network")?;
        Ok(self.networks.read().unwrap().get(name).cloned())
    }

    fn create_network(&self, name: &str, driver: &str) -> Result<NetworkInfo> {
        self.record_command(&format!("network_create:{}", name));
        self.check_fail("create_network")?;

        let info = NetworkInfo {
            id: format!("net-{name}"),
            name: name.to_string(),
            driver: driver.to_string(),
        };
        self.networks
            .write()
            .unwrap()
            .insert(name.to_string(), info.clone());
        Ok(info)
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.record_command(&format!("network_remove:{}", name));
        self.check_fail("remove_network")?;

        let attached = self
            .containers
            .read()
            .unwrap()
            .values()
            .any(|c| c.network.as_deref() == Some(name));
        if attached {
            bail!("network {} has active endpoints", name);
        }
        self.networks.write().unwrap().remove(name);
        Ok(())
    }
}

type ProgramFn = dyn Fn(&BTreeMap<String, String>) -> Result<StackOutputs> + Send + Sync;

#[derive(Debug, Clone, Default)]
pub struct MockStack {
    pub config: BTreeMap<String, String>,
    pub deployed: bool,
}

/// In-memory automation backend. The program turns the stack configuration
/// into outputs so tests can see what the deployment was pointed at.
pub struct MockAutomation {
    stacks: RwLock<BTreeMap<String, MockStack>>,
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<Option<String>>,
    program: Box<ProgramFn>,
}

impl MockAutomation {
    pub fn new() -> Self {
        Self::with_program(|_| Ok(StackOutputs::new()))
    }

    pub fn with_program<F>(program: F) -> Self
    where
        F: Fn(&BTreeMap<String, String>) -> Result<StackOutputs> + Send + Sync + 'static,
    {
        Self {
            stacks: RwLock::new(BTreeMap::new()),
            commands: RwLock::new(Vec::new()),
            fail_on: RwLock::new(None),
            program: Box::new(program),
        }
    }

    pub fn set_fail_on(&self, operation: &str) {
        *self.fail_on.write().unwrap() = Some(operation.to_string());
    }

    pub fn clear_fail_on(&self) {
        *self.fail_on.write().unwrap() = None;
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn stack(&self, fully_qualified: &str) -> Option<MockStack> {
        self.stacks.read().unwrap().get(fully_qualified).cloned()
    }

    /// Simulates a stack left behind by an earlier run.
    pub fn add_stack(&self, fully_qualified: &str, deployed: bool) {
        self.stacks.write().unwrap().insert(
            fully_qualified.to_string(),
            MockStack {
                config: BTreeMap::new(),
                deployed,
            },
        );
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }

    fn check_fail(&self, operation: &str) -> Result<()> {
        if let Some(ref fail_on) = *self.fail_on.read().unwrap() {
            if fail_on == operation {
                bail!("Mock failure on: {}", operation);
            }
        }
        Ok(())
    }

    fn with_stack<T>(&self, stack: &StackRef, f: impl FnOnce(&mut MockStack) -> T) -> Result<T> {
        let name = stack.fully_qualified();
        let mut stacks = self.stacks.write().unwrap();
        match stacks.get_mut(&name) {
            Some(entry) => Ok(f(entry)),
            None => bail!("no stack named '{}' found", name),
        }
    }
}

impl Default for MockAutomation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockAutomation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockAutomation")
            .field("stacks", &self.stacks)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl AutomationApi for MockAutomation {
    fn select_or_create_stack(&self, stack: &StackRef) -> Result<()> {
        self.record_command(&format!("select:{}", stack));
        self.check_fail("select")?;

        self.stacks
            .write()
            .unwrap()
            .entry(stack.fully_qualified())
            .or_default();
        Ok(())
    }

    fn set_all_config(&self, stack: &StackRef, config: &BTreeMap<String, String>) -> Result<()> {
        self.record_command(&format!("config:{}", stack));
        self.check_fail("config")?;

        self.with_stack(stack, |entry| {
            entry
                .config
                .extend(config.iter().map(|(k, v)| (k.clone(), v.clone())))
        })
    }

    fn refresh(&self, stack: &StackRef) -> Result<()> {
        self.record_command(&format!("refresh:{}", stack));
        self.check_fail("refresh")?;
        self.with_stack(stack, |_| ())
    }

    fn up(&self, stack: &StackRef) -> Result<StackOutputs> {
        self.record_command(&format!("up:{}", stack));
        self.check_fail("up")?;

        let config = self.with_stack(stack, |entry| entry.config.clone())?;
        let outputs = (self.program)(&config)?;
        self.with_stack(stack, |entry| entry.deployed = true)?;
        Ok(outputs)
    }

    fn destroy(&self, stack: &StackRef) -> Result<()> {
        self.record_command(&format!("destroy:{}", stack));
        self.check_fail("destroy")?;
        self.with_stack(stack, |entry| entry.deployed = false)
    }

    fn remove_stack(&self, stack: &StackRef) -> Result<()> {
        self.record_command(&format!("remove_stack:{}", stack));
        self.check_fail("remove_stack")?;

        let name = stack.fully_qualified();
        let mut stacks = self.stacks.write().unwrap();
        if stacks.get(&name).is_some_and(|s| s.deployed) {
            bail!("stack '{}' still has resources; destroy it first", name);
        }
        stacks.remove(&name);
        Ok(())
    }

    fn list_stacks(&self, work_dir: &Path) -> Result<Vec<String>> {
        self.record_command(&format!("list:{}", work_dir.display()));
        self.check_fail("list")?;
        Ok(self.stacks.read().unwrap().keys().cloned().collect())
    }
}
