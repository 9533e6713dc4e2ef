use crate::domain::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, LifecycleState,
    PortMapping, ProbeTarget, ReadinessProbe,
};
use crate::error::{ContainerStartError, Error, HealthCheckTimeout, Result};
use crate::services::{NetworkLease, NetworkManager};
use anyhow::anyhow;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the published ports are re-read while the engine assigns them.
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Log lines attached to an error when a container dies during startup.
const FAILURE_LOG_LINES: usize = 20;

/// Creates, health-checks and destroys single containers.
#[derive(Debug, Clone)]
pub struct ContainerService {
    runtime: Arc<dyn ContainerRuntime>,
    networks: Option<Arc<NetworkManager>>,
    host: String,
    teardown: bool,
}

impl ContainerService {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            networks: None,
            host: "localhost".to_string(),
            teardown: true,
        }
    }

    /// Host that published ports are reached on.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_teardown(mut self, teardown: bool) -> Self {
        self.teardown = teardown;
        self
    }

    /// Manager that leases networks named by a spec when no lease is passed.
    pub fn with_networks(mut self, networks: Arc<NetworkManager>) -> Self {
        self.networks = Some(networks);
        self
    }

    /// Starts a container and blocks until its readiness probe passes.
    ///
    /// With a `network` lease the container joins that network and keeps it
    /// alive until the container is gone. Without one, a network named in
    /// `spec.network` is leased from the configured [`NetworkManager`]; with
    /// no manager the caller owns that network and must keep it alive. On
    /// any failure the partially created container is removed before the
    /// error is returned.
    pub fn start(
        &self,
        mut spec: ContainerSpec,
        network: Option<&NetworkLease>,
    ) -> Result<ContainerGuard> {
        spec.validate().map_err(Error::Config)?;

        let lease = match (network, &spec.network, &self.networks) {
            (Some(lease), _, _) => Some(lease.clone()),
            (None, Some(name), Some(networks)) => Some(networks.acquire(name)?),
            _ => None,
        };
        if let Some(lease) = &lease {
            spec.network = Some(lease.name().to_string());
        }

        let mut handle = ContainerHandle {
            id: String::new(),
            name: unique_name(&spec.name_prefix),
            image: spec.image.clone(),
            ports: Vec::new(),
            network: spec.network.clone(),
            state: LifecycleState::Creating,
        };

        match self.bring_up(&mut handle, &spec) {
            Ok(()) => {
                info!(
                    container = %handle.name,
                    id = %short_id(&handle.id),
                    ports = ?handle.ports,
                    "container ready"
                );
                Ok(ContainerGuard {
                    runtime: Arc::clone(&self.runtime),
                    handle,
                    host: self.host.clone(),
                    probe: spec.probe,
                    stop_timeout: spec.stop_timeout,
                    teardown: self.teardown,
                    released: false,
                    network: lease,
                })
            }
            Err(err) => {
                error!(container = %handle.name, state = %handle.state, "container failed to start: {err}");
                handle.transition(LifecycleState::Failed);
                self.discard(&handle);
                Err(err.into())
            }
        }
    }

    fn bring_up(
        &self,
        handle: &mut ContainerHandle,
        spec: &ContainerSpec,
    ) -> std::result::Result<(), ContainerStartError> {
        let deadline = Instant::now() + spec.startup_timeout();

        if spec.pull {
            if let Err(e) = self.runtime.pull_image(&spec.image) {
                warn!(image = %spec.image, "pull failed, trying local image: {e:#}");
            }
        }

        info!(container = %handle.name, image = %spec.image, "creating container");
        handle.id = self
            .runtime
            .create_container(&handle.name, spec)
            .map_err(|e| ContainerStartError::engine(&spec.image, "create", e))?;

        handle.transition(LifecycleState::Starting);
        self.runtime
            .start_container(&handle.id)
            .map_err(|e| ContainerStartError::engine(&spec.image, "start", e))?;

        handle.transition(LifecycleState::HealthChecking);
        handle.ports = self.resolve_ports(handle, spec, deadline)?;
        self.await_ready(handle, spec, deadline)?;

        handle.transition(LifecycleState::Ready);
        Ok(())
    }

    /// Waits until the container runs and every requested port has a host
    /// port; ports requested as 0 are only known after start.
    fn resolve_ports(
        &self,
        handle: &ContainerHandle,
        spec: &ContainerSpec,
        deadline: Instant,
    ) -> std::result::Result<Vec<PortMapping>, ContainerStartError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let container = self
                .runtime
                .get_container(&handle.id)
                .map_err(|e| ContainerStartError::engine(&spec.image, "inspect", e))?;

            match container.state {
                ContainerState::Running => {
                    let resolved: Vec<PortMapping> = spec
                        .ports
                        .iter()
                        .filter_map(|binding| {
                            container
                                .ports
                                .iter()
                                .find(|p| p.matches(binding) && p.host_port != 0)
                                .copied()
                        })
                        .collect();
                    if resolved.len() == spec.ports.len() {
                        return Ok(resolved);
                    }
                    debug!(container = %handle.name, "waiting for port assignment");
                }
                ContainerState::Exited(code) => return Err(self.exited(handle, spec, code)),
                ContainerState::NotCreated => {
                    return Err(ContainerStartError::engine(
                        &spec.image,
                        "start",
                        anyhow!("container {} disappeared during startup", handle.name),
                    ));
                }
                ContainerState::Created => {}
            }

            if Instant::now() >= deadline {
                return Err(HealthCheckTimeout {
                    resource: format!("container {}", handle.name),
                    probe: "port assignment".to_string(),
                    timeout: spec.startup_timeout(),
                    interval: PORT_POLL_INTERVAL,
                    attempts,
                    last_error: None,
                }
                .into());
            }
            thread::sleep(PORT_POLL_INTERVAL.min(deadline - Instant::now()));
        }
    }

    fn await_ready(
        &self,
        handle: &ContainerHandle,
        spec: &ContainerSpec,
        deadline: Instant,
    ) -> std::result::Result<(), ContainerStartError> {
        let probe = &spec.probe;
        let target = ProbeTarget {
            runtime: self.runtime.as_ref(),
            container_id: &handle.id,
            host: &self.host,
            ports: &handle.ports,
        };

        info!(container = %handle.name, probe = %probe.describe(), "waiting for readiness");
        let mut attempts = 0;
        let mut last_error = None;
        loop {
            attempts += 1;
            match probe.check(&target) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(container = %handle.name, attempt = attempts, "not ready yet: {e:#}");
                    last_error = Some(format!("{e:#}"));
                }
            }

            // A crashed container will never pass; fail now instead of at the deadline.
            if let Ok(container) = self.runtime.get_container(&handle.id) {
                if let ContainerState::Exited(code) = container.state {
                    return Err(self.exited(handle, spec, code));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HealthCheckTimeout {
                    resource: format!("container {} ({})", handle.name, spec.image),
                    probe: probe.describe(),
                    timeout: spec.startup_timeout(),
                    interval: probe.interval,
                    attempts,
                    last_error,
                }
                .into());
            }
            thread::sleep(probe.interval.min(deadline - now));
        }
    }

    fn exited(&self, handle: &ContainerHandle, spec: &ContainerSpec, code: i64) -> ContainerStartError {
        let logs = self
            .runtime
            .container_logs(&handle.id, FAILURE_LOG_LINES)
            .unwrap_or_else(|e| format!("<logs unavailable: {e:#}>"));
        ContainerStartError::engine(
            &spec.image,
            "start",
            anyhow!(
                "container {} exited with code {code} before becoming ready; last log lines:\n{}",
                handle.name,
                logs.trim_end()
            ),
        )
    }

    /// Best-effort removal of a container that never became ready.
    fn discard(&self, handle: &ContainerHandle) {
        let target = handle.runtime_ref();
        match self.runtime.remove_container(target) {
            Ok(()) => info!(container = %handle.name, "removed failed container"),
            Err(e) if handle.id.is_empty() => {
                debug!(container = %handle.name, "nothing to remove after failed create: {e:#}")
            }
            Err(e) => warn!(container = %handle.name, "could not remove failed container: {e:#}"),
        }
    }
}

/// A ready container. Dropping the guard stops and removes it; removal
/// failures are logged, never raised.
#[derive(Debug)]
pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    handle: ContainerHandle,
    host: String,
    probe: ReadinessProbe,
    stop_timeout: Duration,
    teardown: bool,
    released: bool,
    // Dropped after `Drop::drop` removed the container.
    network: Option<NetworkLease>,
}

impl ContainerGuard {
    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.handle.host_port(container_port)
    }

    pub fn state(&self) -> LifecycleState {
        self.handle.state
    }

    pub fn network(&self) -> Option<&NetworkLease> {
        self.network.as_ref()
    }

    /// Runs the readiness probe once more.
    pub fn check_ready(&self) -> anyhow::Result<()> {
        self.probe.check(&ProbeTarget {
            runtime: self.runtime.as_ref(),
            container_id: &self.handle.id,
            host: &self.host,
            ports: &self.handle.ports,
        })
    }

    /// Tears down now and reports a removal failure instead of logging it.
    pub fn teardown(mut self) -> anyhow::Result<()> {
        self.release()
    }

    fn release(&mut self) -> anyhow::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if !self.teardown {
            info!(
                container = %self.handle.name,
                id = %self.handle.id,
                "teardown disabled, leaving container running"
            );
            return Ok(());
        }

        self.handle.transition(LifecycleState::TearingDown);
        info!(container = %self.handle.name, "tearing down container");

        if let Err(e) = self.runtime.stop_container(&self.handle.id, self.stop_timeout) {
            warn!(container = %self.handle.name, "stop failed, forcing removal: {e:#}");
        }

        match self.runtime.remove_container(&self.handle.id) {
            Ok(()) => {
                self.handle.transition(LifecycleState::Destroyed);
                debug!(container = %self.handle.name, "container removed");
                Ok(())
            }
            Err(e) => {
                self.handle.transition(LifecycleState::Failed);
                Err(e.context(format!("removing container {}", self.handle.name)))
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(container = %self.handle.name, "teardown failed: {e:#}");
        }
    }
}

fn unique_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..12])
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecProbe, PortBinding, ProbeCheck};
    use crate::test_support::MockRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingProbe {
        calls: AtomicUsize,
        pass_after: usize,
    }

    impl ProbeCheck for CountingProbe {
        fn check(&self, _target: &ProbeTarget<'_>) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.pass_after {
                Ok(())
            } else {
                anyhow::bail!("attempt {n} refused")
            }
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    fn spec(probe: ReadinessProbe) -> ContainerSpec {
        ContainerSpec::new("svc", "app:latest", probe).port(PortBinding::random(8080))
    }

    fn fast(check: impl ProbeCheck + 'static, timeout_ms: u64) -> ReadinessProbe {
        ReadinessProbe::new(check)
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_interval(Duration::from_millis(10))
    }

    #[test]
    fn start_resolves_ports_and_reaches_ready() {
        let mock = Arc::new(MockRuntime::new());
        let service = ContainerService::new(mock.clone());

        let probe = CountingProbe {
            pass_after: 2,
            ..Default::default()
        };
        let guard = service.start(spec(fast(probe, 1_000)), None).unwrap();

        assert_eq!(guard.state(), LifecycleState::Ready);
        assert!(guard.name().starts_with("svc-"));
        assert!(guard.host_port(8080).unwrap() > 0);
        assert_eq!(mock.get_state(guard.id()), Some(ContainerState::Running));
    }

    #[test]
    fn timeout_removes_container_and_reports_probe() {
        let mock = Arc::new(MockRuntime::new());
        let service = ContainerService::new(mock.clone());

        let probe = CountingProbe {
            pass_after: usize::MAX,
            ..Default::default()
        };
        let err = service.start(spec(fast(probe, 50)), None).unwrap_err();

        assert!(err.is_health_check_timeout());
        assert!(err.to_string().contains("probe: counting"));
        assert_eq!(mock.container_count(), 0);
    }

    #[test]
    fn create_failure_is_engine_error() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("create");
        let service = ContainerService::new(mock.clone());

        let err = service
            .start(spec(fast(CountingProbe::default(), 50)), None)
            .unwrap_err();

        match err {
            Error::ContainerStart(ContainerStartError::Engine { stage, .. }) => {
                assert_eq!(stage, "create")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.container_count(), 0);
    }

    #[test]
    fn engine_recovers_after_create_failure_clears() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("create");
        let service = ContainerService::new(mock.clone());
        assert!(service.start(spec(fast(CountingProbe::default(), 50)), None).is_err());

        mock.clear_fail_on();
        let guard = service
            .start(spec(fast(CountingProbe::default(), 1_000)), None)
            .unwrap();

        assert_eq!(guard.state(), LifecycleState::Ready);
        assert_eq!(mock.container_count(), 1);
    }

    #[test]
    fn named_network_without_lease_is_leased_from_manager() {
        let mock = Arc::new(MockRuntime::new());
        let networks = NetworkManager::new(mock.clone(), true);
        let service = ContainerService::new(mock.clone()).with_networks(networks.clone());

        let guard = service
            .start(spec(fast(CountingProbe::default(), 1_000)).network("ls-dev"), None)
            .unwrap();

        assert_eq!(networks.ref_count("ls-dev"), 1);
        assert_eq!(guard.network().map(NetworkLease::name), Some("ls-dev"));
        let record = mock.get_container_record(guard.id()).unwrap();
        assert_eq!(record.network.as_deref(), Some("ls-dev"));

        drop(guard);
        assert_eq!(networks.ref_count("ls-dev"), 0);
        assert!(!mock.network_exists("ls-dev"));
    }

    #[test]
    fn named_network_without_manager_is_left_to_caller() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_network("external", "bridge");
        let service = ContainerService::new(mock.clone());

        let guard = service
            .start(spec(fast(CountingProbe::default(), 1_000)).network("external"), None)
            .unwrap();
        assert!(guard.network().is_none());

        drop(guard);
        assert!(mock.network_exists("external"));
    }

    #[test]
    fn start_failure_removes_created_container() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("start");
        let service = ContainerService::new(mock.clone());

        let err = service
            .start(spec(fast(CountingProbe::default(), 50)), None)
            .unwrap_err();

        assert!(!err.is_health_check_timeout());
        assert_eq!(mock.container_count(), 0);
        assert!(mock.get_commands().iter().any(|c| c.starts_with("remove:")));
    }

    #[test]
    fn crashed_container_fails_fast_with_logs() {
        let mock = Arc::new(MockRuntime::new());
        mock.exit_on_start(1, "FATAL: password authentication failed");
        let service = ContainerService::new(mock.clone());

        let started = Instant::now();
        let err = service
            .start(spec(fast(ExecProbe::new(["true"]), 5_000)), None)
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("exited with code 1"));
        assert!(err.to_string().contains("password authentication failed"));
    }

    #[test]
    fn drop_stops_then_removes_once() {
        let mock = Arc::new(MockRuntime::new());
        let service = ContainerService::new(mock.clone());
        let guard = service
            .start(spec(fast(CountingProbe::default(), 1_000)), None)
            .unwrap();
        let id = guard.id().to_string();

        drop(guard);

        let commands = mock.get_commands();
        let stop = commands.iter().position(|c| *c == format!("stop:{id}")).unwrap();
        let remove = commands.iter().position(|c| *c == format!("remove:{id}")).unwrap();
        assert!(stop < remove);
        assert_eq!(commands.iter().filter(|c| **c == format!("remove:{id}")).count(), 1);
        assert!(!mock.container_exists(&id));
    }

    #[test]
    fn explicit_teardown_surfaces_removal_failure() {
        let mock = Arc::new(MockRuntime::new());
        let service = ContainerService::new(mock.clone());
        let guard = service
            .start(spec(fast(CountingProbe::default(), 1_000)), None)
            .unwrap();
        mock.set_fail_on("remove");

        assert!(guard.teardown().is_err());
    }

    #[test]
    fn teardown_disabled_leaves_container() {
        let mock = Arc::new(MockRuntime::new());
        let service = ContainerService::new(mock.clone()).with_teardown(false);
        let guard = service
            .start(spec(fast(CountingProbe::default(), 1_000)), None)
            .unwrap();
        let id = guard.id().to_string();

        drop(guard);

        assert_eq!(mock.get_state(&id), Some(ContainerState::Running));
    }

    #[test]
    fn rejects_invalid_spec_before_touching_engine() {
        let mock = Arc::new(MockRuntime::new());
        let service = ContainerService::new(mock.clone());
        let bad = ContainerSpec::new("bad name", "img", fast(CountingProbe::default(), 50));

        assert!(matches!(service.start(bad, None), Err(Error::Config(_))));
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn unique_names_never_repeat() {
        let a = unique_name("pg");
        let b = unique_name("pg");
        assert_ne!(a, b);
        assert_eq!(a.len(), "pg-".len() + 12);
    }
}
