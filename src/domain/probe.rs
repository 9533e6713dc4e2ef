//! Readiness probes.
//!
//! A probe decides whether a freshly started container is usable. The
//! container service polls it at a fixed interval until it passes or the
//! startup budget runs out.

use super::container::{PortMapping, Protocol};
use super::network::url_host;
use super::traits::ContainerRuntime;
use anyhow::{Context, Result, anyhow, bail};
use std::fmt::Debug;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// What a probe is allowed to look at.
pub struct ProbeTarget<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub container_id: &'a str,
    /// Host the published ports are reachable on.
    pub host: &'a str,
    pub ports: &'a [PortMapping],
}

impl ProbeTarget<'_> {
    pub fn host_port(&self, container_port: u16) -> Result<u16> {
        self.ports
            .iter()
            .find(|p| p.container_port == container_port && p.protocol == Protocol::Tcp)
            .map(|p| p.host_port)
            .ok_or_else(|| anyhow!("container port {container_port}/tcp is not published"))
    }
}

pub trait ProbeCheck: Send + Sync + Debug {
    /// `Ok` once the service is usable.
    fn check(&self, target: &ProbeTarget<'_>) -> Result<()>;

    /// Short description used in logs and timeout errors.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    check: Arc<dyn ProbeCheck>,
    pub timeout: Duration,
    pub interval: Duration,
}

impl ReadinessProbe {
    pub fn new(check: impl ProbeCheck + 'static) -> Self {
        Self {
            check: Arc::new(check),
            timeout: DEFAULT_PROBE_TIMEOUT,
            interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn check(&self, target: &ProbeTarget<'_>) -> Result<()> {
        self.check.check(target)
    }

    pub fn describe(&self) -> String {
        self.check.describe()
    }
}

/// Ready once a TCP connection to the published port succeeds.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub container_port: u16,
    pub connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(container_port: u16) -> Self {
        Self {
            container_port,
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl ProbeCheck for TcpProbe {
    fn check(&self, target: &ProbeTarget<'_>) -> Result<()> {
        let port = target.host_port(self.container_port)?;
        let addrs = (target.host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolving {}:{port}", target.host))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) => {
                Err::<(), _>(e).with_context(|| format!("connecting to {}:{port}", target.host))
            }
            None => bail!("{}:{port} resolved to no addresses", target.host),
        }
    }

    fn describe(&self) -> String {
        format!("tcp connect to {}/tcp", self.container_port)
    }
}

/// Ready once a command run inside the container exits with status 0.
/// Used for protocol-level checks such as `psql -c 'SELECT 1'`.
#[derive(Debug, Clone)]
pub struct ExecProbe {
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ExecProbe {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

impl ProbeCheck for ExecProbe {
    fn check(&self, target: &ProbeTarget<'_>) -> Result<()> {
        let output = target
            .runtime
            .exec_in_container(target.container_id, &self.command, &self.env)?;

        if output.success() {
            return Ok(());
        }

        bail!(
            "`{}` exited with {}: {}",
            self.command.join(" "),
            output.exit_code,
            output.stderr.trim()
        )
    }

    fn describe(&self) -> String {
        format!("exec `{}`", self.command.join(" "))
    }
}

/// Ready once one of `paths` answers 200 and `accept` likes the body.
///
/// The HTTP client is built on the first check and reused by every later
/// attempt, so `request_timeout` must be set before the probe first runs.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    pub container_port: u16,
    pub paths: Vec<String>,
    pub request_timeout: Duration,
    pub accept: fn(&str) -> bool,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpHealthProbe {
    pub fn new(container_port: u16, paths: &[&str]) -> Self {
        Self {
            container_port,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            request_timeout: Duration::from_secs(2),
            accept: |_| true,
            client: OnceLock::new(),
        }
    }

    pub fn accept(mut self, accept: fn(&str) -> bool) -> Self {
        self.accept = accept;
        self
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .context("building http client")?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl ProbeCheck for HttpHealthProbe {
    fn check(&self, target: &ProbeTarget<'_>) -> Result<()> {
        let port = target.host_port(self.container_port)?;
        let client = self.client()?;
        let host = url_host(target.host);

        let mut last_err = anyhow!("no health paths configured");
        for path in &self.paths {
            let url = format!("http://{host}:{port}{path}");
            let response = match client.get(&url).send() {
                Ok(response) => response,
                Err(e) => {
                    last_err = anyhow::Error::new(e).context(format!("GET {url}"));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                last_err = anyhow!("GET {url} returned {status}");
                continue;
            }

            let body = response.text().unwrap_or_default();
            if (self.accept)(&body) {
                return Ok(());
            }
            last_err = anyhow!("GET {url} answered but reported not ready");
        }

        Err(last_err)
    }

    fn describe(&self) -> String {
        format!(
            "http GET {} on {}/tcp",
            self.paths.join(" | "),
            self.container_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn mapping(container_port: u16, host_port: u16) -> PortMapping {
        PortMapping {
            container_port,
            protocol: Protocol::Tcp,
            host_port,
        }
    }

    #[test]
    fn tcp_probe_passes_when_port_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let runtime = MockRuntime::new();
        let ports = [mapping(5432, port)];
        let target = ProbeTarget {
            runtime: &runtime,
            container_id: "c1",
            host: "127.0.0.1",
            ports: &ports,
        };

        assert!(TcpProbe::new(5432).check(&target).is_ok());
    }

    #[test]
    fn tcp_probe_fails_for_unpublished_port() {
        let runtime = MockRuntime::new();
        let target = ProbeTarget {
            runtime: &runtime,
            container_id: "c1",
            host: "127.0.0.1",
            ports: &[],
        };

        let err = TcpProbe::new(5432).check(&target).unwrap_err();
        assert!(err.to_string().contains("not published"));
    }

    #[test]
    fn exec_probe_reports_exit_code() {
        let runtime = MockRuntime::new();
        runtime.set_exec_exit_code(2);
        let target = ProbeTarget {
            runtime: &runtime,
            container_id: "c1",
            host: "localhost",
            ports: &[],
        };

        let probe = ExecProbe::new(["pg_isready"]);
        let err = probe.check(&target).unwrap_err();
        assert!(err.to_string().contains("exited with 2"));

        runtime.set_exec_exit_code(0);
        assert!(probe.check(&target).is_ok());
        assert!(runtime.get_commands().contains(&"exec:c1:pg_isready".to_string()));
    }

    #[test]
    fn http_probe_falls_back_to_second_path() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for (i, stream) in listener.incoming().take(2).enumerate() {
                let mut stream = stream.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = if i == 0 {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                };
                let _ = stream.write_all(response.as_bytes());
            }
        });

        let runtime = MockRuntime::new();
        let ports = [mapping(4566, port)];
        let target = ProbeTarget {
            runtime: &runtime,
            container_id: "c1",
            host: "127.0.0.1",
            ports: &ports,
        };

        let probe = HttpHealthProbe::new(4566, &["/_localstack/health", "/health"]);
        assert!(probe.check(&target).is_ok());
    }

    #[test]
    fn http_health_check_reuses_its_client_across_attempts() {
        let runtime = MockRuntime::new();
        let ports = [mapping(4566, 1)];
        let target = ProbeTarget {
            runtime: &runtime,
            container_id: "c1",
            host: "127.0.0.1",
            ports: &ports,
        };
        let probe = HttpHealthProbe::new(4566, &["/health"]);

        assert!(probe.check(&target).is_err());
        let first: *const reqwest::blocking::Client = probe.client().unwrap();
        assert!(probe.check(&target).is_err());
        let second: *const reqwest::blocking::Client = probe.client().unwrap();

        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn describes_probes_for_error_messages() {
        let probe = ReadinessProbe::new(ExecProbe::new(["psql", "-c", "SELECT 1"]))
            .with_timeout(Duration::from_secs(2));
        assert_eq!(probe.describe(), "exec `psql -c SELECT 1`");
        assert_eq!(probe.timeout, Duration::from_secs(2));
        assert_eq!(probe.interval, DEFAULT_PROBE_INTERVAL);
    }
}
