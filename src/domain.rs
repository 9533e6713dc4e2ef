mod container;
pub mod deployment;
pub mod network;
pub mod probe;
pub mod traits;

pub use container::{
    BindMount, Container, ContainerHandle, ContainerSpec, ContainerState, DEFAULT_STOP_TIMEOUT,
    ExecOutput, LifecycleState, PortBinding, PortMapping, Protocol,
};
pub use deployment::{DeploymentHandle, EmulatorTarget, PulumiProgram, StackOutputs, StackRef};
pub use network::{BRIDGE_DRIVER, NetworkHandle, NetworkInfo, url_host};
pub use probe::{ExecProbe, HttpHealthProbe, ProbeCheck, ProbeTarget, ReadinessProbe, TcpProbe};
pub use traits::{AutomationApi, ContainerRuntime};
