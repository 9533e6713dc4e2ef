pub mod config;
pub mod docker_adapter;
pub mod pulumi_adapter;

pub use config::FoundryConfig;
pub use docker_adapter::DockerAdapter;
pub use pulumi_adapter::PulumiCli;
