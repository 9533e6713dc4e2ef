use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stack outputs by name. Non-string values keep their JSON text.
pub type StackOutputs = BTreeMap<String, String>;

/// Organization used for project-scoped stacks on self-managed backends.
pub const DEFAULT_ORGANIZATION: &str = "organization";

/// A Pulumi program: the directory holding its `Pulumi.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulumiProgram {
    pub work_dir: PathBuf,
}

impl PulumiProgram {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackRef {
    pub project: String,
    pub stack: String,
    pub work_dir: PathBuf,
}

impl StackRef {
    pub fn new(project: &str, stack: &str, program: &PulumiProgram) -> Self {
        Self {
            project: project.to_string(),
            stack: stack.to_string(),
            work_dir: program.work_dir.clone(),
        }
    }

    pub fn fully_qualified(&self) -> String {
        format!("{DEFAULT_ORGANIZATION}/{}/{}", self.project, self.stack)
    }
}

impl fmt::Display for StackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified())
    }
}

/// Where a deployment's AWS provider should point instead of AWS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmulatorTarget {
    pub endpoint_url: String,
    pub region: String,
    pub services: Vec<String>,
}

impl EmulatorTarget {
    /// Provider configuration that sends every configured service to the
    /// emulator with dummy credentials.
    pub fn provider_config(&self) -> BTreeMap<String, String> {
        let endpoints: BTreeMap<&str, &str> = self
            .services
            .iter()
            .map(|svc| (svc.as_str(), self.endpoint_url.as_str()))
            .collect();
        let endpoints = serde_json::json!([endpoints]).to_string();

        let mut config = BTreeMap::new();
        config.insert("aws:region".to_string(), self.region.clone());
        config.insert("aws:accessKey".to_string(), "test".to_string());
        config.insert("aws:secretKey".to_string(), "test".to_string());
        config.insert("aws:endpoints".to_string(), endpoints);
        for flag in [
            "aws:skipCredentialsValidation",
            "aws:skipRegionValidation",
            "aws:skipRequestingAccountId",
            "aws:skipMetadataApiCheck",
            "aws:insecure",
            "aws:s3UsePathStyle",
        ] {
            config.insert(flag.to_string(), "true".to_string());
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentHandle {
    pub stack: StackRef,
    pub outputs: StackOutputs,
    pub targets_emulator: bool,
}
