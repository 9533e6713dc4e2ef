use crate::domain::{AutomationApi, StackOutputs, StackRef};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output, Stdio};

pub const DEFAULT_BACKEND_URL: &str = "file://~";

/// Drives stacks through the `pulumi` CLI, non-interactively.
#[derive(Debug, Clone)]
pub struct PulumiCli {
    backend_url: String,
    passphrase: String,
}

impl PulumiCli {
    pub fn new(backend_url: &str, passphrase: &str) -> Self {
        Self {
            backend_url: backend_url.to_string(),
            passphrase: passphrase.to_string(),
        }
    }

    fn pulumi<I, S>(&self, work_dir: &Path, args: I, context: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new("pulumi")
            .args(args.into_iter().map(|item| item.as_ref().to_os_string()))
            .arg("--non-interactive")
            .current_dir(work_dir)
            .env("PULUMI_BACKEND_URL", &self.backend_url)
            .env("PULUMI_CONFIG_PASSPHRASE", &self.passphrase)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
            .stdin(Stdio::null())
            .output()
            .with_context(|| context.to_string())?;

        ensure_success(&output, context)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for PulumiCli {
    fn default() -> Self {
        Self::new(DEFAULT_BACKEND_URL, "")
    }
}

impl AutomationApi for PulumiCli {
    fn select_or_create_stack(&self, stack: &StackRef) -> Result<()> {
        let name = stack.fully_qualified();
        self.pulumi(
            &stack.work_dir,
            ["stack", "select", "--create", "--stack", name.as_str()],
            &format!("selecting stack {name}"),
        )
        .map(|_| ())
    }

    fn set_all_config(&self, stack: &StackRef, config: &BTreeMap<String, String>) -> Result<()> {
        let name = stack.fully_qualified();
        let mut args: Vec<String> = vec!["config".into(), "set-all".into(), "--stack".into(), name.clone()];
        for (key, value) in config {
            args.push("--plaintext".into());
            args.push(format!("{key}={value}"));
        }

        self.pulumi(&stack.work_dir, args, &format!("configuring stack {name}"))
            .map(|_| ())
    }

    fn refresh(&self, stack: &StackRef) -> Result<()> {
        let name = stack.fully_qualified();
        self.pulumi(
            &stack.work_dir,
            ["refresh", "--yes", "--skip-preview", "--stack", name.as_str()],
            &format!("refreshing stack {name}"),
        )
        .map(|_| ())
    }

    fn up(&self, stack: &StackRef) -> Result<StackOutputs> {
        let name = stack.fully_qualified();
        self.pulumi(
            &stack.work_dir,
            ["up", "--yes", "--skip-preview", "--stack", name.as_str()],
            &format!("deploying stack {name}"),
        )?;

        let raw = self.pulumi(
            &stack.work_dir,
            ["stack", "output", "--json", "--show-secrets", "--stack", name.as_str()],
            &format!("reading outputs of {name}"),
        )?;
        parse_outputs(&raw).with_context(|| format!("parsing outputs of {name}"))
    }

    fn destroy(&self, stack: &StackRef) -> Result<()> {
        let name = stack.fully_qualified();
        self.pulumi(
            &stack.work_dir,
            ["destroy", "--yes", "--skip-preview", "--stack", name.as_str()],
            &format!("destroying stack {name}"),
        )
        .map(|_| ())
    }

    fn remove_stack(&self, stack: &StackRef) -> Result<()> {
        let name = stack.fully_qualified();
        self.pulumi(
            &stack.work_dir,
            ["stack", "rm", "--yes", "--stack", name.as_str()],
            &format!("removing stack {name}"),
        )
        .map(|_| ())
    }

    fn list_stacks(&self, work_dir: &Path) -> Result<Vec<String>> {
        let raw = self.pulumi(work_dir, ["stack", "ls", "--json"], "listing stacks")?;
        parse_stack_list(&raw)
    }
}

pub fn parse_outputs(raw: &str) -> Result<StackOutputs> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let serde_json::Value::Object(map) = value else {
        bail!("stack outputs are not a JSON object");
    };

    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct StackSummary {
    name: String,
}

fn parse_stack_list(raw: &str) -> Result<Vec<String>> {
    let stacks: Vec<StackSummary> = serde_json::from_str(raw).context("parsing stack list")?;
    Ok(stacks.into_iter().map(|s| s.name).collect())
}

fn ensure_success(output: &Output, context: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    // Provider diagnostics land on stdout for `up`/`destroy`, CLI errors on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(
        "pulumi returned status {:?} ({context}): {}\n{}",
        output.status.code(),
        stderr.trim(),
        stdout.trim()
    )
}
