use crate::domain::{
    AutomationApi, DeploymentHandle, EmulatorTarget, PulumiProgram, StackOutputs, StackRef,
};
use crate::error::{DeploymentError, Result, StackOperation};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to deploy and how.
#[derive(Debug, Clone)]
pub struct DeploySpec {
    pub project: String,
    pub stack: String,
    pub program: PulumiProgram,
    /// Applied after the emulator provider config, so explicit keys win.
    pub config: BTreeMap<String, String>,
    /// Destroy leftovers of an earlier run before deploying.
    pub pre_clean: bool,
    pub refresh: bool,
}

impl DeploySpec {
    pub fn new(project: &str, stack: &str, program: PulumiProgram) -> Self {
        Self {
            project: project.to_string(),
            stack: stack.to_string(),
            program,
            config: BTreeMap::new(),
            pre_clean: true,
            refresh: true,
        }
    }

    pub fn config(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.to_string(), value.to_string());
        self
    }

    pub fn stack_ref(&self) -> StackRef {
        StackRef::new(&self.project, &self.stack, &self.program)
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentService {
    automation: Arc<dyn AutomationApi>,
    teardown: bool,
}

impl DeploymentService {
    pub fn new(automation: Arc<dyn AutomationApi>) -> Self {
        Self {
            automation,
            teardown: true,
        }
    }

    pub fn with_teardown(mut self, teardown: bool) -> Self {
        self.teardown = teardown;
        self
    }

    /// Deploys `spec`, pointing its AWS provider at `emulator` when given.
    ///
    /// A failed `up` is not retried. The returned guard destroys the stack
    /// and removes it from the backend when dropped.
    pub fn deploy(&self, spec: &DeploySpec, emulator: Option<&EmulatorTarget>) -> Result<Deployment> {
        let stack = spec.stack_ref();
        let fail = |operation| {
            let name = stack.fully_qualified();
            move |source| DeploymentError::new(name, operation, source)
        };

        info!(stack = %stack, dir = %stack.work_dir.display(), "selecting stack");
        self.automation
            .select_or_create_stack(&stack)
            .map_err(fail(StackOperation::Select))?;

        // From here on the stack exists, so the guard owns its cleanup.
        let mut deployment = Deployment {
            automation: Arc::clone(&self.automation),
            handle: DeploymentHandle {
                stack: stack.clone(),
                outputs: StackOutputs::new(),
                targets_emulator: emulator.is_some(),
            },
            teardown: self.teardown,
            released: false,
        };

        if spec.pre_clean {
            if let Err(e) = self.automation.destroy(&stack) {
                debug!(stack = %stack, "pre-clean destroy skipped: {e:#}");
            }
        }

        let mut config = emulator.map(EmulatorTarget::provider_config).unwrap_or_default();
        config.extend(spec.config.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !config.is_empty() {
            debug!(stack = %stack, keys = config.len(), "setting stack config");
            self.automation
                .set_all_config(&stack, &config)
                .map_err(fail(StackOperation::Configure))?;
        }

        if spec.refresh {
            if let Err(e) = self.automation.refresh(&stack) {
                debug!(stack = %stack, "refresh skipped: {e:#}");
            }
        }

        info!(stack = %stack, emulator = emulator.is_some(), "deploying stack");
        deployment.handle.outputs = self
            .automation
            .up(&stack)
            .map_err(fail(StackOperation::Up))?;

        info!(stack = %stack, outputs = deployment.handle.outputs.len(), "stack deployed");
        Ok(deployment)
    }
}

/// A deployed stack. Dropping it destroys the stack and removes it from
/// the backend unless teardown is disabled.
#[derive(Debug)]
pub struct Deployment {
    automation: Arc<dyn AutomationApi>,
    handle: DeploymentHandle,
    teardown: bool,
    released: bool,
}

impl Deployment {
    pub fn handle(&self) -> &DeploymentHandle {
        &self.handle
    }

    pub fn stack(&self) -> &StackRef {
        &self.handle.stack
    }

    pub fn outputs(&self) -> &StackOutputs {
        &self.handle.outputs
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.handle.outputs.get(key).map(String::as_str)
    }

    /// Destroys now and returns the failure instead of logging it.
    pub fn destroy(mut self) -> std::result::Result<(), DeploymentError> {
        self.release()
    }

    fn release(&mut self) -> std::result::Result<(), DeploymentError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let stack = &self.handle.stack;
        if !self.teardown {
            info!(stack = %stack, dir = %stack.work_dir.display(), "teardown disabled, leaving stack deployed");
            return Ok(());
        }

        info!(stack = %stack, "destroying stack");
        self.automation
            .destroy(stack)
            .map_err(|e| DeploymentError::new(stack.fully_qualified(), StackOperation::Destroy, e))?;
        // Only forget the stack once its resources are gone, or its state is lost.
        self.automation
            .remove_stack(stack)
            .map_err(|e| DeploymentError::new(stack.fully_qualified(), StackOperation::Remove, e))?;
        debug!(stack = %stack, "stack removed");
        Ok(())
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(stack = %e.stack, operation = %e.operation, "stack teardown failed: {}", e.diagnostics);
        }
    }
}
