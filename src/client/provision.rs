//! Out-of-band model provisioning.
//!
//! When the backend reports a missing model, the client asks a
//! [`Provisioner`] to fetch it and then retries the original request once.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{HuginnError, Result};

/// Makes a model available on the backend.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision `model`. Any error means the model is still unavailable.
    async fn provision(&self, model: &str) -> Result<()>;
}

/// Runs an external command with the model name appended, e.g.
/// `ollama pull llama3.1`. Success is a zero exit status.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    program: String,
    args: Vec<String>,
}

impl CommandProvisioner {
    /// Build from a full command line such as `["ollama", "pull"]`.
    ///
    /// Fails on an empty command.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            HuginnError::Configuration("provision command must not be empty".into())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, model: &str) -> Result<()> {
        info!(program = %self.program, model, "provisioning model");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(model)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HuginnError::ProvisionFailed {
                model: model.to_string(),
                reason: format!("failed to run {}: {e}", self.program),
            })?;

        if output.status.success() {
            debug!(model, "provisioning command succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HuginnError::ProvisionFailed {
                model: model.to_string(),
                reason: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            })
        }
    }
}
