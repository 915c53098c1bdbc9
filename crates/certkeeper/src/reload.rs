//! Reloading the service that consumes the certificate.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::IssueError;

/// Makes a service pick up newly installed certificate files
#[async_trait]
pub trait ServiceReloader: Send + Sync {
    async fn reload(&self, service: &str) -> Result<(), IssueError>;
}

/// `systemctl reload-or-restart <service>`
#[derive(Debug, Clone)]
pub struct SystemctlReloader {
    program: String,
}

impl SystemctlReloader {
    pub fn new() -> Self {
        Self::with_program("systemctl")
    }

    /// Use another binary with the same command line
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemctlReloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceReloader for SystemctlReloader {
    async fn reload(&self, service: &str) -> Result<(), IssueError> {
        debug!(program = %self.program, service = %service, "Reloading service");
        let output = tokio::process::Command::new(&self.program)
            .args(["reload-or-restart", service])
            .output()
            .await
            .map_err(|e| IssueError::io(format!("running {}", self.program), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IssueError::io(
                format!("reloading {}", service),
                std::io::Error::other(format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )),
            ));
        }

        info!(service = %service, "Service reloaded");
        Ok(())
    }
}
