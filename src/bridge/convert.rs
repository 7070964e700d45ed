//! Media conversion through an external program.

use super::{BridgeError, MediaConverter};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Runs `<program> -y -i <source> <dest>`; the program picks the output
/// container from the destination extension.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MediaConverter for CommandConverter {
    async fn convert(&self, source: &Path, dest: &Path) -> Result<(), BridgeError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(source)
            .arg(dest)
            .output()
            .await
            .map_err(|e| BridgeError::Unavailable(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(code = ?output.status.code(), "conversion command failed");
            // Leave no half-written output behind; the next read retries.
            let _ = tokio::fs::remove_file(dest).await;
            return Err(BridgeError::Action(
                stderr.lines().last().unwrap_or("conversion failed").to_string(),
            ));
        }
        Ok(())
    }
}
