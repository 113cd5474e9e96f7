//! Compiler/toolchain boundary.
//!
//! Contract checking is delegated to an external program (for example
//! `clarinet check`).  The artifact hash is the SHA-256 of the source that
//! passed the check, so a later source edit produces a different hash.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::debug;

use crate::contract::Contract;
use crate::errors::{DeployerError, Result};

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Check `source` and return its artifact hash.
    async fn compile(&self, contract: &Contract, source: &str) -> Result<String>;
}

pub fn artifact_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Runs an optional check command with the contract path appended, then
/// hashes the source.  Without a command it only hashes.
#[derive(Debug, Clone, Default)]
pub struct CommandCompiler {
    command: Option<Vec<String>>,
}

impl CommandCompiler {
    pub fn new(command: Option<Vec<String>>) -> Self {
        Self {
            command: command.filter(|c| !c.is_empty()),
        }
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(&self, contract: &Contract, source: &str) -> Result<String> {
        if source.trim().is_empty() {
            return Err(DeployerError::Compile {
                contract: contract.name.clone(),
                message: "source is empty".to_string(),
            });
        }

        if let Some((program, args)) = self.command.as_ref().and_then(|c| c.split_first()) {
            let output = Command::new(program)
                .args(args)
                .arg(&contract.source)
                .output()
                .await
                .map_err(|e| DeployerError::Compile {
                    contract: contract.name.clone(),
                    message: format!("could not run {program}: {e}"),
                })?;
            if !output.status.success() {
                return Err(DeployerError::Compile {
                    contract: contract.name.clone(),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }

        let hash = artifact_hash(source);
        debug!("Checked {} -> {hash}", contract.name);
        Ok(hash)
    }
}
