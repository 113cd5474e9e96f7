//! Transaction signing boundary.
//!
//! Keys never enter this process.  The deployer builds an
//! [`UnsignedTransaction`], and an external program turns it into raw
//! signed bytes given an opaque key reference.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::Network;
use crate::errors::{DeployerError, Result};

/// A smart-contract deploy transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub contract_name: String,
    pub code_body: String,
    pub sender: String,
    pub nonce: u64,
    /// Micro-STX.
    pub fee: u64,
    pub network: Network,
    /// SHA-256 of the checked source, as reported by the compiler.
    pub artifact_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
}

#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, tx: &UnsignedTransaction, key_ref: &str) -> Result<SignedTransaction>;
}

/// Runs `program args…`, writes `{"tx": …, "key_ref": …}` to its stdin and
/// expects the hex-encoded signed transaction on stdout.
#[derive(Debug, Clone)]
pub struct CommandSigner {
    command: Vec<String>,
}

impl CommandSigner {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(DeployerError::Config("signer command is empty".to_string()));
        }
        Ok(Self { command })
    }
}

#[async_trait]
impl Signer for CommandSigner {
    async fn sign(&self, tx: &UnsignedTransaction, key_ref: &str) -> Result<SignedTransaction> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| DeployerError::Config("signer command is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployerError::Submission(format!("signer unavailable: {e}")))?;

        let request = serde_json::to_vec(&json!({ "tx": tx, "key_ref": key_ref }))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request)
                .await
                .map_err(|e| DeployerError::Submission(format!("signer stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DeployerError::Submission(format!("signer failed: {e}")))?;

        if !output.status.success() {
            return Err(DeployerError::Submission(format!(
                "signer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let raw = decode_signed_hex(&String::from_utf8_lossy(&output.stdout))?;
        debug!("Signed {} ({} bytes)", tx.contract_name, raw.len());
        Ok(SignedTransaction { raw })
    }
}

fn decode_signed_hex(stdout: &str) -> Result<Vec<u8>> {
    let trimmed = stdout.trim();
    let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if hex_str.is_empty() {
        return Err(DeployerError::Submission(
            "signer produced no output".to_string(),
        ));
    }
    hex::decode(hex_str)
        .map_err(|e| DeployerError::Submission(format!("signer output is not hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_hex_decodes() {
        assert_eq!(decode_signed_hex("0x0a0b\n").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(decode_signed_hex("ff").unwrap(), vec![0xff]);
        assert!(decode_signed_hex("").is_err());
        assert!(decode_signed_hex("not-hex").is_err());
    }

    #[test]
    fn empty_command_rejected() {
        assert!(CommandSigner::new(Vec::new()).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_signer_round_trip() {
        // `sh -c` ignores stdin and prints a fixed signature.
        let signer = CommandSigner::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo 0xdeadbeef".to_string(),
        ])
        .unwrap();
        let tx = UnsignedTransaction {
            contract_name: "all-traits".to_string(),
            code_body: "(define-trait t ())".to_string(),
            sender: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            nonce: 7,
            fee: 500_000,
            network: Network::Testnet,
            artifact_hash: "00".to_string(),
        };
        let signed = signer.sign(&tx, "keyring:deployer").await.unwrap();
        assert_eq!(signed.raw, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_signer_is_a_submission_error() {
        let signer = CommandSigner::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo locked >&2; exit 3".to_string(),
        ])
        .unwrap();
        let tx = UnsignedTransaction {
            contract_name: "x".to_string(),
            code_body: String::new(),
            sender: "ST1".to_string(),
            nonce: 0,
            fee: 0,
            network: Network::Devnet,
            artifact_hash: String::new(),
        };
        let err = signer.sign(&tx, "k").await.unwrap_err();
        assert!(matches!(err, DeployerError::Submission(msg) if msg.contains("locked")));
    }
}
