//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DeployerError, Result};
use crate::funding::{CurveParams, PhaseSchedule, USTX_PER_STX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl Network {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "devnet" => Ok(Self::Devnet),
            other => Err(DeployerError::Config(format!("Unknown NETWORK: {other}"))),
        }
    }

    pub fn default_api_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "https://api.hiro.so",
            Self::Testnet => "https://api.testnet.hiro.so",
            Self::Devnet => "http://localhost:3999",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Devnet => "devnet",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    /// Stacks API endpoint (defaults to the Hiro endpoint for `network`)
    pub api_url: String,
    /// Optional Hiro API key sent as `x-api-key`
    pub api_key: Option<String>,
    /// Address of the account that signs and pays for every deployment
    pub deployer_address: String,
    /// Opaque key reference handed to the signer; never a raw key
    pub deployer_key_ref: String,
    /// Program (plus arguments) that signs transactions
    pub signer_command: Vec<String>,
    /// Optional program (plus arguments) that checks a contract before deployment
    pub compiler_command: Option<Vec<String>>,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Explicit contract manifest (Clarinet.toml layout)
    pub contracts_manifest: PathBuf,
    /// Directory scanned for `.clar` files missing from the manifest
    pub contracts_dir: PathBuf,
    /// Maximum contracts per batch
    pub batch_size: usize,
    /// Submit the contracts of a batch concurrently
    pub parallel: bool,
    /// Plan only; never touch the chain
    pub dry_run: bool,
    /// Keep running and deploy newly unlocked phases as funding arrives
    pub follow: bool,
    /// Check every contract against the chain after a run
    pub verify_deployment: bool,
    /// How often (in seconds) to poll a pending transaction
    pub poll_interval_secs: u64,
    /// How long (in seconds) to wait for confirmation before reporting Unconfirmed
    pub confirmation_timeout_secs: u64,
    /// Broadcast attempts per contract for transient failures
    pub max_submit_attempts: u32,
    /// Fee attached to each deployment, in micro-STX
    pub deploy_fee_ustx: u64,
    /// Funding-curve base price, in micro-STX
    pub base_price_ustx: u64,
    /// Cumulative funding thresholds, in micro-STX
    pub phase_schedule: PhaseSchedule,
    /// Where to write the JSON deployment manifest after a run, if anywhere
    pub manifest_export_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let network = Network::parse(&env_var("NETWORK").unwrap_or_else(|_| "testnet".to_string()))?;

        Ok(Config {
            network,
            api_url: env_var("STACKS_API_URL")
                .unwrap_or_else(|_| network.default_api_url().to_string()),
            api_key: env_var("HIRO_API_KEY").ok(),
            deployer_address: env_var("DEPLOYER_ADDRESS").map_err(|_| {
                DeployerError::Config("DEPLOYER_ADDRESS environment variable is required".to_string())
            })?,
            deployer_key_ref: env_var("DEPLOYER_KEY_REF").map_err(|_| {
                DeployerError::Config("DEPLOYER_KEY_REF environment variable is required".to_string())
            })?,
            signer_command: split_command(
                &env_var("SIGNER_COMMAND").unwrap_or_else(|_| "stacks-sign".to_string()),
            )?,
            compiler_command: env_var("COMPILER_COMMAND")
                .ok()
                .map(|c| split_command(&c))
                .transpose()?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./deployments.db".to_string()),
            api_port: parse_var("API_PORT", "3001")?,
            contracts_manifest: env_var("CONTRACTS_MANIFEST")
                .unwrap_or_else(|_| "Clarinet.toml".to_string())
                .into(),
            contracts_dir: env_var("CONTRACTS_DIR")
                .unwrap_or_else(|_| "contracts".to_string())
                .into(),
            batch_size: parse_var("BATCH_SIZE", "5")?,
            parallel: parse_bool("PARALLEL", false)?,
            dry_run: parse_bool("DRY_RUN", false)?,
            follow: parse_bool("FOLLOW", false)?,
            verify_deployment: parse_bool("VERIFY_DEPLOYMENT", true)?,
            poll_interval_secs: parse_var("POLL_INTERVAL_SECS", "10")?,
            confirmation_timeout_secs: parse_var("CONFIRMATION_TIMEOUT_SECS", "300")?,
            max_submit_attempts: parse_var("MAX_SUBMIT_ATTEMPTS", "3")?,
            deploy_fee_ustx: parse_var("DEPLOY_FEE_USTX", "500000")?,
            base_price_ustx: parse_var("BASE_PRICE_USTX", "1000000")?,
            phase_schedule: parse_thresholds(
                &env_var("PHASE_THRESHOLDS_STX").unwrap_or_else(|_| "10000,25000,50000,100000".to_string()),
            )?,
            manifest_export_path: env_var("MANIFEST_EXPORT_PATH").ok().map(PathBuf::from),
        }
        .validated()?)
    }

    fn validated(self) -> Result<Self> {
        if self.batch_size == 0 {
            return Err(DeployerError::Config("BATCH_SIZE must be at least 1".to_string()));
        }
        if self.max_submit_attempts == 0 {
            return Err(DeployerError::Config(
                "MAX_SUBMIT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(DeployerError::Config(
                "POLL_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// Curve target is the last gated threshold.
    pub fn curve_params(&self) -> CurveParams {
        CurveParams::new(self.base_price_ustx, self.phase_schedule.final_threshold())
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| DeployerError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| DeployerError::Config(format!("Invalid {key}")))
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match env_var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        _ => Err(DeployerError::Config(format!("Invalid {key}"))),
    }
}

fn split_command(raw: &str) -> Result<Vec<String>> {
    let parts: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err(DeployerError::Config("Empty command".to_string()));
    }
    Ok(parts)
}

/// Parse four comma-separated STX amounts into a [`PhaseSchedule`].
pub fn parse_thresholds(raw: &str) -> Result<PhaseSchedule> {
    let values = raw
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .ok()
                .and_then(|stx| stx.checked_mul(USTX_PER_STX))
                .ok_or_else(|| DeployerError::Config(format!("Invalid phase threshold: {v}")))
        })
        .collect::<Result<Vec<u64>>>()?;

    let thresholds: [u64; 4] = values.try_into().map_err(|v: Vec<u64>| {
        DeployerError::Config(format!("PHASE_THRESHOLDS_STX needs 4 values, got {}", v.len()))
    })?;
    PhaseSchedule::new(thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::Phase;

    #[test]
    fn thresholds_parse_in_stx() {
        let schedule = parse_thresholds("100, 500, 1000, 2500").unwrap();
        assert_eq!(schedule.threshold(Phase::Bootstrap), Some(100 * USTX_PER_STX));
        assert_eq!(schedule.final_threshold(), 2_500 * USTX_PER_STX);
        assert!(parse_thresholds("1,2,3").is_err());
        assert!(parse_thresholds("1,2,x,4").is_err());
        assert!(parse_thresholds("4,3,2,1").is_err());
    }

    #[test]
    fn unset_flag_uses_default() {
        let key = "DEPLOYER_TEST_FLAG_NEVER_SET";
        assert!(parse_bool(key, true).unwrap());
        assert!(!parse_bool(key, false).unwrap());
    }

    #[test]
    fn network_presets() {
        assert_eq!(Network::parse("MAINNET").unwrap(), Network::Mainnet);
        assert_eq!(Network::Testnet.default_api_url(), "https://api.testnet.hiro.so");
        assert!(Network::parse("regtest").is_err());
    }

    #[test]
    fn commands_split_on_whitespace() {
        assert_eq!(
            split_command("node sign.js --network testnet").unwrap(),
            vec!["node", "sign.js", "--network", "testnet"]
        );
        assert!(split_command("   ").is_err());
    }
}
