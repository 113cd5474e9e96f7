//! Stacks chain RPC boundary and its Hiro API implementation.
//!
//! ## Resilience
//!
//! * Read calls (`/extended/v1/tx`, `/v2/accounts`, `/v2/info`, ...) apply
//!   exponential back-off on rate limits and connection errors, up to
//!   [`MAX_READ_ATTEMPTS`] tries.
//! * Broadcasts are single-shot.  A network failure is returned as
//!   [`DeployerError::Submission`] and the submitter decides whether to retry;
//!   a node refusal is [`DeployerError::Rejected`] and is never retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{DeployerError, Result};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_READ_ATTEMPTS: u32 = 4;

/// Chain-reported state of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    /// In the mempool, not yet known, or only in an unanchored microblock.
    Pending,
    /// Included in an anchored block on the canonical fork.
    Confirmed,
    /// Aborted on chain or definitively dropped from the mempool.
    Rejected { reason: String },
}

/// Operations the orchestrator needs from a Stacks node / API.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Broadcast a signed transaction, returning its id.
    async fn broadcast_transaction(&self, signed_tx: &[u8]) -> Result<String>;

    async fn get_transaction_status(&self, tx_id: &str) -> Result<TxStatus>;

    /// Next nonce the account can use, counting its transactions that are
    /// still in the mempool.
    async fn get_account_nonce(&self, address: &str) -> Result<u64>;

    /// Spendable balance in micro-STX.
    async fn get_account_balance(&self, address: &str) -> Result<u64>;

    /// Whether `<address>.<name>` is already deployed.
    async fn contract_exists(&self, address: &str, name: &str) -> Result<bool>;

    /// Current chain tip height, when the backend exposes one.
    async fn get_chain_tip(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

// ─────────────────────────────────────────────────────────
// Hiro API response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BroadcastRejection {
    pub error: Option<String>,
    pub reason: Option<String>,
    pub txid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TxInfo {
    pub tx_id: Option<String>,
    pub tx_status: String,
    pub block_height: Option<u64>,
    pub is_unanchored: Option<bool>,
    pub canonical: Option<bool>,
    pub tx_result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    /// Hex-encoded (`0x…`) micro-STX.
    pub balance: String,
    pub nonce: u64,
}

/// `/extended/v1/address/{addr}/nonces`
#[derive(Debug, Deserialize)]
pub struct AddressNonces {
    pub possible_next_nonce: u64,
    pub last_executed_tx_nonce: Option<u64>,
    pub last_mempool_tx_nonce: Option<u64>,
    #[serde(default)]
    pub detected_missing_nonces: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct NodeInfo {
    pub stacks_tip_height: Option<u64>,
    pub network_id: Option<u64>,
}

// ─────────────────────────────────────────────────────────
// Hiro client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HiroClient {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl HiroClient {
    pub fn new(client: Client, api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn with_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    /// GET a JSON document.  `Ok(None)` means the API answered 404.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{path}", self.api_url);
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 1;

        loop {
            let response = self.with_key(self.client.get(&url)).send().await;

            let retry_reason = match response {
                Err(e) if attempt < MAX_READ_ATTEMPTS => format!("request failed: {e}"),
                Err(e) => return Err(DeployerError::Http(e)),
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(resp)
                    if (resp.status() == StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error())
                        && attempt < MAX_READ_ATTEMPTS =>
                {
                    format!("HTTP {}", resp.status())
                }
                Ok(resp) if !resp.status().is_success() => {
                    return Err(DeployerError::Rpc(format!(
                        "GET {path} returned HTTP {}",
                        resp.status()
                    )))
                }
                Ok(resp) => return Ok(Some(resp.json().await?)),
            };

            warn!("GET {path} {retry_reason} (will retry in {backoff}s)");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            attempt += 1;
        }
    }

    async fn account(&self, address: &str) -> Result<AccountInfo> {
        self.get_json(&format!("/v2/accounts/{address}?proof=0"))
            .await?
            .ok_or_else(|| DeployerError::Rpc(format!("account {address} not found")))
    }
}

#[async_trait]
impl ChainRpc for HiroClient {
    async fn broadcast_transaction(&self, signed_tx: &[u8]) -> Result<String> {
        let url = format!("{}/v2/transactions", self.api_url);
        let response = self
            .with_key(self.client.post(&url))
            .header("content-type", "application/octet-stream")
            .body(signed_tx.to_vec())
            .send()
            .await
            .map_err(|e| DeployerError::Submission(format!("broadcast failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let tx_id: String = response.json().await?;
            debug!("Broadcast accepted: {tx_id}");
            return Ok(normalize_tx_id(&tx_id));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(DeployerError::Submission(format!(
                "broadcast returned HTTP {status}"
            )));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_rejection(status, &body))
    }

    async fn get_transaction_status(&self, tx_id: &str) -> Result<TxStatus> {
        let info: Option<TxInfo> = self
            .get_json(&format!("/extended/v1/tx/{}", normalize_tx_id(tx_id)))
            .await?;
        Ok(match info {
            // Freshly broadcast transactions can take a moment to be indexed.
            None => TxStatus::Pending,
            Some(info) => tx_status_from_info(&info),
        })
    }

    async fn get_account_nonce(&self, address: &str) -> Result<u64> {
        let nonces: Option<AddressNonces> = self
            .get_json(&format!("/extended/v1/address/{address}/nonces"))
            .await?;
        match nonces {
            Some(nonces) => {
                if !nonces.detected_missing_nonces.is_empty() {
                    warn!(
                        "Account {address} has gaps at nonces {:?}",
                        nonces.detected_missing_nonces
                    );
                }
                Ok(nonces.possible_next_nonce)
            }
            // Plain nodes without the extended API only know the mined nonce.
            None => Ok(self.account(address).await?.nonce),
        }
    }

    async fn get_account_balance(&self, address: &str) -> Result<u64> {
        let info = self.account(address).await?;
        parse_hex_balance(&info.balance)
    }

    async fn contract_exists(&self, address: &str, name: &str) -> Result<bool> {
        let interface: Option<serde_json::Value> = self
            .get_json(&format!("/v2/contracts/interface/{address}/{name}"))
            .await?;
        Ok(interface.is_some())
    }

    async fn get_chain_tip(&self) -> Result<Option<u64>> {
        let info: Option<NodeInfo> = self.get_json("/v2/info").await?;
        Ok(info.and_then(|i| i.stacks_tip_height))
    }
}

// ─────────────────────────────────────────────────────────
// Decoding helpers
// ─────────────────────────────────────────────────────────

/// Transaction ids are compared in `0x`-prefixed lower-case form.
pub fn normalize_tx_id(tx_id: &str) -> String {
    let trimmed = tx_id.trim().trim_matches('"');
    let bare = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    format!("0x{}", bare.to_ascii_lowercase())
}

/// Map the Hiro `tx_status` vocabulary onto [`TxStatus`].  Only an anchored,
/// canonical success counts as final.
pub fn tx_status_from_info(info: &TxInfo) -> TxStatus {
    match info.tx_status.as_str() {
        "success" => {
            let anchored = !info.is_unanchored.unwrap_or(false) && info.block_height.is_some();
            if anchored && info.canonical.unwrap_or(true) {
                TxStatus::Confirmed
            } else {
                TxStatus::Pending
            }
        }
        "pending" => TxStatus::Pending,
        other if other.starts_with("abort") || other.starts_with("dropped") => {
            let detail = info
                .tx_result
                .as_ref()
                .and_then(|r| r.get("repr"))
                .and_then(|r| r.as_str())
                .map(|r| format!("{other}: {r}"))
                .unwrap_or_else(|| other.to_string());
            TxStatus::Rejected { reason: detail }
        }
        other => {
            warn!("Unknown tx_status '{other}', treating as pending");
            TxStatus::Pending
        }
    }
}

/// A non-transient broadcast failure becomes a [`DeployerError::Rejected`]
/// carrying the node's reason (`NotEnoughFunds`, `BadNonce`, …).
pub fn classify_rejection(status: StatusCode, body: &str) -> DeployerError {
    let reason = serde_json::from_str::<BroadcastRejection>(body)
        .ok()
        .and_then(|r| r.reason.or(r.error))
        .unwrap_or_else(|| format!("HTTP {status}: {}", body.trim()));
    DeployerError::Rejected { reason }
}

pub fn parse_hex_balance(raw: &str) -> Result<u64> {
    let digits = raw.trim().trim_start_matches("0x");
    let value = u128::from_str_radix(digits, 16)
        .map_err(|e| DeployerError::Rpc(format!("invalid balance '{raw}': {e}")))?;
    u64::try_from(value).map_err(|_| DeployerError::Rpc(format!("balance out of range: {raw}")))
}

/// Whether a rejection reason means our cached nonce is wrong.
pub fn is_nonce_rejection(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    lower.contains("nonce")
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
