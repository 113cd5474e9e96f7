//! Confirmation tracking.
//!
//! Polls the chain for a broadcast transaction at a fixed interval until it
//! is anchored, rejected, or the timeout passes.  The monitor only reads;
//! it never re-broadcasts a transaction.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainRpc, TxStatus};
use crate::contract::TerminalStatus;
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    Confirmed,
    Rejected { reason: String },
    /// No final status observed within the timeout, or the run was aborted
    /// while waiting.
    TimedOut,
}

impl Confirmation {
    pub fn terminal_status(&self) -> TerminalStatus {
        match self {
            Self::Confirmed => TerminalStatus::Confirmed,
            Self::Rejected { .. } => TerminalStatus::Rejected,
            Self::TimedOut => TerminalStatus::TimedOut,
        }
    }
}

#[derive(Clone)]
pub struct Monitor {
    chain: Arc<dyn ChainRpc>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Monitor {
    pub fn new(chain: Arc<dyn ChainRpc>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            chain,
            poll_interval,
            timeout,
        }
    }

    /// One status query, used when reconciling transactions from earlier runs.
    pub async fn check_once(&self, tx_id: &str) -> Result<TxStatus> {
        self.chain.get_transaction_status(tx_id).await
    }

    /// Wait for `tx_id` to reach a final status.  Query errors are logged and
    /// polling continues; only the timeout ends the wait without a result.
    pub async fn await_confirmation(&self, tx_id: &str, cancel: &CancellationToken) -> Confirmation {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.chain.get_transaction_status(tx_id).await {
                Ok(TxStatus::Confirmed) => {
                    info!("Transaction {tx_id} confirmed");
                    return Confirmation::Confirmed;
                }
                Ok(TxStatus::Rejected { reason }) => {
                    warn!("Transaction {tx_id} rejected: {reason}");
                    return Confirmation::Rejected { reason };
                }
                Ok(TxStatus::Pending) => debug!("Transaction {tx_id} still pending"),
                Err(e) => warn!("Status query for {tx_id} failed: {e}"),
            }

            if Instant::now() >= deadline {
                warn!("Transaction {tx_id} unconfirmed after {:?}", self.timeout);
                return Confirmation::TimedOut;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    info!("Stopped watching {tx_id}; it will be reconciled on the next run");
                    return Confirmation::TimedOut;
                }
            }
        }
    }
}
