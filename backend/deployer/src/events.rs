//! Deployment event feed.
//!
//! Every contract status change the orchestrator reports is appended to the
//! `deployment_events` table and fanned out on an in-process broadcast
//! channel.  Publishing never waits on subscribers: a lagging or absent
//! subscriber simply misses live events and can re-read the table.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::contract::Category;
use crate::db;

const FEED_CAPACITY: usize = 1024;

/// Status values carried by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Category not unlocked by the current phase, or a prerequisite is.
    Withheld,
    /// Transaction broadcast, awaiting confirmation.
    Pending,
    Confirmed,
    Failed,
    /// Confirmation not observed within the timeout.
    Unconfirmed,
    /// A prerequisite failed or is unconfirmed in this run.
    Blocked,
}

impl EventStatus {
    /// Short identifier suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Withheld => "withheld",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Unconfirmed => "unconfirmed",
            Self::Blocked => "blocked",
        }
    }
}

/// A feed entry ready to be stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub contract: String,
    pub category: Category,
    pub status: EventStatus,
    pub tx_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: i64,
}

impl DeploymentEvent {
    pub fn new(contract: impl Into<String>, category: Category, status: EventStatus) -> Self {
        Self {
            contract: contract.into(),
            category,
            status,
            tx_id: None,
            detail: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_tx(mut self, tx_id: Option<&str>) -> Self {
        self.tx_id = tx_id.map(str::to_string);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A feed entry as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub contract: String,
    pub category: String,
    pub status: String,
    pub tx_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct EventFeed {
    pool: SqlitePool,
    tx: broadcast::Sender<DeploymentEvent>,
}

impl EventFeed {
    pub fn new(pool: SqlitePool) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { pool, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }

    pub async fn publish(&self, event: DeploymentEvent) {
        if let Err(e) = db::insert_event(&self.pool, &event).await {
            error!("Failed to persist event for {}: {e}", event.contract);
        }
        debug!(
            "Event {} {} tx={:?}",
            event.contract,
            event.status.as_str(),
            event.tx_id
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
