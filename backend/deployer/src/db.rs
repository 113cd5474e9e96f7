//! Database layer — migrations, the deployment manifest, the transaction
//! log, the event feed table, and funding state.

use std::str::FromStr;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::contract::{Category, ContractStatus, TerminalStatus, TransactionRecord};
use crate::errors::{DeployerError, Result};
use crate::events::{DeploymentEvent, EventRecord};
use crate::funding::{Contribution, FundingState, Phase};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Every connection to `:memory:` is a separate database.
    let in_memory = url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| DeployerError::Validation(format!("{what} out of range")))
}

fn to_u64(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| DeployerError::Validation(format!("stored {what} is negative")))
}

// ─────────────────────────────────────────────────────────
// Deployment manifest
// ─────────────────────────────────────────────────────────

/// One row of the persisted deployment manifest.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ManifestRecord {
    pub name: String,
    pub category: String,
    pub status: String,
    pub tx_id: Option<String>,
    /// Phase that was current when the contract was last submitted.
    pub phase: Option<String>,
    pub updated_at: i64,
}

impl ManifestRecord {
    pub fn contract_status(&self) -> Option<ContractStatus> {
        ContractStatus::parse(&self.status)
    }
}

/// Write the manifest row for a contract after a status transition.
pub async fn save_contract_status(
    pool: &SqlitePool,
    name: &str,
    category: Category,
    status: ContractStatus,
    tx_id: Option<&str>,
    phase: Option<Phase>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO contracts (name, category, status, tx_id, phase, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(name) DO UPDATE SET
            category   = excluded.category,
            status     = excluded.status,
            tx_id      = COALESCE(excluded.tx_id, contracts.tx_id),
            phase      = COALESCE(excluded.phase, contracts.phase),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(name)
    .bind(category.as_str())
    .bind(status.as_str())
    .bind(tx_id)
    .bind(phase.map(|p| p.as_str()))
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_manifest(pool: &SqlitePool) -> Result<Vec<ManifestRecord>> {
    let rows = sqlx::query_as::<_, ManifestRecord>(
        r#"
        SELECT name, category, status, tx_id, phase, updated_at
        FROM   contracts
        ORDER  BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Transaction log
// ─────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    contract: String,
    tx_id: String,
    nonce: i64,
    submitted_at: i64,
    terminal_status: Option<String>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = DeployerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(TransactionRecord {
            contract: row.contract,
            tx_id: row.tx_id,
            nonce: to_u64(row.nonce, "nonce")?,
            submitted_at: row.submitted_at,
            terminal_status: row.terminal_status.as_deref().and_then(TerminalStatus::parse),
        })
    }
}

/// Append a broadcast transaction.  A tx id is never recorded twice.
pub async fn insert_transaction(pool: &SqlitePool, record: &TransactionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (contract, tx_id, nonce, submitted_at, terminal_status)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&record.contract)
    .bind(&record.tx_id)
    .bind(to_i64(record.nonce, "nonce")?)
    .bind(record.submitted_at)
    .bind(record.terminal_status.map(|s| s.as_str()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the terminal status of a transaction.  A confirmed or rejected
/// outcome is final and is not overwritten.
pub async fn set_terminal_status(
    pool: &SqlitePool,
    tx_id: &str,
    status: TerminalStatus,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET    terminal_status = ?2
        WHERE  tx_id = ?1
          AND  (terminal_status IS NULL OR terminal_status = 'timed_out')
        "#,
    )
    .bind(tx_id)
    .bind(status.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn transactions_for_contract(
    pool: &SqlitePool,
    contract: &str,
) -> Result<Vec<TransactionRecord>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT contract, tx_id, nonce, submitted_at, terminal_status
        FROM   transactions
        WHERE  contract = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(contract)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(TransactionRecord::try_from).collect()
}

pub async fn all_transactions(pool: &SqlitePool) -> Result<Vec<TransactionRecord>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT contract, tx_id, nonce, submitted_at, terminal_status
        FROM   transactions
        ORDER  BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(TransactionRecord::try_from).collect()
}

/// Highest nonce among logged transactions that may still be in the mempool
/// (no terminal status, or timed out while waiting).
pub async fn highest_unsettled_nonce(pool: &SqlitePool) -> Result<Option<u64>> {
    let row: (Option<i64>,) = sqlx::query_as(
        r#"
        SELECT MAX(nonce)
        FROM   transactions
        WHERE  terminal_status IS NULL OR terminal_status = 'timed_out'
        "#,
    )
    .fetch_one(pool)
    .await?;
    row.0.map(|n| to_u64(n, "nonce")).transpose()
}

// ─────────────────────────────────────────────────────────
// Event feed
// ─────────────────────────────────────────────────────────

pub async fn insert_event(pool: &SqlitePool, event: &DeploymentEvent) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO deployment_events (contract, category, status, tx_id, detail, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&event.contract)
    .bind(event.category.as_str())
    .bind(event.status.as_str())
    .bind(&event.tx_id)
    .bind(&event.detail)
    .bind(event.timestamp)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Fetch the feed for one contract, oldest first.
pub async fn get_events_for_contract(
    pool: &SqlitePool,
    contract: &str,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, contract, category, status, tx_id, detail, timestamp
        FROM   deployment_events
        WHERE  contract = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(contract)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch the whole feed, or only entries after `after_id`, oldest first.
pub async fn get_events_after(pool: &SqlitePool, after_id: i64) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, contract, category, status, tx_id, detail, timestamp
        FROM   deployment_events
        WHERE  id > ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(after_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_all_events(pool: &SqlitePool) -> Result<Vec<EventRecord>> {
    get_events_after(pool, 0).await
}

// ─────────────────────────────────────────────────────────
// Funding
// ─────────────────────────────────────────────────────────

/// Persisted `(cumulative, phase)`.
pub async fn load_funding(pool: &SqlitePool) -> Result<(u64, Phase)> {
    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT cumulative, phase FROM funding_state WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    match row {
        None => Ok((0, Phase::Bootstrap)),
        Some((cumulative, phase)) => {
            let phase = Phase::parse(&phase).ok_or_else(|| {
                DeployerError::Validation(format!("stored phase '{phase}' is unknown"))
            })?;
            Ok((to_u64(cumulative, "cumulative funding")?, phase))
        }
    }
}

pub async fn contribution_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT tx_id FROM contributions")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Record a contribution and the funding state it produced atomically.
/// A duplicate tx id fails the whole write.
pub async fn save_contribution(
    pool: &SqlitePool,
    contribution: &Contribution,
    state: &FundingState,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO contributions (tx_id, contributor, amount, timestamp, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&contribution.tx_id)
    .bind(&contribution.contributor)
    .bind(to_i64(contribution.amount, "amount")?)
    .bind(contribution.timestamp)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE funding_state SET cumulative = ?1, phase = ?2 WHERE id = 1")
        .bind(to_i64(state.cumulative, "cumulative funding")?)
        .bind(state.phase.as_str())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
