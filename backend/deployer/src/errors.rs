//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Manifest parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad manifest or a dependency naming an unknown contract. Aborts planning.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The dependency graph has a cycle through the listed contracts. Aborts planning.
    #[error("Cyclic dependency between: {}", .contracts.join(", "))]
    CyclicDependency { contracts: Vec<String> },

    /// Transient failure (network unreachable, signer unavailable). Retried.
    #[error("Submission error: {0}")]
    Submission(String),

    /// The chain refused the transaction. Never retried automatically.
    #[error("Transaction rejected: {reason}")]
    Rejected { reason: String },

    #[error("Confirmation timed out for tx {tx_id}")]
    Timeout { tx_id: String },

    #[error("Invalid contribution: {0}")]
    FundingValidation(String),

    #[error("Compile error for {contract}: {message}")]
    Compile { contract: String, message: String },

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl DeployerError {
    /// Whether the submitter may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Submission(_) | Self::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, DeployerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_members() {
        let err = DeployerError::CyclicDependency {
            contracts: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency between: a, b");
    }

    #[test]
    fn only_submission_errors_are_transient() {
        assert!(DeployerError::Submission("connection reset".into()).is_transient());
        assert!(!DeployerError::Rejected {
            reason: "NotEnoughFunds".into()
        }
        .is_transient());
        assert!(!DeployerError::Validation("x".into()).is_transient());
    }
}
