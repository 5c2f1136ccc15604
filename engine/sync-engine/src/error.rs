//! Error types for the synchronization engine

use crate::model::AccountId;
use broker_client::{BrokerError, BrokerErrorKind};
use thiserror::Error;

/// Result type for synchronization engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing an account
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Persistence call timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account is not active: {0}")]
    AccountInactive(AccountId),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Broker classification, if this failure came from the broker
    pub fn broker_kind(&self) -> Option<BrokerErrorKind> {
        match self {
            SyncError::Broker(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Credentials were rejected; retrying will not help
    pub fn is_authorization(&self) -> bool {
        self.broker_kind() == Some(BrokerErrorKind::Authorization)
    }
}

/// Run a persistence call under the engine's I/O timeout
pub(crate) async fn bounded<T, F>(operation: &str, timeout: std::time::Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Run a broker call under the engine's I/O timeout
pub(crate) async fn bounded_broker<T, F>(
    operation: &str,
    timeout: std::time::Duration,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, BrokerError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(_) => Err(SyncError::Broker(BrokerError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_authorization_detection() {
        let err = SyncError::from(BrokerError::from_status(401, "expired".to_string()));
        assert!(err.is_authorization());
        assert!(!SyncError::AccountNotFound(1).is_authorization());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_broker_times_out_as_transient() {
        let result: Result<()> = bounded_broker("account_state", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.broker_kind(), Some(BrokerErrorKind::Transient));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_persistence_timeout() {
        let result: Result<()> = bounded("insert_snapshot", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(SyncError::Timeout { timeout_ms: 10, .. })));
    }
}
