//! Building account-bound broker clients from stored credentials

use crate::client::{BrokerClient, StocksTraderClient};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use std::sync::Arc;

/// What is stored about an account's broker access
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    /// External broker account reference
    pub account_ref: String,
    /// Credential material as stored (possibly encrypted)
    pub api_token: String,
}

/// Turns stored credential material into a usable secret.
///
/// Encryption at rest is owned by the administration side; this is the seam
/// where its key material is plugged in.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, material: &str) -> Result<String, BrokerError>;
}

/// Treats stored credentials as plaintext
#[derive(Debug, Default, Clone)]
pub struct PassthroughDecryptor;

impl CredentialDecryptor for PassthroughDecryptor {
    fn decrypt(&self, material: &str) -> Result<String, BrokerError> {
        Ok(material.to_string())
    }
}

/// Creates one broker client per account
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, credentials: &BrokerCredentials) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

/// Connector producing [`StocksTraderClient`]s
pub struct StocksTraderConnector {
    config: BrokerConfig,
    decryptor: Arc<dyn CredentialDecryptor>,
}

impl StocksTraderConnector {
    pub fn new(config: BrokerConfig, decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        Self { config, decryptor }
    }
}

impl BrokerConnector for StocksTraderConnector {
    fn connect(&self, credentials: &BrokerCredentials) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        let token = self.decryptor.decrypt(&credentials.api_token)?;
        let client =
            StocksTraderClient::new(self.config.clone(), credentials.account_ref.clone(), token)?;
        Ok(Arc::new(client))
    }
}
