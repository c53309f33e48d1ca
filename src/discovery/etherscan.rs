//! Etherscan token-transfer history
//!
//! API: {base}?chainid=1&module=account&action=tokentx&address=..&page=1&offset=..
//!      &startblock=..&endblock=..&sort=asc&apikey=..

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::types::TransactionDescriptor;

const API_TIMEOUT_SECS: u64 = 30;

/// Message Etherscan pairs with status "0" for an empty range
const NO_TRANSACTIONS: &str = "No transactions found";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history API request failed: {0}")]
    Http(String),

    #[error("history API error: {message} ({detail})")]
    Api { message: String, detail: String },

    #[error("malformed history entry {hash}: {reason}")]
    Malformed { hash: String, reason: String },
}

/// One `tokentx` entry. Only the fields the indexer reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransaction {
    pub hash: String,
    pub block_number: String,
    pub time_stamp: String,
    pub gas_used: String,
    pub gas_price: String,
}

impl TokenTransaction {
    pub fn block_number(&self) -> Result<u64, HistoryError> {
        self.parse_u64("blockNumber", &self.block_number)
    }

    fn parse_u64(&self, field: &str, value: &str) -> Result<u64, HistoryError> {
        value.parse().map_err(|_| HistoryError::Malformed {
            hash: self.hash.clone(),
            reason: format!("{} is not a number: {:?}", field, value),
        })
    }
}

impl TryFrom<&TokenTransaction> for TransactionDescriptor {
    type Error = HistoryError;

    fn try_from(tx: &TokenTransaction) -> Result<Self, Self::Error> {
        Ok(TransactionDescriptor {
            hash: tx.hash.clone(),
            block_number: tx.block_number()?,
            timestamp: tx.parse_u64("timeStamp", &tx.time_stamp)?,
            gas_used: tx.gas_used.clone(),
            gas_price: Some(tx.gas_price.clone()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    /// An array on success, an error string otherwise
    result: Value,
}

fn parse_response(body: EtherscanResponse) -> Result<Vec<TokenTransaction>, HistoryError> {
    if body.status == "1" {
        return serde_json::from_value(body.result).map_err(|e| HistoryError::Http(e.to_string()));
    }

    if body.message == NO_TRANSACTIONS {
        return Ok(Vec::new());
    }

    let detail = match &body.result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    Err(HistoryError::Api {
        message: body.message,
        detail,
    })
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `limit` transfers touching `address` in `[start_block, end_block]`,
    /// oldest first.
    async fn token_transactions(
        &self,
        address: &str,
        start_block: u64,
        end_block: u64,
        limit: usize,
    ) -> Result<Vec<TokenTransaction>, HistoryError>;
}

pub struct EtherscanClient {
    http_client: Client,
    base_url: String,
    api_key: String,
    chain_id: u64,
}

impl EtherscanClient {
    pub fn new(base_url: String, api_key: String, chain_id: u64) -> Result<Self, HistoryError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .map_err(|e| HistoryError::Http(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            api_key,
            chain_id,
        })
    }

    pub fn from_config(config: &Config, api_key: String) -> Result<Self, HistoryError> {
        Self::new(config.etherscan_api_url.clone(), api_key, config.chain_id)
    }
}

#[async_trait]
impl HistorySource for EtherscanClient {
    async fn token_transactions(
        &self,
        address: &str,
        start_block: u64,
        end_block: u64,
        limit: usize,
    ) -> Result<Vec<TokenTransaction>, HistoryError> {
        debug!(
            "📜 Fetching tokentx for {} blocks {}..={}",
            address, start_block, end_block
        );

        let body = self
            .http_client
            .get(&self.base_url)
            .query(&[
                ("chainid", self.chain_id.to_string()),
                ("module", "account".to_string()),
                ("action", "tokentx".to_string()),
                ("address", address.to_string()),
                ("page", "1".to_string()),
                ("offset", limit.to_string()),
                ("startblock", start_block.to_string()),
                ("endblock", end_block.to_string()),
                ("sort", "asc".to_string()),
                ("apikey", self.api_key.clone()),
            ])
            .send()
            .await
            .map_err(|e| HistoryError::Http(e.to_string()))?
            .json::<EtherscanResponse>()
            .await
            .map_err(|e| HistoryError::Http(e.to_string()))?;

        parse_response(body)
    }
}
