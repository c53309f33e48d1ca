//! Binance spot klines client
//!
//! API: https://api.binance.com/api/v3/klines?symbol=ETHUSDT&interval=1s&startTime=..&limit=1
//!
//! The client only translates HTTP into a [`KlineResponse`]; status and
//! rate-limit handling belong to the resolver.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use tracing::trace;

use super::PriceError;
use crate::config::Config;

/// Timeout for API calls
const API_TIMEOUT_SECS: u64 = 10;

/// Request weight used in the current minute
pub const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";

/// Index of the close price inside a kline row
pub const CLOSE_PRICE_INDEX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineRequest {
    pub symbol: String,
    pub interval: &'static str,
    /// Unix milliseconds
    pub start_time_ms: u64,
    pub limit: u32,
}

impl KlineRequest {
    /// The single 1s kline opening at `timestamp`
    pub fn one_second(symbol: &str, timestamp: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval: "1s",
            start_time_ms: timestamp.saturating_mul(1000),
            limit: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KlineResponse {
    pub status: u16,
    /// Server-provided wait, on throttling
    pub retry_after: Option<Duration>,
    /// Weight used so far this minute
    pub used_weight: Option<u32>,
    /// Raw kline rows; empty on non-200 responses
    pub rows: Vec<Vec<Value>>,
}

impl KlineResponse {
    pub fn is_rate_limited(&self) -> bool {
        // 418 is Binance's "banned after ignoring 429s"
        self.status == 429 || self.status == 418
    }
}

#[async_trait]
pub trait SpotPriceApi: Send + Sync {
    async fn klines(&self, request: &KlineRequest) -> Result<KlineResponse, PriceError>;
}

/// Out-of-range values read as absent rather than wrapping.
fn header_value<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub struct BinanceClient {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl BinanceClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self, PriceError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .map_err(|e| PriceError::Http(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, PriceError> {
        Self::new(config.binance_api_url.clone(), config.binance_api_key.clone())
    }
}

#[async_trait]
impl SpotPriceApi for BinanceClient {
    async fn klines(&self, request: &KlineRequest) -> Result<KlineResponse, PriceError> {
        let url = format!("{}/api/v3/klines", self.base_url);

        let mut builder = self.http_client.get(&url).query(&[
            ("symbol", request.symbol.clone()),
            ("interval", request.interval.to_string()),
            ("startTime", request.start_time_ms.to_string()),
            ("limit", request.limit.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            builder = builder.header("X-MBX-APIKEY", key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PriceError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let retry_after = header_value::<u64>(headers, RETRY_AFTER.as_str()).map(Duration::from_secs);
        let used_weight = header_value::<u32>(headers, USED_WEIGHT_HEADER);

        trace!(
            "Binance klines {} → {} (weight {:?})",
            request.symbol,
            status,
            used_weight
        );

        let rows = if status == 200 {
            response
                .json::<Vec<Vec<Value>>>()
                .await
                .map_err(|e| PriceError::Http(e.to_string()))?
        } else {
            Vec::new()
        };

        Ok(KlineResponse {
            status,
            retry_after,
            used_weight,
            rows,
        })
    }
}
