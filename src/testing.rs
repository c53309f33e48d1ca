//! Shared fixtures and mocks for unit tests

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::Config;
use crate::discovery::{ChainError, ChainSource, HistoryError, HistorySource, ReceiptInfo, SwapEvent, TokenTransaction};
use crate::pricing::{KlineRequest, KlineResponse, PriceError, SpotPriceApi};
use crate::types::{TransactionDescriptor, TransactionRecord};

pub const POOL: &str = "0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640";

pub fn test_config() -> Config {
    Config {
        rpc_url: Some("http://localhost:8545".to_string()),
        pool_address: Some(POOL.to_string()),
        etherscan_api_key: Some("test-key".to_string()),
        database_url: Some("postgres://localhost/test".to_string()),
        ..Default::default()
    }
}

/// 21000 gas at 20 gwei
pub fn descriptor(hash: &str, block_number: u64) -> TransactionDescriptor {
    TransactionDescriptor {
        hash: hash.to_string(),
        block_number,
        timestamp: 1_738_251_010,
        gas_used: "21000".to_string(),
        gas_price: Some("20000000000".to_string()),
    }
}

/// Priced at 1800.123456: eth_fee 0.00042, usdt_fee 0.756052
pub fn record(hash: &str) -> TransactionRecord {
    let processed_at = Utc.timestamp_opt(1_738_251_100, 0).unwrap();
    TransactionRecord::enrich(
        descriptor(hash, 1),
        Decimal::from_str("1800.123456").unwrap(),
        processed_at,
    )
    .unwrap()
}

// ============================================
// SPOT PRICE API
// ============================================

pub fn kline_response(close: &str) -> KlineResponse {
    KlineResponse {
        status: 200,
        retry_after: None,
        used_weight: Some(1),
        rows: vec![vec![
            json!(1_738_251_010_000u64),
            json!("1800.00"),
            json!("1801.00"),
            json!("1799.00"),
            json!(close),
            json!("12.5"),
        ]],
    }
}

/// Replays canned responses in order, repeating the last one.
#[derive(Default)]
pub struct MockSpotApi {
    responses: Mutex<VecDeque<KlineResponse>>,
    requests: Mutex<Vec<KlineRequest>>,
}

impl MockSpotApi {
    pub fn with(responses: Vec<KlineResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<KlineRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpotPriceApi for MockSpotApi {
    async fn klines(&self, request: &KlineRequest) -> Result<KlineResponse, PriceError> {
        self.requests.lock().unwrap().push(request.clone());

        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        Ok(response.unwrap_or(KlineResponse {
            status: 200,
            ..Default::default()
        }))
    }
}

// ============================================
// HISTORY API
// ============================================

pub fn token_tx(hash: &str, block_number: u64) -> TokenTransaction {
    TokenTransaction {
        hash: hash.to_string(),
        block_number: block_number.to_string(),
        time_stamp: (1_700_000_000 + block_number).to_string(),
        gas_used: "120000".to_string(),
        gas_price: "15000000000".to_string(),
    }
}

/// `len` entries in consecutive blocks starting at `first_block`
pub fn token_batch(first_block: u64, len: u64) -> Vec<TokenTransaction> {
    (first_block..first_block + len)
        .map(|block| token_tx(&format!("0x{:064x}", block), block))
        .collect()
}

/// Replays canned batches; an empty batch once they run out.
#[derive(Default)]
pub struct MockHistorySource {
    batches: Mutex<VecDeque<Result<Vec<TokenTransaction>, HistoryError>>>,
    start_blocks: Mutex<Vec<u64>>,
}

impl MockHistorySource {
    pub fn with(batches: Vec<Result<Vec<TokenTransaction>, HistoryError>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            start_blocks: Mutex::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.start_blocks.lock().unwrap().len()
    }

    pub fn start_blocks(&self) -> Vec<u64> {
        self.start_blocks.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistorySource for MockHistorySource {
    async fn token_transactions(
        &self,
        _address: &str,
        start_block: u64,
        _end_block: u64,
        _limit: usize,
    ) -> Result<Vec<TokenTransaction>, HistoryError> {
        self.start_blocks.lock().unwrap().push(start_block);
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================
// CHAIN
// ============================================

pub struct MockChainSource {
    receipts: Mutex<HashMap<B256, ReceiptInfo>>,
    timestamps: Mutex<HashMap<u64, u64>>,
    lookups: AtomicUsize,
    event_tx: Mutex<Option<mpsc::UnboundedSender<SwapEvent>>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SwapEvent>>>,
}

impl Default for MockChainSource {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            receipts: Mutex::default(),
            timestamps: Mutex::default(),
            lookups: AtomicUsize::new(0),
            event_tx: Mutex::new(Some(tx)),
            event_rx: Mutex::new(Some(rx)),
        }
    }
}

impl MockChainSource {
    pub fn with_receipt(self, hash: B256, block_number: u64, gas_used: u64, gas_price: u128) -> Self {
        self.receipts.lock().unwrap().insert(
            hash,
            ReceiptInfo {
                hash,
                block_number: Some(block_number),
                gas_used,
                effective_gas_price: gas_price,
            },
        );
        self
    }

    pub fn set_block_timestamp(&self, block_number: u64, timestamp: u64) {
        self.timestamps.lock().unwrap().insert(block_number, timestamp);
    }

    pub fn push_event(&self, event: SwapEvent) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            tx.unbounded_send(event).unwrap();
        }
    }

    /// End the event stream after already pushed events
    pub fn close_events(&self) {
        self.event_tx.lock().unwrap().take();
    }

    /// Receipt plus block lookups made so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainSource for MockChainSource {
    async fn swap_events(&self, _pool: Address) -> Result<BoxStream<'static, SwapEvent>, ChainError> {
        match self.event_rx.lock().unwrap().take() {
            Some(rx) => Ok(rx.boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ChainError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.receipts.lock().unwrap().get(&hash).copied())
    }

    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, ChainError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.timestamps.lock().unwrap().get(&number).copied())
    }
}
