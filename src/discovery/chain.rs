//! Chain access for the live listener
//!
//! Swap logs come from an `eth_newFilter` poller over HTTP; receipts and
//! blocks are plain JSON-RPC lookups.

use alloy_primitives::{Address, B256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types::{BlockNumberOrTag, Filter, Log};
use alloy_sol_types::{sol, SolEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

// ============================================
// POOL EVENTS
// ============================================

sol! {
    interface IUniswapV3Pool {
        event Swap(
            address indexed sender,
            address indexed recipient,
            int256 amount0,
            int256 amount1,
            uint160 sqrtPriceX96,
            uint128 liquidity,
            int24 tick
        );
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid RPC url {0}")]
    InvalidUrl(String),

    #[error("RPC request failed: {0}")]
    Rpc(String),

    #[error("swap event stream closed")]
    StreamClosed,
}

impl From<alloy_transport::TransportError> for ChainError {
    fn from(e: alloy_transport::TransportError) -> Self {
        ChainError::Rpc(e.to_string())
    }
}

/// A Swap log, reduced to what the listener needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEvent {
    pub tx_hash: Option<B256>,
    pub block_number: Option<u64>,
}

impl From<Log> for SwapEvent {
    fn from(log: Log) -> Self {
        Self {
            tx_hash: log.transaction_hash,
            block_number: log.block_number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub hash: B256,
    /// None while pending
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Endless stream of Swap events emitted by `pool`.
    async fn swap_events(&self, pool: Address) -> Result<BoxStream<'static, SwapEvent>, ChainError>;

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ChainError>;

    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, ChainError>;
}

pub struct AlloyChainSource {
    provider: DynProvider,
    poll_interval: Duration,
}

impl AlloyChainSource {
    pub fn connect(rpc_url: &str, poll_interval: Duration) -> Result<Self, ChainError> {
        let url = rpc_url
            .parse()
            .map_err(|_| ChainError::InvalidUrl(rpc_url.to_string()))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();

        Ok(Self {
            provider,
            poll_interval,
        })
    }
}

pub fn swap_filter(pool: Address) -> Filter {
    Filter::new()
        .address(pool)
        .event_signature(IUniswapV3Pool::Swap::SIGNATURE_HASH)
}

#[async_trait]
impl ChainSource for AlloyChainSource {
    async fn swap_events(&self, pool: Address) -> Result<BoxStream<'static, SwapEvent>, ChainError> {
        let poller = self
            .provider
            .watch_logs(&swap_filter(pool))
            .await?
            .with_poll_interval(self.poll_interval);

        info!("👂 Watching Swap events on {:?}", pool);

        Ok(poller
            .into_stream()
            .flat_map(|logs| stream::iter(logs.into_iter().map(SwapEvent::from)))
            .boxed())
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ChainError> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;

        Ok(receipt.map(|r| ReceiptInfo {
            hash: r.transaction_hash,
            block_number: r.block_number,
            gas_used: r.gas_used,
            effective_gas_price: r.effective_gas_price,
        }))
    }

    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, ChainError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?;

        Ok(block.map(|b| b.header.timestamp))
    }
}
