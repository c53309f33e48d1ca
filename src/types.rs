//! Transaction descriptors (in flight) and records (persisted)

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Fractional digits kept for quote-currency values (price, USDT fee)
pub const QUOTE_SCALE: u32 = 6;

/// Fractional digits kept for native-asset fees (wei precision)
pub const NATIVE_SCALE: u32 = 18;

// ============================================
// DESCRIPTOR
// ============================================

/// A discovered transaction waiting to be priced and persisted.
///
/// Gas values stay decimal strings so values beyond native integer range
/// survive the trip through the queue untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDescriptor {
    pub hash: String,
    pub block_number: u64,
    pub timestamp: u64,
    pub gas_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("transaction hash is empty")]
    EmptyHash,

    #[error("transaction hash {0} is not 0x-prefixed hex")]
    MalformedHash(String),

    #[error("{field} is not an unsigned decimal integer: {value:?}")]
    NotDecimal { field: &'static str, value: String },

    #[error(transparent)]
    Fee(#[from] FeeError),
}

fn is_decimal_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl TransactionDescriptor {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.hash.is_empty() {
            return Err(DescriptorError::EmptyHash);
        }
        let hex = self
            .hash
            .strip_prefix("0x")
            .ok_or_else(|| DescriptorError::MalformedHash(self.hash.clone()))?;
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DescriptorError::MalformedHash(self.hash.clone()));
        }
        if !is_decimal_digits(&self.gas_used) {
            return Err(DescriptorError::NotDecimal {
                field: "gas_used",
                value: self.gas_used.clone(),
            });
        }
        if let Some(price) = &self.gas_price {
            if !is_decimal_digits(price) {
                return Err(DescriptorError::NotDecimal {
                    field: "gas_price",
                    value: price.clone(),
                });
            }
            native_fee(&self.gas_used, price)?;
        }
        Ok(())
    }
}

// ============================================
// FEES
// ============================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeeError {
    #[error("cannot parse {field} {value:?} as a decimal")]
    Parse { field: &'static str, value: String },

    #[error("fee computation overflowed for gas_used={gas_used} gas_price={gas_price}")]
    Overflow { gas_used: String, gas_price: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fees {
    pub eth_fee: Decimal,
    pub usdt_fee: Decimal,
}

/// Round a quote-currency value the way a NUMERIC(_, 6) column would.
pub fn normalize_quote(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(QUOTE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn parse_wei(field: &'static str, value: &str) -> Result<U256, FeeError> {
    let parse_error = || FeeError::Parse {
        field,
        value: value.to_string(),
    };
    if !is_decimal_digits(value) {
        return Err(parse_error());
    }
    U256::from_str_radix(value, 10).map_err(|_| parse_error())
}

/// `gas_used × gas_price / 1e18`, exact at wei precision.
///
/// The product is taken in 256 bits; it fails only when the fee can't be
/// held with 18 fractional digits.
pub fn native_fee(gas_used: &str, gas_price: &str) -> Result<Decimal, FeeError> {
    let used = parse_wei("gas_used", gas_used)?;
    let price = parse_wei("gas_price", gas_price)?;
    let overflow = || FeeError::Overflow {
        gas_used: gas_used.to_string(),
        gas_price: gas_price.to_string(),
    };

    let wei = used.checked_mul(price).ok_or_else(overflow)?;
    let wei = u128::try_from(wei)
        .ok()
        .and_then(|w| i128::try_from(w).ok())
        .ok_or_else(overflow)?;
    Decimal::try_from_i128_with_scale(wei, NATIVE_SCALE).map_err(|_| overflow())
}

/// `eth_fee = gas_used × gas_price / 1e18`, `usdt_fee = eth_fee × price`.
///
/// Returns `None` when the descriptor carries no gas price.
pub fn compute_fees(
    gas_used: &str,
    gas_price: Option<&str>,
    eth_price: Decimal,
) -> Result<Option<Fees>, FeeError> {
    let Some(gas_price) = gas_price else {
        return Ok(None);
    };

    let eth_fee = native_fee(gas_used, gas_price)?.normalize();
    let usdt_fee = eth_fee
        .checked_mul(eth_price)
        .ok_or_else(|| FeeError::Overflow {
            gas_used: gas_used.to_string(),
            gas_price: gas_price.to_string(),
        })?;

    Ok(Some(Fees {
        eth_fee,
        usdt_fee: normalize_quote(usdt_fee),
    }))
}

// ============================================
// RECORD
// ============================================

/// A priced, fee-annotated transaction as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub block_number: u64,
    pub timestamp: u64,
    pub gas_used: String,
    pub gas_price: Option<String>,
    pub eth_price_at_tx: Decimal,
    pub eth_fee: Option<Decimal>,
    pub usdt_fee: Option<Decimal>,
    pub processed_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn enrich(
        descriptor: TransactionDescriptor,
        eth_price: Decimal,
        processed_at: DateTime<Utc>,
    ) -> Result<Self, FeeError> {
        let eth_price = normalize_quote(eth_price);
        let fees = compute_fees(&descriptor.gas_used, descriptor.gas_price.as_deref(), eth_price)?;

        Ok(Self {
            hash: descriptor.hash,
            block_number: descriptor.block_number,
            timestamp: descriptor.timestamp,
            gas_used: descriptor.gas_used,
            gas_price: descriptor.gas_price,
            eth_price_at_tx: eth_price,
            eth_fee: fees.map(|f| f.eth_fee),
            usdt_fee: fees.map(|f| f.usdt_fee),
            processed_at,
        })
    }
}
