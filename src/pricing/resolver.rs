//! Point-in-time price resolution
//!
//! Cache first; on a miss, one 1s kline from the spot API. Throttling is
//! surfaced as a retryable error so the queue owns the retry schedule.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use super::binance::{KlineRequest, KlineResponse, SpotPriceApi, CLOSE_PRICE_INDEX};
use super::cache::{price_key, PriceCache};
use super::PriceError;
use crate::config::Config;
use crate::types::normalize_quote;

#[derive(Debug, Clone)]
pub struct PriceSettings {
    pub symbol: String,
    pub cache_ttl: Duration,
    pub rate_limit_fallback: Duration,
    pub cooldown: Duration,
    pub weight_budget: u32,
    pub usage_threshold: f64,
}

impl PriceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            symbol: config.price_symbol.clone(),
            cache_ttl: Duration::from_secs(config.price_cache_ttl_secs),
            rate_limit_fallback: Duration::from_secs(config.rate_limit_fallback_secs),
            cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
            weight_budget: config.rate_limit_weight_budget,
            usage_threshold: config.rate_limit_usage_threshold,
        }
    }

    fn near_budget(&self, used_weight: u32) -> bool {
        self.weight_budget > 0
            && used_weight as f64 / self.weight_budget as f64 >= self.usage_threshold
    }
}

impl Default for PriceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct PriceResolver {
    cache: Arc<dyn PriceCache>,
    api: Arc<dyn SpotPriceApi>,
    settings: PriceSettings,
    /// Set when the API reported usage near its budget
    paused_until: Mutex<Option<Instant>>,
}

impl PriceResolver {
    pub fn new(
        cache: Arc<dyn PriceCache>,
        api: Arc<dyn SpotPriceApi>,
        settings: PriceSettings,
    ) -> Self {
        Self {
            cache,
            api,
            settings,
            paused_until: Mutex::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.settings.symbol
    }

    /// Price of the native asset at `timestamp`, 6 fractional digits.
    pub async fn price_at(&self, timestamp: u64) -> Result<Decimal, PriceError> {
        let key = price_key(&self.settings.symbol, timestamp);

        if let Some(cached) = self.cache.get(&key).await? {
            debug!("💾 Cached {} price at {}: {}", self.settings.symbol, timestamp, cached);
            return parse_price(&cached);
        }

        let price = self.fetch(timestamp).await?;

        self.cache
            .set(&key, &price.to_string(), self.settings.cache_ttl)
            .await?;

        info!("💱 {} price at {}: {}", self.settings.symbol, timestamp, price);
        Ok(price)
    }

    async fn fetch(&self, timestamp: u64) -> Result<Decimal, PriceError> {
        self.wait_for_cooldown().await;

        let request = KlineRequest::one_second(&self.settings.symbol, timestamp);
        let response = self.api.klines(&request).await?;

        if let Some(used) = response.used_weight {
            if self.settings.near_budget(used) {
                self.start_cooldown(used).await;
            }
        }

        if response.is_rate_limited() {
            let wait = response
                .retry_after
                .unwrap_or(self.settings.rate_limit_fallback);
            warn!(
                "🚦 {} price API throttled (HTTP {}), backing off {:?}",
                self.settings.symbol, response.status, wait
            );
            sleep(wait).await;
            return Err(PriceError::RateLimited { retry_after: wait });
        }

        if response.status != 200 {
            return Err(PriceError::Upstream {
                status: response.status,
            });
        }

        close_price(&response)
            .ok_or_else(|| PriceError::Unavailable {
                symbol: self.settings.symbol.clone(),
                timestamp,
            })
            .and_then(|raw| parse_price(&raw))
    }

    async fn wait_for_cooldown(&self) {
        let until = *self.paused_until.lock().await;
        if let Some(until) = until {
            if until > Instant::now() {
                debug!("⏸ Price API cooling down for {:?}", until - Instant::now());
                sleep_until(until).await;
            }
        }
    }

    async fn start_cooldown(&self, used_weight: u32) {
        let until = Instant::now() + self.settings.cooldown;
        let mut paused = self.paused_until.lock().await;
        if paused.map_or(true, |current| current < until) {
            warn!(
                "🚦 Price API weight {}/{} near budget, pausing requests for {:?}",
                used_weight, self.settings.weight_budget, self.settings.cooldown
            );
            *paused = Some(until);
        }
    }
}

fn close_price(response: &KlineResponse) -> Option<String> {
    let value = response.rows.first()?.get(CLOSE_PRICE_INDEX)?;
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_price(raw: &str) -> Result<Decimal, PriceError> {
    let price = Decimal::from_str(raw.trim())
        .map_err(|_| PriceError::InvalidPrice(raw.to_string()))?;
    if price <= Decimal::ZERO {
        return Err(PriceError::InvalidPrice(raw.to_string()));
    }
    Ok(normalize_quote(price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::cache::MemoryPriceCache;
    use crate::testing::{kline_response, MockSpotApi};

    const TS: u64 = 1_738_251_010;

    fn resolver(api: Arc<MockSpotApi>, cache: Arc<MemoryPriceCache>) -> PriceResolver {
        PriceResolver::new(cache, api, PriceSettings::default())
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let api = Arc::new(MockSpotApi::default());
        let cache = Arc::new(MemoryPriceCache::new());
        cache
            .set(&price_key("ETHUSDT", TS), "1800.123456", Duration::from_secs(300))
            .await
            .unwrap();

        let price = resolver(api.clone(), cache).price_at(TS).await.unwrap();
        assert_eq!(price, dec("1800.123456"));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_fetches_and_populates_cache() {
        let api = Arc::new(MockSpotApi::with(vec![kline_response("2547.92463912")]));
        let cache = Arc::new(MemoryPriceCache::new());
        let resolver = resolver(api.clone(), cache.clone());

        let price = resolver.price_at(TS).await.unwrap();
        assert_eq!(price, dec("2547.924639"));
        assert_eq!(api.calls(), 1);
        assert_eq!(api.requests()[0].start_time_ms, TS * 1000);
        assert_eq!(
            cache.get(&price_key("ETHUSDT", TS)).await.unwrap().as_deref(),
            Some("2547.924639")
        );

        // Second lookup for the same bucket is served from cache
        resolver.price_at(TS).await.unwrap();
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_honors_retry_after() {
        let throttled = KlineResponse {
            status: 429,
            retry_after: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let api = Arc::new(MockSpotApi::with(vec![throttled, kline_response("1800")]));
        let resolver = resolver(api.clone(), Arc::new(MemoryPriceCache::new()));

        let started = Instant::now();
        let err = resolver.price_at(TS).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(matches!(err, PriceError::RateLimited { retry_after } if retry_after == Duration::from_secs(10)));
        assert!(err.is_retryable());

        // The next attempt (queue redelivery) goes through
        assert_eq!(resolver.price_at(TS).await.unwrap(), dec("1800"));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_without_header_uses_fallback() {
        let throttled = KlineResponse { status: 429, ..Default::default() };
        let api = Arc::new(MockSpotApi::with(vec![throttled]));
        let resolver = resolver(api, Arc::new(MemoryPriceCache::new()));

        let started = Instant::now();
        let err = resolver.price_at(TS).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_near_budget_pauses_next_request() {
        let mut busy = kline_response("1800");
        busy.used_weight = Some(5_500);
        let api = Arc::new(MockSpotApi::with(vec![busy, kline_response("1801")]));
        let resolver = resolver(api.clone(), Arc::new(MemoryPriceCache::new()));

        let started = Instant::now();
        assert_eq!(resolver.price_at(TS).await.unwrap(), dec("1800"));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(resolver.price_at(TS + 1).await.unwrap(), dec("1801"));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_klines_is_unavailable() {
        let empty = KlineResponse { status: 200, ..Default::default() };
        let api = Arc::new(MockSpotApi::with(vec![empty]));
        let cache = Arc::new(MemoryPriceCache::new());
        let err = resolver(api, cache.clone()).price_at(TS).await.unwrap_err();

        assert!(matches!(err, PriceError::Unavailable { .. }));
        assert!(err.is_retryable());
        assert_eq!(cache.get(&price_key("ETHUSDT", TS)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upstream_error_status() {
        let api = Arc::new(MockSpotApi::with(vec![KlineResponse {
            status: 500,
            ..Default::default()
        }]));
        let err = resolver(api, Arc::new(MemoryPriceCache::new()))
            .price_at(TS)
            .await
            .unwrap_err();
        assert!(matches!(err, PriceError::Upstream { status: 500 }));
    }

    #[test]
    fn test_parse_price_rejects_non_positive() {
        assert!(parse_price("0").is_err());
        assert!(parse_price("abc").is_err());
        assert_eq!(parse_price(" 1800.1234565 ").unwrap(), dec("1800.123457"));
    }
}
