//! Paraswap v5 REST client.
//!
//! Two calls per quote: `GET /prices` for the price route, then
//! `POST /transactions/{network}` to build the Augustus calldata for the
//! liquidator contract.

use crate::quote::{min_return, QuoteProvider, QuoteRequest, SwapQuote};
use alloy::primitives::{Address, Bytes, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

const DEFAULT_BASE_URL: &str = "https://apiv5.paraswap.io";

#[derive(Clone)]
struct CachedQuote {
    quote: SwapQuote,
    cached_at: Instant,
}

/// Exact request identity. Calldata embeds the amount, so no bucketing.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    sell_token: Address,
    buy_token: Address,
    amount: U256,
    recipient: Address,
    slippage_bps: u16,
}

impl From<&QuoteRequest> for CacheKey {
    fn from(r: &QuoteRequest) -> Self {
        Self {
            sell_token: r.sell_token,
            buy_token: r.buy_token,
            amount: r.amount,
            recipient: r.recipient,
            slippage_bps: r.slippage_bps,
        }
    }
}

/// Paraswap client with a short-lived quote cache.
#[derive(Clone)]
pub struct ParaswapClient {
    client: reqwest::Client,
    base_url: String,
    network: u64,
    cache: Arc<DashMap<CacheKey, CachedQuote>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for ParaswapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParaswapClient")
            .field("base_url", &self.base_url)
            .field("network", &self.network)
            .field("cache_size", &self.cache.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl ParaswapClient {
    pub fn new(network: u64) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, network)
    }

    pub fn with_base_url(base_url: impl Into<String>, network: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            network,
            cache: Arc::new(DashMap::new()),
            cache_ttl: Duration::from_secs(12),
        }
    }

    /// Set how long identical quotes are reused.
    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Drop expired quotes.
    fn prune_cache(&self) {
        self.cache.retain(|_, cached| cached.cached_at.elapsed() < self.cache_ttl);
    }

    /// Cache a fresh quote. Every insert prunes expired entries, so the
    /// cache never holds more than one TTL's worth of requests.
    fn store(&self, key: CacheKey, quote: SwapQuote) {
        self.prune_cache();
        self.cache.insert(
            key,
            CachedQuote {
                quote,
                cached_at: Instant::now(),
            },
        );
    }

    fn cached(&self, key: &CacheKey) -> Option<SwapQuote> {
        let entry = self.cache.get(key)?;
        (entry.cached_at.elapsed() < self.cache_ttl).then(|| entry.quote.clone())
    }

    async fn price_route(&self, request: &QuoteRequest) -> Result<serde_json::Value> {
        let url = format!("{}/prices", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("srcToken", request.sell_token.to_string()),
                ("destToken", request.buy_token.to_string()),
                ("amount", request.amount.to_string()),
                ("srcDecimals", request.sell_decimals.to_string()),
                ("destDecimals", request.buy_decimals.to_string()),
                ("side", "SELL".to_string()),
                ("network", self.network.to_string()),
                ("userAddress", request.recipient.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Paraswap prices error: {} - {}", status, body);
        }

        let prices: PricesResponse = response.json().await?;
        Ok(prices.price_route)
    }

    async fn build_transaction(
        &self,
        request: &QuoteRequest,
        price_route: serde_json::Value,
    ) -> Result<TransactionResponse> {
        let url = format!("{}/transactions/{}", self.base_url, self.network);
        let body = TransactionRequestBody {
            src_token: request.sell_token,
            dest_token: request.buy_token,
            src_amount: request.amount.to_string(),
            slippage: request.slippage_bps,
            src_decimals: request.sell_decimals,
            dest_decimals: request.buy_decimals,
            user_address: request.recipient,
            price_route,
        };

        let response = self
            .client
            .post(&url)
            .query(&[("ignoreChecks", "true")])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Paraswap transactions error: {} - {}", status, body);
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl QuoteProvider for ParaswapClient {
    fn provider_id(&self) -> &str {
        "paraswap"
    }

    #[instrument(skip(self, request), fields(sell = %request.sell_token, buy = %request.buy_token, amount = %request.amount))]
    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote> {
        let key = CacheKey::from(request);
        if let Some(quote) = self.cached(&key) {
            debug!("Cache hit for swap quote");
            return Ok(quote);
        }

        let price_route = self.price_route(request).await?;
        let expected_return = dest_amount(&price_route)?;
        let tx = self.build_transaction(request, price_route).await?;

        let quote = SwapQuote {
            sell_token: request.sell_token,
            buy_token: request.buy_token,
            sell_amount: request.amount,
            to: tx.to,
            call_data: tx.data,
            expected_return,
            min_return: min_return(expected_return, request.slippage_bps),
        };

        debug!(
            expected_return = %quote.expected_return,
            min_return = %quote.min_return,
            to = %quote.to,
            "Got swap quote"
        );

        self.store(key, quote.clone());
        Ok(quote)
    }
}

/// `priceRoute.destAmount`, a decimal string.
fn dest_amount(price_route: &serde_json::Value) -> Result<U256> {
    let raw = price_route
        .get("destAmount")
        .and_then(|v| v.as_str())
        .context("priceRoute.destAmount missing")?;
    raw.parse::<U256>()
        .with_context(|| format!("invalid destAmount {raw}"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricesResponse {
    /// Passed back verbatim to `/transactions`.
    price_route: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRequestBody {
    src_token: Address,
    dest_token: Address,
    src_amount: String,
    slippage: u16,
    src_decimals: u8,
    dest_decimals: u8,
    user_address: Address,
    price_route: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    to: Address,
    data: Bytes,
}
