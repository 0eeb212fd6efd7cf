//! REST ticker snapshot used to seed the ticker cache.
//!
//! Late subscribers asking for `ticker:<SYMBOL>` get a snapshot before the
//! first live frame arrives; the fetch runs through the resilient client so
//! a degraded REST endpoint only costs the snapshot.

use chrono::Utc;

use super::client::StreamClient;
use super::messages::RestTicker24hr;
use crate::domain::market::{TickerEvent, from_epoch_millis};
use crate::resilience::{ExecutorError, ResilientHttpClient};

/// Path of the 24h ticker endpoint.
pub const TICKER_24HR_PATH: &str = "/api/v3/ticker/24hr";

/// Fetches 24h tickers over REST.
#[derive(Debug, Clone)]
pub struct RestTickerSource {
    http: ResilientHttpClient,
    base_url: String,
}

impl RestTickerSource {
    /// Create a source for `base_url` (e.g. `https://api.binance.com`).
    #[must_use]
    pub fn new(http: ResilientHttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch all tickers, keeping only `symbols` when it is non-empty.
    ///
    /// # Errors
    ///
    /// Returns the executor error when the request fails for good or the
    /// circuit is open.
    pub async fn fetch(&self, symbols: &[String]) -> Result<Vec<TickerEvent>, ExecutorError> {
        let url = format!("{}{TICKER_24HR_PATH}", self.base_url);
        let raw: Vec<RestTicker24hr> = self.http.get_json(&url).await?;

        Ok(raw
            .into_iter()
            .filter(|t| symbols.is_empty() || symbols.iter().any(|s| s.eq_ignore_ascii_case(&t.symbol)))
            .map(into_ticker)
            .collect())
    }

    /// Fetch and load into `client`'s ticker cache.
    ///
    /// Returns the number of cache entries added.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch).
    pub async fn seed(&self, client: &StreamClient, symbols: &[String]) -> Result<usize, ExecutorError> {
        let tickers = self.fetch(symbols).await?;
        let fetched = tickers.len();
        let added = client.seed_tickers(tickers);
        tracing::info!(fetched, added, "Seeded ticker cache from REST snapshot");
        Ok(added)
    }
}

fn into_ticker(raw: RestTicker24hr) -> TickerEvent {
    TickerEvent {
        symbol: raw.symbol,
        price: raw.last_price,
        price_change: raw.price_change,
        price_change_percent: raw.price_change_percent,
        high_24h: raw.high_price,
        low_24h: raw.low_price,
        volume_24h: raw.volume,
        quote_volume_24h: raw.quote_volume,
        timestamp: raw
            .close_time
            .and_then(from_epoch_millis)
            .unwrap_or_else(Utc::now),
    }
}
