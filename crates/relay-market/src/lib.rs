//! Market-data adapter (CoinGecko-style trending endpoint).
//!
//! The client performs exactly one HTTP request per call and maps failures into
//! [`TransportFailure`]; throttling happens in the caller's dispatcher under the
//! `market-data` service.

use std::time::Duration;

use relay_core::{
    errors::{Error, TransportFailure},
    Result,
};
use serde::{Deserialize, Serialize};

const BODY_SNIPPET: usize = 200;

/// One trending coin as shown to users and cached in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendingCoin {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub market_cap_rank: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct MarketDataClient {
    base_url: String,
    http: reqwest::Client,
}

impl MarketDataClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relay-bot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("market http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {base}/search/trending`
    pub async fn trending(&self) -> Result<Vec<TrendingCoin>> {
        let url = format!("{}/search/trending", self.base_url);
        tracing::debug!(%url, "fetching trending coins");

        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(status_failure(status.as_u16(), retry_after, &body).into());
        }

        let body = resp.text().await.map_err(map_reqwest_err)?;
        parse_trending(&body)
    }
}

#[derive(Deserialize)]
struct TrendingResponse {
    #[serde(default)]
    coins: Vec<TrendingEntry>,
}

#[derive(Deserialize)]
struct TrendingEntry {
    item: TrendingItem,
}

#[derive(Deserialize)]
struct TrendingItem {
    id: String,
    name: String,
    symbol: String,
    #[serde(default)]
    market_cap_rank: Option<u32>,
}

pub fn parse_trending(body: &str) -> Result<Vec<TrendingCoin>> {
    let parsed: TrendingResponse = serde_json::from_str(body)
        .map_err(|e| TransportFailure::Malformed(format!("trending payload: {e}")))?;
    Ok(parsed
        .coins
        .into_iter()
        .map(|c| TrendingCoin {
            id: c.item.id,
            name: c.item.name,
            symbol: c.item.symbol.to_uppercase(),
            market_cap_rank: c.item.market_cap_rank,
        })
        .collect())
}

fn status_failure(code: u16, retry_after: Option<Duration>, body: &str) -> TransportFailure {
    let body: String = body.chars().take(BODY_SNIPPET).collect();
    match code {
        429 => TransportFailure::RateLimited { retry_after },
        401 | 403 => TransportFailure::Unauthorized(body),
        _ => TransportFailure::Status { code, body },
    }
}

fn map_reqwest_err(e: reqwest::Error) -> Error {
    let failure = if e.is_timeout() {
        TransportFailure::Timeout
    } else if e.is_decode() || e.is_body() {
        TransportFailure::Malformed(e.to_string())
    } else if e.is_builder() {
        TransportFailure::Rejected(e.to_string())
    } else {
        TransportFailure::Connection(e.to_string())
    };
    failure.into()
}
