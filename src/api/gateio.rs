use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{BrokerError, CandleStream, MarketDataSource};
use crate::config::ExchangeSettings;
use crate::models::{Candle, Resolution, SymbolInfo};

const REQUEST_TIMEOUT_SECS: u64 = 10;
const STREAM_BUFFER: usize = 256;
const STREAM_TAIL: usize = 2; // Current bar plus the one that just closed
const STREAM_ERROR_PAUSE_SECS: u64 = 5;

// Type alias for the rate limiter to simplify signatures
type GateRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Gate.io USDT-settled futures market data (public endpoints)
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct GateIoClient {
    client: Client,
    base_url: String,
    settle: String,
    stream_poll: Duration,
    rate_limiter: Arc<GateRateLimiter>,
}

/// Entry of /futures/{settle}/contracts
#[derive(Debug, Deserialize)]
struct Contract {
    name: String,
    quanto_multiplier: String,
    order_price_round: String,
    order_size_min: f64,
    #[serde(default)]
    in_delisting: bool,
}

/// Entry of /futures/{settle}/candlesticks
#[derive(Debug, Deserialize)]
struct RawCandle {
    t: i64,
    #[serde(default)]
    v: f64,
    o: String,
    h: String,
    l: String,
    c: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    label: String,
    #[serde(default)]
    message: String,
}

impl GateIoClient {
    pub fn new(settings: &ExchangeSettings) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BrokerError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let rps = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            settle: settings.settle.clone(),
            stream_poll: Duration::from_secs(settings.stream_poll_secs.max(1)),
            rate_limiter,
        })
    }

    /// Rate-limited GET returning decoded JSON
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, BrokerError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| BrokerError::Malformed(format!("{}: {}", path, e)));
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_from_status(status, &body))
    }

    fn contracts_path(&self) -> String {
        format!("/futures/{}/contracts", self.settle)
    }
}

fn error_from_status(status: StatusCode, body: &str) -> BrokerError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited(body.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BrokerError::Auth(body.to_string()),
        StatusCode::NOT_FOUND => BrokerError::Rejected(format!("{}: {}", status, body)),
        s if s.is_server_error() => BrokerError::Transport(format!("{}: {}", s, body)),
        s => match serde_json::from_str::<ApiErrorBody>(body) {
            Ok(err) if !err.label.is_empty() => BrokerError::classify(&err.label, &err.message),
            _ => BrokerError::Rejected(format!("{}: {}", s, body)),
        },
    }
}

/// Number of decimal places in a decimal string ("0.001" -> 3, "1" -> 0)
fn decimals(value: &str) -> u32 {
    match value.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

fn parse_num(field: &str, value: &str) -> Result<f64, BrokerError> {
    value
        .parse::<f64>()
        .map_err(|_| BrokerError::Malformed(format!("{} is not a number: {:?}", field, value)))
}

impl TryFrom<Contract> for SymbolInfo {
    type Error = BrokerError;

    fn try_from(c: Contract) -> Result<Self, Self::Error> {
        let multiplier = parse_num("quanto_multiplier", &c.quanto_multiplier)?;

        Ok(SymbolInfo {
            qty_precision: decimals(&c.quanto_multiplier),
            price_precision: decimals(&c.order_price_round),
            min_qty: c.order_size_min * multiplier,
            symbol: c.name,
        })
    }
}

impl TryFrom<RawCandle> for Candle {
    type Error = BrokerError;

    fn try_from(raw: RawCandle) -> Result<Self, Self::Error> {
        let open_time = Utc
            .timestamp_opt(raw.t, 0)
            .single()
            .ok_or_else(|| BrokerError::Malformed(format!("bad candle timestamp {}", raw.t)))?;

        Ok(Candle {
            open_time,
            open: parse_num("o", &raw.o)?,
            high: parse_num("h", &raw.h)?,
            low: parse_num("l", &raw.l)?,
            close: parse_num("c", &raw.c)?,
            volume: raw.v,
        })
    }
}

#[async_trait]
impl MarketDataSource for GateIoClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        let path = format!("/futures/{}/candlesticks", self.settle);
        let query = [
            ("contract", symbol.to_string()),
            ("interval", resolution.label()),
            ("limit", limit.to_string()),
        ];

        let raw: Vec<RawCandle> = self.get_json(&path, &query).await?;
        let mut candles = raw
            .into_iter()
            .map(Candle::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        candles.sort_by_key(|c| c.open_time);

        tracing::debug!(symbol, interval = %resolution, count = candles.len(), "Fetched candles");
        Ok(candles)
    }

    async fn fetch_universe(&self) -> Result<Vec<SymbolInfo>, BrokerError> {
        let contracts: Vec<Contract> = self.get_json(&self.contracts_path(), &[]).await?;

        let infos = contracts
            .into_iter()
            .filter(|c| !c.in_delisting)
            .map(SymbolInfo::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(count = infos.len(), "Fetched contract universe");
        Ok(infos)
    }

    async fn fetch_symbol(&self, symbol: &str) -> Result<Option<SymbolInfo>, BrokerError> {
        let path = format!("{}/{}", self.contracts_path(), symbol);
        match self.get_json::<Contract>(&path, &[]).await {
            Ok(contract) => Ok(Some(SymbolInfo::try_from(contract)?)),
            Err(BrokerError::Rejected(msg)) if msg.starts_with("404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll the latest candles for each symbol and forward them
    ///
    /// Fetch errors are logged and the poll continues; the task stops once
    /// the receiver is dropped.
    async fn stream_candles(&self, symbols: Vec<String>) -> Result<CandleStream, BrokerError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let client = self.clone();

        tokio::spawn(async move {
            loop {
                for symbol in &symbols {
                    match client.fetch_candles(symbol, Resolution::M1, STREAM_TAIL).await {
                        Ok(candles) => {
                            for candle in candles {
                                if tx.send((symbol.clone(), candle)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(symbol = %symbol, "Candle poll failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(STREAM_ERROR_PAUSE_SECS)).await;
                        }
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(client.stream_poll).await;
            }
        });

        Ok(rx)
    }
}
