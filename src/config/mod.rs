use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::strategy::StrategyParams;

/// Exchange endpoints and request pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub settle: String,
    pub requests_per_second: u32,
    pub stream_poll_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.gateio.ws/api/v4".to_string(),
            settle: "usdt".to_string(),
            requests_per_second: 10,
            stream_poll_secs: 5,
        }
    }
}

/// What the fast scan does when the focus set exceeds its cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    pub slow_interval_secs: u64,
    pub fast_interval_secs: u64,
    pub slow_batch_size: usize,
    pub slow_batch_pause_ms: u64,
    pub slow_candle_limit: usize,
    pub rsi_low: f64,
    pub rsi_high: f64,
    pub fast_cap: usize,
    pub overflow_policy: OverflowPolicy,
    pub error_backoff_secs: u64,
    pub reconcile_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub catalog_refresh_secs: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            slow_interval_secs: 180,
            fast_interval_secs: 3,
            slow_batch_size: 5,
            slow_batch_pause_ms: 1000,
            slow_candle_limit: 30,
            rsi_low: 30.0,
            rsi_high: 70.0,
            fast_cap: 10,
            overflow_policy: OverflowPolicy::RoundRobin,
            error_backoff_secs: 30,
            reconcile_interval_secs: 10,
            heartbeat_interval_secs: 60,
            catalog_refresh_secs: 3600,
        }
    }
}

impl ScanSettings {
    pub fn slow_interval(&self) -> Duration {
        Duration::from_secs(self.slow_interval_secs)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_secs(self.fast_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub leverage: u32,
    pub entry_percent: f64,
    pub strong_entry_percent: f64, // used when the 1m RSI is past the heavy threshold
    pub min_notional: f64,
    pub cooldown_secs: i64,
    pub symbol_limit: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            leverage: 10,
            entry_percent: 0.05,
            strong_entry_percent: 0.10,
            min_notional: 6.0,
            cooldown_secs: 300,
            symbol_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSettings {
    pub max_candles: usize,
    pub metrics_ttl_secs: i64,
    pub warmup_candles: usize,  // 1m history fetched the first time a symbol is focused
    pub refresh_candles: usize, // 1m tail fetched on later fast scans
}

impl Default for SeriesSettings {
    fn default() -> Self {
        Self {
            // 15m ATR(14) needs 15 full 15m buckets of 1m data
            max_candles: 1500,
            metrics_ttl_secs: 60,
            warmup_candles: 300,
            refresh_candles: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceSettings {
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperSettings {
    pub starting_equity: f64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            starting_equity: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "perpbot=info".to_string(),
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub strategy: StrategyParams,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub series: SeriesSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
    #[serde(default)]
    pub paper: PaperSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings: compiled defaults, then an optional file, then `PERPBOT__*` env vars
    ///
    /// # Arguments
    /// * `path` - Config file path without requiring it to exist (e.g. "perpbot.toml")
    ///
    /// # Example
    /// `PERPBOT__EXECUTION__LEVERAGE=20` overrides `execution.leverage`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("PERPBOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.slow_batch_size == 0 {
            return Err(ConfigError::Message("scan.slow_batch_size must be > 0".into()));
        }
        if self.scan.fast_cap == 0 {
            return Err(ConfigError::Message("scan.fast_cap must be > 0".into()));
        }
        if self.strategy.dca_gaps.is_empty() {
            return Err(ConfigError::Message("strategy.dca_gaps must not be empty".into()));
        }
        if self.execution.entry_percent <= 0.0 || self.execution.entry_percent > 1.0 {
            return Err(ConfigError::Message(
                "execution.entry_percent must be in (0, 1]".into(),
            ));
        }
        if self.execution.strong_entry_percent < self.execution.entry_percent
            || self.execution.strong_entry_percent > 1.0
        {
            return Err(ConfigError::Message(
                "execution.strong_entry_percent must be in [entry_percent, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_file() {
        let settings = Settings::load(None).unwrap();

        assert_eq!(settings.scan.slow_interval_secs, 180);
        assert_eq!(settings.scan.fast_interval_secs, 3);
        assert_eq!(settings.scan.fast_cap, 10);
        assert_eq!(settings.execution.cooldown_secs, 300);
        assert_eq!(settings.execution.min_notional, 6.0);
        assert_eq!(settings.scan.overflow_policy, OverflowPolicy::RoundRobin);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let settings = Settings::load(Some("does-not-exist-perpbot")).unwrap();
        assert_eq!(settings.series.metrics_ttl_secs, 60);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("perpbot-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bot.toml");
        std::fs::write(
            &path,
            "[execution]\nleverage = 20\n\n[scan]\noverflow_policy = \"random\"\n",
        )
        .unwrap();

        let settings = Settings::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(settings.execution.leverage, 20);
        assert_eq!(settings.scan.overflow_policy, OverflowPolicy::Random);
        // Untouched keys keep their defaults
        assert_eq!(settings.execution.entry_percent, 0.05);
        assert_eq!(settings.execution.strong_entry_percent, 0.10);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rejects_invalid_entry_percent() {
        let mut settings = Settings::default();
        settings.execution.entry_percent = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.execution.strong_entry_percent = 0.01;
        assert!(settings.validate().is_err());
    }
}
