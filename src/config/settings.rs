use dotenv::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::blowfin::auth::Credentials;
use crate::services::position::RetryPolicy;
use crate::services::strategies::DivergenceConfig;
use crate::services::trailing::TrailParams;
use crate::utils::errors::ConfigError;

const MAX_CLOSE_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Where the position record lives.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Redis { url: String, key: String },
    File { path: String },
}

/// Tunables of the divergence strategy. Every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub symbol: String,
    pub bar: String,
    pub fetch_limit: usize,
    pub order_notional: f64,
    /// Floor under the venue's own minimum notional.
    pub min_notional: f64,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub swing_window: usize,
    pub align_window: usize,
    pub schedule_secs: u64,
    pub fast_poll_secs: u64,
    pub request_timeout_secs: u64,
    pub place_protective_orders: bool,
    pub margin_mode: String,
    pub max_close_attempts: u32,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            symbol: "BERA-USDT".into(),
            bar: "1H".into(),
            fetch_limit: 200,
            order_notional: 1400.0,
            min_notional: 5.0,
            rsi_period: 6,
            atr_period: 6,
            atr_multiplier: 1.1,
            profit_target_pct: 0.01,
            stop_loss_pct: 0.008,
            swing_window: 4,
            align_window: 3,
            schedule_secs: 60,
            fast_poll_secs: 5,
            request_timeout_secs: 30,
            place_protective_orders: true,
            margin_mode: "isolated".into(),
            max_close_attempts: 5,
        }
    }
}

impl StrategyParams {
    pub fn trail(&self) -> TrailParams {
        TrailParams { multiplier: self.atr_multiplier, stop_pct: self.stop_loss_pct }
    }

    pub fn divergence(&self) -> DivergenceConfig {
        DivergenceConfig { swing_window: self.swing_window, align_window: self.align_window }
    }

    /// Failed closes back off from one schedule interval, doubling, capped at 15 min.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: self.schedule(),
            cap: MAX_CLOSE_BACKOFF.max(self.schedule()),
            max_attempts: self.max_close_attempts,
        }
    }

    pub fn schedule(&self) -> Duration {
        Duration::from_secs(self.schedule_secs)
    }

    pub fn fast_poll(&self) -> Duration {
        Duration::from_secs(self.fast_poll_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Candles needed for the smoothing recurrences to settle.
    pub fn min_history(&self) -> usize {
        10 * self.rsi_period.max(self.atr_period) + 2 * self.swing_window
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { key, reason })
        };

        if self.symbol.trim().is_empty() {
            return invalid("SYMBOL", "must not be empty".into());
        }
        if self.rsi_period == 0 {
            return invalid("RSI_PERIOD", "must be at least 1".into());
        }
        if self.atr_period == 0 {
            return invalid("ATR_PERIOD", "must be at least 1".into());
        }
        if self.swing_window == 0 {
            return invalid("SWING_WINDOW", "must be at least 1".into());
        }
        for (key, v) in [("PROFIT_TARGET_PCT", self.profit_target_pct), ("STOP_LOSS_PCT", self.stop_loss_pct)] {
            if !(v > 0.0 && v < 1.0) {
                return invalid(key, format!("{v} is not a fraction in (0, 1)"));
            }
        }
        if !(self.atr_multiplier > 0.0 && self.atr_multiplier.is_finite()) {
            return invalid("ATR_MULTIPLIER", format!("{} must be positive", self.atr_multiplier));
        }
        if !(self.order_notional > 0.0 && self.order_notional.is_finite()) {
            return invalid("ORDER_NOTIONAL", format!("{} must be positive", self.order_notional));
        }
        if self.min_notional < 0.0 {
            return invalid("MIN_NOTIONAL", "must not be negative".into());
        }
        if self.fast_poll_secs == 0 || self.fast_poll_secs >= self.schedule_secs {
            return invalid(
                "FAST_POLL_SECS",
                format!("{}s must be non-zero and shorter than the {}s schedule", self.fast_poll_secs, self.schedule_secs),
            );
        }
        if self.request_timeout_secs == 0 {
            return invalid("REQUEST_TIMEOUT_SECS", "must be non-zero".into());
        }
        if self.max_close_attempts == 0 {
            return invalid("MAX_CLOSE_ATTEMPTS", "must be at least 1".into());
        }
        if self.fetch_limit < self.min_history() {
            return invalid(
                "FETCH_LIMIT",
                format!("{} candles is too little history, need at least {}", self.fetch_limit, self.min_history()),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub app_mode: String,
    pub store: StoreBackend,
    pub params: StrategyParams,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenv().ok(); // loads `.env` file automatically
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Build from any key → value source; `new()` uses the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let credentials = Credentials {
            api_key: required("BLOFIN_API_KEY")?,
            api_secret: required("BLOFIN_API_SECRET")?,
            passphrase: required("BLOFIN_API_PASSPHRASE")?,
        };
        let app_mode = get("APP_MODE").unwrap_or_else(|| "demo".into()).to_lowercase();

        let mut params = match get("STRATEGY_PARAMS") {
            Some(raw) => serde_json::from_str::<StrategyParams>(&raw).map_err(|e| ConfigError::Invalid {
                key: "STRATEGY_PARAMS",
                reason: e.to_string(),
            })?,
            None => StrategyParams::default(),
        };
        apply_env_overrides(&mut params, &get)?;
        params.validate()?;

        let store = match get("POSITION_STORE").unwrap_or_else(|| "file".into()).to_lowercase().as_str() {
            "redis" => StoreBackend::Redis {
                url: get("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
                key: get("STATE_KEY").unwrap_or_else(|| format!("divergence:position:{}", params.symbol)),
            },
            "file" => StoreBackend::File {
                path: get("STATE_FILE").unwrap_or_else(|| "position_state.json".into()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "POSITION_STORE",
                    reason: format!("{other:?} is neither \"redis\" nor \"file\""),
                })
            }
        };

        Ok(Self { credentials, app_mode, store, params })
    }

    pub fn is_demo(&self) -> bool {
        self.app_mode == "demo"
    }
}

fn parse_into<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(key) {
        *slot = raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid { key, reason: e.to_string() })?;
    }
    Ok(())
}

fn apply_env_overrides(p: &mut StrategyParams, get: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    parse_into(get, "SYMBOL", &mut p.symbol)?;
    parse_into(get, "BAR", &mut p.bar)?;
    parse_into(get, "FETCH_LIMIT", &mut p.fetch_limit)?;
    parse_into(get, "ORDER_NOTIONAL", &mut p.order_notional)?;
    parse_into(get, "MIN_NOTIONAL", &mut p.min_notional)?;
    parse_into(get, "RSI_PERIOD", &mut p.rsi_period)?;
    parse_into(get, "ATR_PERIOD", &mut p.atr_period)?;
    parse_into(get, "ATR_MULTIPLIER", &mut p.atr_multiplier)?;
    parse_into(get, "PROFIT_TARGET_PCT", &mut p.profit_target_pct)?;
    parse_into(get, "STOP_LOSS_PCT", &mut p.stop_loss_pct)?;
    parse_into(get, "SWING_WINDOW", &mut p.swing_window)?;
    parse_into(get, "ALIGN_WINDOW", &mut p.align_window)?;
    parse_into(get, "SCHEDULE_SECS", &mut p.schedule_secs)?;
    parse_into(get, "FAST_POLL_SECS", &mut p.fast_poll_secs)?;
    parse_into(get, "REQUEST_TIMEOUT_SECS", &mut p.request_timeout_secs)?;
    parse_into(get, "PLACE_PROTECTIVE_ORDERS", &mut p.place_protective_orders)?;
    parse_into(get, "MARGIN_MODE", &mut p.margin_mode)?;
    parse_into(get, "MAX_CLOSE_ATTEMPTS", &mut p.max_close_attempts)?;
    Ok(())
}
