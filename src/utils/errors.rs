// src/utils/errors.rs

use std::{error::Error, fmt};
use reqwest;
use serde_json;

/// Errors coming from venue calls (HTTP, JSON, venue-level rejections, deadlines).
#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    Json(serde_json::Error),
    /// Venue answered, but with a non-zero result code.
    Venue { code: String, msg: String },
    /// The named call did not finish within its deadline.
    Timeout(&'static str),
    Other(String),
}

impl ApiError {
    /// Transient errors abort the current tick only; the next tick retries.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.as_u16() == 429 || s.is_server_error()).unwrap_or(false)
            }
            ApiError::Timeout(_) => true,
            ApiError::Venue { code, .. } => code == "429",
            ApiError::Json(_) | ApiError::Other(_) => false,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(e)              => write!(f, "HTTP error: {}", e),
            ApiError::Json(e)              => write!(f, "JSON error: {}", e),
            ApiError::Venue { code, msg }  => write!(f, "venue rejected request ({}): {}", code, msg),
            ApiError::Timeout(call)        => write!(f, "{} timed out", call),
            ApiError::Other(msg)           => write!(f, "{}", msg),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Http(e) => Some(e),
            ApiError::Json(e) => Some(e),
            _                 => None,
        }
    }
}

// Conversions from underlying errors into ApiError
impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self { ApiError::Http(err) }
}
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self { ApiError::Json(err) }
}
impl From<String> for ApiError {
    fn from(msg: String) -> Self { ApiError::Other(msg) }
}

/// Position-store failures. Never fatal to the process; the tick that hit
/// one is aborted and logged.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Startup configuration problems. The only fatal error class.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0} missing from env")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("market {symbol} could not be resolved: {source}")]
    Market {
        symbol: String,
        #[source]
        source: ApiError,
    },
}

/// Errors at the trading-engine level: wraps ApiError plus local rejections.
#[derive(Debug)]
pub enum TradeError {
    Api(ApiError),
    /// Sizing rejected locally; no venue call was made.
    BelowVenueMinimum {
        quantity: f64,
        notional: f64,
        min_quantity: f64,
        min_notional: f64,
    },
    InvalidRequest(String),
    /// Local and venue state disagree in a way automation must not resolve.
    ManualIntervention(String),
    Store(StoreError),
    /// The position desk task is gone.
    DeskClosed,
}

impl TradeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TradeError::Api(e) if e.is_transient())
    }
}

impl fmt::Display for TradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeError::Api(e) => write!(f, "API error: {}", e),
            TradeError::BelowVenueMinimum { quantity, notional, min_quantity, min_notional } => write!(
                f,
                "quantity {} (notional {:.2}) below venue minimums (quantity {}, notional {})",
                quantity, notional, min_quantity, min_notional
            ),
            TradeError::InvalidRequest(msg)     => write!(f, "Invalid request: {}", msg),
            TradeError::ManualIntervention(msg) => write!(f, "manual intervention required: {}", msg),
            TradeError::Store(e)                => write!(f, "store error: {}", e),
            TradeError::DeskClosed              => write!(f, "position desk is not running"),
        }
    }
}

impl Error for TradeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TradeError::Api(e)   => Some(e),
            TradeError::Store(e) => Some(e),
            _                    => None,
        }
    }
}

// Allow using `?` to convert ApiError / StoreError into TradeError
impl From<ApiError> for TradeError {
    fn from(err: ApiError) -> Self { TradeError::Api(err) }
}
impl From<StoreError> for TradeError {
    fn from(err: StoreError) -> Self { TradeError::Store(err) }
}
