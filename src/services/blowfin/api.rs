// src/services/blowfin/api.rs

//! BlowFin REST wire types and the pure conversions between them and the
//! venue-neutral types in `services::exchange`. Everything numeric arrives
//! as a string.

use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::exchange::{MarketMeta, VenuePosition};
use crate::services::risk;
use crate::services::strategies::{Candle, Side};
use crate::utils::errors::ApiError;

pub const DEMO_BASE_URL: &str = "https://demo-trading-openapi.blofin.com";
pub const LIVE_BASE_URL: &str = "https://openapi.blofin.com";

pub const CANDLES_PATH: &str = "/api/v1/market/candles";
pub const TICKERS_PATH: &str = "/api/v1/market/tickers";
pub const INSTRUMENTS_PATH: &str = "/api/v1/market/instruments";
pub const POSITIONS_PATH: &str = "/api/v1/account/positions";
pub const ORDER_PATH: &str = "/api/v1/trade/order";
pub const TPSL_PATH: &str = "/api/v1/trade/order-tpsl";
pub const CANCEL_TPSL_PATH: &str = "/api/v1/trade/cancel-tpsl";

#[derive(Debug, Deserialize)]
pub struct BlowFinResponse {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl BlowFinResponse {
    /// Unwrap `data` when `code == "0"`, otherwise surface the venue error.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        if self.code != "0" {
            return Err(ApiError::Venue { code: self.code, msg: self.msg });
        }
        Ok(serde_json::from_value(self.data)?)
    }
}

#[derive(Debug, Serialize)]
pub struct OrderRequest {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "marginMode")]
    pub margin_mode: String,
    #[serde(rename = "positionSide")]
    pub position_side: String,
    pub side: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub size: String,
    #[serde(rename = "reduceOnly")]
    pub reduce_only: String,
}

/// Resting TP/SL trigger. Exactly one of the trigger pairs is set.
#[derive(Debug, Serialize)]
pub struct TpslRequest {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "marginMode")]
    pub margin_mode: String,
    #[serde(rename = "positionSide")]
    pub position_side: String,
    pub side: String,
    pub size: String,
    #[serde(rename = "reduceOnly")]
    pub reduce_only: String,
    #[serde(rename = "slTriggerPrice", skip_serializing_if = "Option::is_none")]
    pub sl_trigger_price: Option<String>,
    #[serde(rename = "slOrderPrice", skip_serializing_if = "Option::is_none")]
    pub sl_order_price: Option<String>,
    #[serde(rename = "tpTriggerPrice", skip_serializing_if = "Option::is_none")]
    pub tp_trigger_price: Option<String>,
    #[serde(rename = "tpOrderPrice", skip_serializing_if = "Option::is_none")]
    pub tp_order_price: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelTpslRequest {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "tpslId")]
    pub tpsl_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId", default)]
    pub order_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TpslAck {
    #[serde(rename = "tpslId", default)]
    pub tpsl_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TickerRow {
    #[serde(rename = "instId")]
    pub inst_id: String,
    pub last: String,
}

#[derive(Debug, Deserialize)]
pub struct PositionRow {
    #[serde(rename = "instId")]
    pub inst_id: String,
    /// Signed contract count in net mode.
    pub positions: String,
    #[serde(rename = "positionSide", default)]
    pub position_side: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentRow {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "contractValue")]
    pub contract_value: String,
    #[serde(rename = "lotSize")]
    pub lot_size: String,
    #[serde(rename = "tickSize")]
    pub tick_size: String,
    #[serde(rename = "minSize")]
    pub min_size: String,
}

/// Parsed instrument rules, still in contracts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instrument {
    pub contract_value: f64,
    pub lot_size: f64,
    pub tick_size: f64,
    pub min_size: f64,
}

pub fn num(field: &'static str, raw: &str) -> Result<f64, ApiError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| ApiError::Other(format!("{field}: not a number: {raw:?}")))
}

impl InstrumentRow {
    pub fn parse(&self) -> Result<Instrument, ApiError> {
        let inst = Instrument {
            contract_value: num("contractValue", &self.contract_value)?,
            lot_size: num("lotSize", &self.lot_size)?,
            tick_size: num("tickSize", &self.tick_size)?,
            min_size: num("minSize", &self.min_size)?,
        };
        if inst.contract_value <= 0.0 {
            return Err(ApiError::Other(format!("{}: contractValue must be positive", self.inst_id)));
        }
        Ok(inst)
    }
}

impl Instrument {
    /// Trading rules in base-asset units. BlowFin publishes no notional
    /// floor, so `min_notional` is zero and the minimum size governs.
    pub fn meta(&self) -> MarketMeta {
        MarketMeta {
            qty_step: self.lot_size * self.contract_value,
            price_step: self.tick_size,
            min_qty: self.min_size * self.contract_value,
            min_notional: 0.0,
        }
    }

    /// Base-asset quantity → contract count string on the lot grid.
    pub fn contracts(&self, quantity: f64) -> String {
        let c = risk::floor_to_step(quantity / self.contract_value, self.lot_size);
        format_step(c, self.lot_size)
    }

    pub fn price(&self, price: f64) -> String {
        format_step(risk::round_to_step(price, self.tick_size), self.tick_size)
    }
}

pub fn format_step(v: f64, step: f64) -> String {
    format!("{:.*}", risk::step_decimals(step) as usize, v)
}

/// `[[ts, o, h, l, c, vol, ...], ...]`, newest first → chronological candles.
pub fn parse_candles(rows: Vec<Vec<String>>) -> Result<Vec<Candle>, ApiError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 6 {
            return Err(ApiError::Other(format!("candle row too short: {row:?}")));
        }
        let ms = row[0]
            .parse::<i64>()
            .map_err(|_| ApiError::Other(format!("candle ts: {:?}", row[0])))?;
        let ts = Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| ApiError::Other(format!("candle ts out of range: {ms}")))?;
        out.push(Candle {
            ts,
            open: num("open", &row[1])?,
            high: num("high", &row[2])?,
            low: num("low", &row[3])?,
            close: num("close", &row[4])?,
            volume: num("vol", &row[5])?,
        });
    }
    out.sort_by_key(|c| c.ts);
    out.dedup_by_key(|c| c.ts);
    Ok(out)
}

/// Net-mode rows for one instrument → base-asset position.
pub fn parse_position(rows: &[PositionRow], inst: &Instrument) -> Result<VenuePosition, ApiError> {
    let mut contracts = 0.0;
    for row in rows {
        let signed = num("positions", &row.positions)?;
        contracts += match row.position_side.as_str() {
            "short" => -signed.abs(),
            "long" => signed.abs(),
            _ => signed,
        };
    }
    let quantity = contracts.abs() * inst.contract_value;
    let pos = VenuePosition {
        quantity,
        side: if contracts > 0.0 {
            Some(Side::Long)
        } else if contracts < 0.0 {
            Some(Side::Short)
        } else {
            None
        },
    };
    Ok(if pos.is_flat() { VenuePosition::flat() } else { pos })
}
