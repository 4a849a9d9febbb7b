// src/services/exchange.rs

//! The venue seam. Strategy code only ever sees `dyn ExchangeClient`;
//! `blowfin::client::BlowfinClient` is the production adapter and the tests
//! script their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::services::strategies::{Candle, OrderSide, Side};
use crate::utils::errors::ApiError;

/// Venue trading rules for one instrument, in base-asset units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketMeta {
    pub qty_step: f64,
    pub price_step: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

/// The venue's view of our position. `quantity == 0.0` means flat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VenuePosition {
    pub quantity: f64,
    pub side: Option<Side>,
}

impl VenuePosition {
    pub fn flat() -> Self {
        Self { quantity: 0.0, side: None }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() <= f64::EPSILON
    }
}

/// What a resting trigger order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Chronological (oldest first) candles, the last one possibly still forming.
    async fn fetch_candles(&self, symbol: &str, bar: &str, limit: usize) -> Result<Vec<Candle>, ApiError>;

    /// Last traded price.
    async fn fetch_ticker(&self, symbol: &str) -> Result<f64, ApiError>;

    async fn fetch_position(&self, symbol: &str) -> Result<VenuePosition, ApiError>;

    /// Returns the venue order id.
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<String, ApiError>;

    /// Resting trigger order; returns the venue order id.
    async fn submit_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
        kind: TriggerKind,
        reduce_only: bool,
    ) -> Result<String, ApiError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<CancelOutcome, ApiError>;

    async fn market_meta(&self, symbol: &str) -> Result<MarketMeta, ApiError>;
}
