#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use raptor_divergence::config::settings::StrategyParams;
use raptor_divergence::db::position_store::MemoryPositionStore;
use raptor_divergence::services::exchange::{
    CancelOutcome, ExchangeClient, MarketMeta, TriggerKind, VenuePosition,
};
use raptor_divergence::services::position::{PositionRecord, RetryPolicy};
use raptor_divergence::services::position_desk;
use raptor_divergence::services::strategies::{Candle, OrderSide, Side};
use raptor_divergence::services::trading_engine::TradingEngine;
use raptor_divergence::utils::errors::ApiError;

pub const SYMBOL: &str = "BERA-USDT";

pub fn market() -> MarketMeta {
    MarketMeta { qty_step: 0.1, price_step: 0.01, min_qty: 0.1, min_notional: 5.0 }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentOrder {
    pub side: OrderSide,
    pub quantity: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentTrigger {
    pub id: String,
    pub side: OrderSide,
    pub trigger_price: f64,
    pub kind: TriggerKind,
}

#[derive(Default)]
struct VenueState {
    candles: Vec<Candle>,
    ticker: f64,
    position: Option<VenuePosition>,
    orders: Vec<SentOrder>,
    triggers: Vec<SentTrigger>,
    cancels: Vec<String>,
    failing_orders: usize,
    next_id: u64,
}

/// Scripted in-memory venue. Market orders fill instantly at whatever the
/// test says the price is; reduce-only orders flatten the position.
#[derive(Default)]
pub struct MockVenue {
    state: Mutex<VenueState>,
    order_delay: Mutex<Option<Duration>>,
}

impl MockVenue {
    fn with<R>(&self, f: impl FnOnce(&mut VenueState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_ticker(&self, price: f64) {
        self.with(|s| s.ticker = price);
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.with(|s| s.candles = candles);
    }

    pub fn set_position(&self, side: Side, quantity: f64) {
        self.with(|s| s.position = Some(VenuePosition { quantity, side: Some(side) }));
    }

    /// Position closed outside the bot.
    pub fn flatten(&self) {
        self.with(|s| s.position = None);
    }

    /// The next `n` market orders are rejected.
    pub fn fail_next_orders(&self, n: usize) {
        self.with(|s| s.failing_orders = n);
    }

    pub fn delay_orders(&self, d: Duration) {
        *self.order_delay.lock().unwrap() = Some(d);
    }

    pub fn orders(&self) -> Vec<SentOrder> {
        self.with(|s| s.orders.clone())
    }

    pub fn closes(&self) -> Vec<SentOrder> {
        self.orders().into_iter().filter(|o| o.reduce_only).collect()
    }

    pub fn triggers(&self) -> Vec<SentTrigger> {
        self.with(|s| s.triggers.clone())
    }

    pub fn cancels(&self) -> Vec<String> {
        self.with(|s| s.cancels.clone())
    }

    pub fn position(&self) -> VenuePosition {
        self.with(|s| s.position.unwrap_or_else(VenuePosition::flat))
    }
}

#[async_trait]
impl ExchangeClient for MockVenue {
    async fn fetch_candles(&self, _symbol: &str, _bar: &str, limit: usize) -> Result<Vec<Candle>, ApiError> {
        Ok(self.with(|s| {
            let skip = s.candles.len().saturating_sub(limit);
            s.candles[skip..].to_vec()
        }))
    }

    async fn fetch_ticker(&self, _symbol: &str) -> Result<f64, ApiError> {
        Ok(self.with(|s| s.ticker))
    }

    async fn fetch_position(&self, _symbol: &str) -> Result<VenuePosition, ApiError> {
        Ok(self.position())
    }

    async fn submit_market_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<String, ApiError> {
        let delay = *self.order_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.with(|s| {
            if s.failing_orders > 0 {
                s.failing_orders -= 1;
                return Err(ApiError::Venue { code: "102014".into(), msg: "Insufficient balance".into() });
            }
            s.orders.push(SentOrder { side, quantity, reduce_only });
            s.position = if reduce_only {
                None
            } else {
                let side = match side {
                    OrderSide::Buy => Side::Long,
                    OrderSide::Sell => Side::Short,
                };
                Some(VenuePosition { quantity, side: Some(side) })
            };
            s.next_id += 1;
            Ok(format!("ord-{}", s.next_id))
        })
    }

    async fn submit_stop_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        _quantity: f64,
        trigger_price: f64,
        kind: TriggerKind,
        _reduce_only: bool,
    ) -> Result<String, ApiError> {
        Ok(self.with(|s| {
            s.next_id += 1;
            let id = format!("tpsl-{}", s.next_id);
            s.triggers.push(SentTrigger { id: id.clone(), side, trigger_price, kind });
            id
        }))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<CancelOutcome, ApiError> {
        Ok(self.with(|s| {
            s.cancels.push(order_id.to_string());
            if s.triggers.iter().any(|t| t.id == order_id) {
                CancelOutcome::Cancelled
            } else {
                CancelOutcome::NotFound
            }
        }))
    }

    async fn market_meta(&self, _symbol: &str) -> Result<MarketMeta, ApiError> {
        Ok(market())
    }
}

pub struct Harness {
    pub venue: Arc<MockVenue>,
    pub store: Arc<MemoryPositionStore>,
    pub engine: TradingEngine,
}

pub fn params() -> StrategyParams {
    StrategyParams { symbol: SYMBOL.into(), ..StrategyParams::default() }
}

pub async fn harness(params: StrategyParams, record: Option<PositionRecord>) -> Harness {
    let policy = params.retry_policy();
    harness_with_policy(params, record, policy).await
}

pub async fn harness_with_policy(
    params: StrategyParams,
    record: Option<PositionRecord>,
    policy: RetryPolicy,
) -> Harness {
    let venue = Arc::new(MockVenue::default());
    let store = Arc::new(match record {
        Some(r) => MemoryPositionStore::with_record(r),
        None => MemoryPositionStore::default(),
    });
    let desk = position_desk::spawn(store.clone(), params.trail(), policy)
        .await
        .expect("desk");
    let engine = TradingEngine::new(venue.clone(), desk, market(), Arc::new(params));
    Harness { venue, store, engine }
}

/// Retries allowed immediately, up to three attempts.
pub fn eager_retries() -> RetryPolicy {
    RetryPolicy { base: Duration::ZERO, cap: Duration::ZERO, max_attempts: 3 }
}

pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Candle {
            ts: Utc.timestamp_opt(1_700_000_000 + i as i64 * 3600, 0).unwrap(),
            open: c,
            high: c + 0.2,
            low: c - 0.2,
            close: c,
            volume: 1_000.0,
        })
        .collect()
}

pub fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
    candles_from_closes(&vec![price; n])
}

/// 200 bars: a long grind up, a hard flush to a low at bar 170, a bounce,
/// then a choppier slide to a slightly lower low at bar 195 on much firmer
/// RSI, and four bars of recovery. The bar-195 low is the freshest swing.
pub fn bullish_divergence_candles() -> Vec<Candle> {
    let mut closes: Vec<f64> = (0..160).map(|i| 90.0 + i as f64 * 0.125).collect();
    let mut c = closes[closes.len() - 1];

    let step = (c - 95.0) / 11.0;
    for _ in 0..11 {
        c -= step;
        closes.push(c);
    }
    let step = (105.0 - c) / 15.0;
    for _ in 0..15 {
        c += step;
        closes.push(c);
    }
    for d in [-2.5, 1.0, -2.5, 1.0, -2.5, 1.0, -2.5, 1.0, -2.5, -2.0] {
        c += d;
        closes.push(c);
    }
    for _ in 0..4 {
        c += 1.0;
        closes.push(c);
    }
    candles_from_closes(&closes)
}
