//! ──────────────────────────────────────────────────────────────────────────
//! Pre-trade sizing and entry levels
//! ──────────────────────────────────────────────────────────────────────────
//! * Quantity guard  – notional → quantity, truncated to the venue step,
//!                     rejected locally when under venue minimums
//! * Entry levels    – static stop, profit target, initial trailing stop
//!
//! Nothing here talks to the venue; a rejection means no order was sent.
//! ──────────────────────────────────────────────────────────────────────────

use crate::services::exchange::MarketMeta;
use crate::services::strategies::Side;
use crate::services::trailing::{self, TrailParams};
use crate::utils::errors::TradeError;

/// Absorbs float noise like 0.30000000000000004 / 0.1 before flooring.
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderSizing {
    pub quantity: f64,
    pub notional: f64,
}

/// Static exits and trailing seed computed once, at entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryLevels {
    pub stop_loss: f64,
    pub target: f64,
    pub trailing_stop: f64,
    pub trail_distance: f64,
}

/// Number of decimals implied by a step such as `0.001` (→ 3) or `1` (→ 0).
pub fn step_decimals(step: f64) -> u32 {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let mut d = 0;
    let mut scaled = step;
    while d < 12 && (scaled - scaled.round()).abs() > STEP_EPSILON {
        scaled *= 10.0;
        d += 1;
    }
    d
}

fn clean(v: f64, step: f64) -> f64 {
    let f = 10f64.powi(step_decimals(step) as i32);
    (v * f).round() / f
}

/// Truncate towards zero onto the step grid.
pub fn floor_to_step(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    clean(((v / step) + STEP_EPSILON).floor() * step, step)
}

/// Nearest point on the step grid.
pub fn round_to_step(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    clean((v / step).round() * step, step)
}

/// Turn a target notional into an order quantity. Truncated, never rounded
/// up: an order that ends below the venue minimums is rejected.
pub fn size_order(
    target_notional: f64,
    price: f64,
    meta: &MarketMeta,
) -> Result<OrderSizing, TradeError> {
    if !(price.is_finite() && price > 0.0) {
        return Err(TradeError::InvalidRequest(format!("unusable reference price {price}")));
    }
    if !(target_notional.is_finite() && target_notional > 0.0) {
        return Err(TradeError::InvalidRequest(format!("unusable notional {target_notional}")));
    }

    let quantity = floor_to_step(target_notional / price, meta.qty_step);
    let notional = quantity * price;
    if quantity <= 0.0 || quantity < meta.min_qty || notional < meta.min_notional {
        return Err(TradeError::BelowVenueMinimum {
            quantity,
            notional,
            min_quantity: meta.min_qty,
            min_notional: meta.min_notional,
        });
    }
    Ok(OrderSizing { quantity, notional })
}

/// Levels for a fresh position, rounded to the venue price step.
pub fn entry_levels(
    side: Side,
    entry: f64,
    volatility: f64,
    profit_target_pct: f64,
    trail: &TrailParams,
    price_step: f64,
) -> EntryLevels {
    let dist = trailing::trail_distance(entry, volatility, trail);
    let (stop, target) = match side {
        Side::Long => (entry - dist, entry + entry * profit_target_pct),
        Side::Short => (entry + dist, entry - entry * profit_target_pct),
    };
    EntryLevels {
        stop_loss: round_to_step(stop, price_step),
        target: round_to_step(target, price_step),
        // the extremum starts at entry, so the first trail equals the static stop
        trailing_stop: round_to_step(stop, price_step),
        trail_distance: dist,
    }
}

// ======================================================================
// UNIT TESTS
// ======================================================================
