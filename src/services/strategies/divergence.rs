//! RSI / price divergence on confirmed swing points.
//!
//! A swing low is a bar whose low is the minimum of the lows within
//! `swing_window` bars on either side (mirror for swing highs), so a swing can
//! only be confirmed `swing_window` bars after it printed. Ties count: both
//! bars of a flat double bottom are swing lows. Each price swing is
//! paired with the oscillator extremum found within `align_window` bars of it.
//!
//! * bullish: the latest swing low undercuts the previous one while its paired
//!   RSI low is higher
//! * bearish: the latest swing high exceeds the previous one while its paired
//!   RSI high is lower
//!
//! Only the final candle is evaluated, and only while the latest swing is
//! still fresh. Nothing is queued: a signal not acted on this cycle is gone.

use serde::Deserialize;

use crate::services::indicators::IndicatorSeries;
use crate::services::strategies::Candle;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DivergenceConfig {
    /// Bars required on each side to confirm a swing.
    pub swing_window: usize,
    /// Max bar distance between a price swing and its paired RSI extremum.
    pub align_window: usize,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self { swing_window: 4, align_window: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceSignal {
    None,
    Bullish,
    Bearish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwingPoint {
    pub index: usize,
    pub price: f64,
    pub oscillator: f64,
    pub kind: SwingKind,
}

/// All confirmed swings of `kind`, oldest first. Swings with no defined
/// oscillator value nearby are skipped.
pub fn find_swings(
    candles: &[Candle],
    oscillator: &[Option<f64>],
    cfg: &DivergenceConfig,
    kind: SwingKind,
) -> Vec<SwingPoint> {
    let w = cfg.swing_window;
    let n = candles.len().min(oscillator.len());
    if w == 0 || n < 2 * w + 1 {
        return Vec::new();
    }

    let price = |i: usize| match kind {
        SwingKind::High => candles[i].high,
        SwingKind::Low => candles[i].low,
    };

    (w..n - w)
        .filter(|&i| {
            let p = price(i);
            (i - w..=i + w).filter(|&j| j != i).all(|j| match kind {
                SwingKind::High => p >= price(j),
                SwingKind::Low => p <= price(j),
            })
        })
        .filter_map(|i| {
            paired_oscillator(oscillator, i, cfg.align_window, kind).map(|osc| SwingPoint {
                index: i,
                price: price(i),
                oscillator: osc,
                kind,
            })
        })
        .collect()
}

fn paired_oscillator(
    oscillator: &[Option<f64>],
    index: usize,
    align: usize,
    kind: SwingKind,
) -> Option<f64> {
    let lo = index.saturating_sub(align);
    let hi = (index + align).min(oscillator.len() - 1);
    let values = oscillator[lo..=hi].iter().flatten().copied();
    match kind {
        SwingKind::Low => values.reduce(f64::min),
        SwingKind::High => values.reduce(f64::max),
    }
}

/// Evaluate the final candle of `candles`. Bullish wins if both fire.
pub fn detect(
    candles: &[Candle],
    series: &IndicatorSeries,
    cfg: &DivergenceConfig,
) -> DivergenceSignal {
    if candles.is_empty() {
        return DivergenceSignal::None;
    }
    let last = candles.len() - 1;
    let fresh = |s: &SwingPoint| last - s.index <= cfg.swing_window;

    let lows = find_swings(candles, &series.rsi, cfg, SwingKind::Low);
    if let [.., prev, latest] = lows.as_slice() {
        if fresh(latest) && latest.price < prev.price && latest.oscillator > prev.oscillator {
            log::debug!(
                "bullish divergence: low {:.4}@{} -> {:.4}@{}, rsi {:.2} -> {:.2}",
                prev.price, prev.index, latest.price, latest.index, prev.oscillator, latest.oscillator
            );
            return DivergenceSignal::Bullish;
        }
    }

    let highs = find_swings(candles, &series.rsi, cfg, SwingKind::High);
    if let [.., prev, latest] = highs.as_slice() {
        if fresh(latest) && latest.price > prev.price && latest.oscillator < prev.oscillator {
            log::debug!(
                "bearish divergence: high {:.4}@{} -> {:.4}@{}, rsi {:.2} -> {:.2}",
                prev.price, prev.index, latest.price, latest.index, prev.oscillator, latest.oscillator
            );
            return DivergenceSignal::Bearish;
        }
    }

    DivergenceSignal::None
}
