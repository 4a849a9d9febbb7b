//! RSI and ATR over a candle series, both with Wilder smoothing.
//!
//! Each value depends on the whole prefix, so callers should hand in
//! 10-20x the period of history and treat the early output as warm-up.

use crate::services::strategies::Candle;

/// Per-candle oscillator (RSI, 0-100) and volatility (ATR, >= 0), aligned by
/// index to the input candles. `None` where history is still insufficient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorSeries {
    pub rsi: Vec<Option<f64>>,
    pub atr: Vec<Option<f64>>,
}

impl IndicatorSeries {
    pub fn len(&self) -> usize {
        self.rsi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rsi.is_empty()
    }

    /// ATR of the final candle, if defined.
    pub fn last_atr(&self) -> Option<f64> {
        self.atr.last().copied().flatten()
    }
}

pub fn compute(candles: &[Candle], rsi_period: usize, atr_period: usize) -> IndicatorSeries {
    let mut rsi = Rsi::new(rsi_period);
    let mut atr = Atr::new(atr_period);
    let mut out = IndicatorSeries {
        rsi: Vec::with_capacity(candles.len()),
        atr: Vec::with_capacity(candles.len()),
    };
    for c in candles {
        out.rsi.push(rsi.update(c.close));
        out.atr.push(atr.update(c));
    }
    out
}

/// Streaming RSI: seeded with the simple mean of the first `window` changes.
#[derive(Debug, Clone)]
struct Rsi {
    window: usize,
    prev_close: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    count: usize,
}

impl Rsi {
    fn new(window: usize) -> Self {
        Self { window, prev_close: None, avg_gain: 0.0, avg_loss: 0.0, count: 0 }
    }

    fn update(&mut self, close: f64) -> Option<f64> {
        if self.window == 0 || !close.is_finite() {
            return None;
        }
        let prev = match self.prev_close.replace(close) {
            Some(p) => p,
            None => return None,
        };

        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let w = self.window as f64;

        self.count += 1;
        if self.count < self.window {
            self.avg_gain += gain;
            self.avg_loss += loss;
            return None;
        }
        if self.count == self.window {
            self.avg_gain = (self.avg_gain + gain) / w;
            self.avg_loss = (self.avg_loss + loss) / w;
        } else {
            self.avg_gain = (self.avg_gain * (w - 1.0) + gain) / w;
            self.avg_loss = (self.avg_loss * (w - 1.0) + loss) / w;
        }

        Some(if self.avg_loss == 0.0 {
            if self.avg_gain == 0.0 { 50.0 } else { 100.0 }
        } else {
            100.0 - 100.0 / (1.0 + self.avg_gain / self.avg_loss)
        })
    }
}

/// Streaming ATR: SMA of the first `window` true ranges, then Wilder.
#[derive(Debug, Clone)]
struct Atr {
    window: usize,
    prev_close: Option<f64>,
    value: f64,
    count: usize,
}

impl Atr {
    fn new(window: usize) -> Self {
        Self { window, prev_close: None, value: 0.0, count: 0 }
    }

    fn update(&mut self, c: &Candle) -> Option<f64> {
        if self.window == 0 {
            return None;
        }
        let tr = c.true_range(self.prev_close);
        self.prev_close = Some(c.close);
        let w = self.window as f64;

        self.count += 1;
        if self.count < self.window {
            self.value += tr;
            return None;
        }
        if self.count == self.window {
            self.value = (self.value + tr) / w;
        } else {
            self.value = (self.value * (w - 1.0) + tr) / w;
        }
        Some(self.value.max(0.0))
    }
}
