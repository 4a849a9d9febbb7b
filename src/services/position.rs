//! The single position record and the state machine that mutates it.
//!
//! ```text
//! FLAT ──begin_entry──▶ ENTERING ──complete_entry──▶ ACTIVE ──exit──▶ CLOSING ──confirmed──▶ FLAT
//!                          └──abort_entry──▶ FLAT                       │  ▲
//!                                                                  failed│  │claim retry
//!                                                                        ▼  │
//!                                                                 CLOSING (backoff)
//! ```
//!
//! `PositionBook` is plain synchronous code; serialisation and persistence
//! live in `position_desk`, which is the only owner of a book at runtime.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::strategies::Side;
use crate::services::trailing::{self, TrailParams, TrailUpdate};

/// Durable cross-cycle state. `Flat` carries no position fields at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PositionRecord {
    #[default]
    Flat,
    Active(ActivePosition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePosition {
    pub side: Side,
    /// Base-asset quantity the entry order asked for.
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub target_price: f64,
    pub volatility_at_entry: f64,
    /// Highest price since entry for longs, lowest for shorts.
    pub extremum: f64,
    pub trailing_stop: f64,
    pub protective_order_ids: Vec<String>,
    /// Set once an exit has been decided; only a reset clears it.
    pub closing: bool,
    /// Failed close attempts since `closing` was set.
    pub close_attempts: u32,
    pub opened_at: DateTime<Utc>,
}

impl ActivePosition {
    /// Unrealised P/L in percent at `price`.
    pub fn pnl_pct(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => (price / self.entry_price - 1.0) * 100.0,
            Side::Short => (self.entry_price / price - 1.0) * 100.0,
        }
    }
}

impl PositionRecord {
    pub fn active(&self) -> Option<&ActivePosition> {
        match self {
            PositionRecord::Active(p) => Some(p),
            PositionRecord::Flat => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    pub fn is_closing(&self) -> bool {
        self.active().map(|p| p.closing).unwrap_or(false)
    }

    pub fn stop_loss_price(&self) -> Option<f64> {
        self.active().map(|p| p.stop_loss_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Flat,
    Entering,
    Active,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TrailingStop,
    ProfitTarget,
    /// Re-issuing a close that failed earlier.
    Retry,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExitReason::TrailingStop => "trailing stop",
            ExitReason::ProfitTarget => "profit target",
            ExitReason::Retry => "close retry",
        })
    }
}

/// Which exits an observation may trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCheck {
    /// Strategy cycle: trailing stop, then profit target.
    Full,
    /// Fast poller: trailing stop only.
    TrailingOnly,
}

/// Permission to run one close sequence. Whoever holds it is the only close
/// in flight until it reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseTicket {
    pub position: ActivePosition,
    pub reason: ExitReason,
    pub price: Option<f64>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Idle(PositionState),
    Holding { update: TrailUpdate, position: ActivePosition },
    Exit(CloseTicket),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryClaim {
    Claimed(CloseTicket),
    NotClosing,
    InFlight,
    Backoff(Duration),
    Exhausted(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay after the `attempts`-th failure: base, 2x, 4x ... up to `cap`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    NotFlat,
    NotEntering,
}

impl std::fmt::Display for BookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookError::NotFlat => f.write_str("position is not flat"),
            BookError::NotEntering => f.write_str("no entry in progress"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionBook {
    record: PositionRecord,
    entering: bool,
    close_in_flight: bool,
    next_retry_at: Option<Instant>,
}

impl PositionBook {
    /// Wrap a loaded record. A record persisted mid-close is retryable at once.
    pub fn new(record: PositionRecord) -> Self {
        Self { record, entering: false, close_in_flight: false, next_retry_at: None }
    }

    pub fn record(&self) -> &PositionRecord {
        &self.record
    }

    pub fn state(&self) -> PositionState {
        match &self.record {
            PositionRecord::Flat if self.entering => PositionState::Entering,
            PositionRecord::Flat => PositionState::Flat,
            PositionRecord::Active(p) if p.closing => PositionState::Closing,
            PositionRecord::Active(_) => PositionState::Active,
        }
    }

    pub fn begin_entry(&mut self) -> Result<(), BookError> {
        if self.state() != PositionState::Flat {
            return Err(BookError::NotFlat);
        }
        self.entering = true;
        Ok(())
    }

    pub fn complete_entry(&mut self, position: ActivePosition) -> Result<(), BookError> {
        if !self.entering {
            return Err(BookError::NotEntering);
        }
        self.entering = false;
        self.record = PositionRecord::Active(ActivePosition {
            closing: false,
            close_attempts: 0,
            ..position
        });
        Ok(())
    }

    pub fn abort_entry(&mut self) {
        self.entering = false;
    }

    /// Feed one price. Ratchets the trailing stop and, if an exit fires,
    /// flips `closing` and hands out the close ticket.
    pub fn observe(&mut self, price: f64, trail: &TrailParams, check: ExitCheck) -> Evaluation {
        let state = self.state();
        let pos = match &mut self.record {
            PositionRecord::Active(p) if !p.closing => p,
            _ => return Evaluation::Idle(state),
        };

        let update = trailing::update(
            pos.side,
            price,
            pos.extremum,
            pos.trailing_stop,
            pos.volatility_at_entry,
            trail,
        );
        pos.extremum = update.extremum;
        pos.trailing_stop = update.stop;

        let reason = if trailing::stop_hit(pos.side, price, pos.trailing_stop) {
            Some(ExitReason::TrailingStop)
        } else if check == ExitCheck::Full && trailing::target_hit(pos.side, price, pos.target_price) {
            Some(ExitReason::ProfitTarget)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                pos.closing = true;
                self.close_in_flight = true;
                Evaluation::Exit(CloseTicket {
                    position: pos.clone(),
                    reason,
                    price: Some(price),
                    attempt: pos.close_attempts + 1,
                })
            }
            None => Evaluation::Holding { update, position: pos.clone() },
        }
    }

    pub fn claim_close_retry(&mut self, now: Instant, policy: &RetryPolicy) -> RetryClaim {
        let pos = match &self.record {
            PositionRecord::Active(p) if p.closing => p,
            _ => return RetryClaim::NotClosing,
        };
        if self.close_in_flight {
            return RetryClaim::InFlight;
        }
        if pos.close_attempts >= policy.max_attempts {
            return RetryClaim::Exhausted(pos.close_attempts);
        }
        if let Some(at) = self.next_retry_at {
            if now < at {
                return RetryClaim::Backoff(at - now);
            }
        }
        self.close_in_flight = true;
        RetryClaim::Claimed(CloseTicket {
            position: pos.clone(),
            reason: ExitReason::Retry,
            price: None,
            attempt: pos.close_attempts + 1,
        })
    }

    /// The close sequence failed. `closing` stays set; the next attempt waits
    /// out the backoff.
    pub fn close_failed(&mut self, now: Instant, policy: &RetryPolicy) {
        if let PositionRecord::Active(p) = &mut self.record {
            if p.closing {
                p.close_attempts += 1;
                self.next_retry_at = Some(now + policy.backoff(p.close_attempts));
            }
        }
        self.close_in_flight = false;
    }

    /// Back to the inactive template, after a confirmed close or a
    /// reconciliation that found the venue flat.
    pub fn reset(&mut self) {
        self.record = PositionRecord::Flat;
        self.entering = false;
        self.close_in_flight = false;
        self.next_retry_at = None;
    }
}
