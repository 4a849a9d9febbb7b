//! The two periodic drivers.
//!
//! * strategy cycle – slow; reconciles with the venue, pulls candles, runs
//!   indicators and divergence, drives entries and full exit checks
//! * fast stop poller – pulls only the ticker and re-checks the trailing stop
//!
//! Each tick is one bounded unit of work. Whatever goes wrong inside it is
//! logged at the tick boundary and the ticker keeps going.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::services::indicators;
use crate::services::position::{Evaluation, ExitCheck, ExitReason, PositionRecord, PositionState, RetryClaim};
use crate::services::strategies::{divergence, DivergenceSignal, Side};
use crate::services::trading_engine::TradingEngine;
use crate::utils::errors::TradeError;

/// What one tick ended up doing. Mostly for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped(&'static str),
    NoSignal,
    Entered(Side),
    Holding,
    Closed(ExitReason),
    /// Record was active but the venue is flat.
    Reconciled,
    /// A close is pending but not ours to retry yet.
    CloseBackoff,
}

/// Hand an exit ticket to the engine, or report the holding position.
async fn act_on(engine: &TradingEngine, eval: Evaluation, price: f64) -> Result<TickOutcome, TradeError> {
    match eval {
        Evaluation::Exit(ticket) => {
            let reason = ticket.reason;
            engine.close(ticket).await?;
            Ok(TickOutcome::Closed(reason))
        }
        Evaluation::Holding { update, position } => {
            if update.ratcheted {
                log::info!(
                    "{}: trailing stop moved to {:.6} (extremum {}, trail {:.6})",
                    engine.params().symbol, update.stop, update.extremum, update.trail_distance
                );
            }
            log::info!(
                "{}: holding {} | entry {} | now {} | SL {} | TP {} | TSL {:.6} | P/L {:.2}%",
                engine.params().symbol,
                position.side.as_str(),
                position.entry_price,
                price,
                position.stop_loss_price,
                position.target_price,
                position.trailing_stop,
                position.pnl_pct(price)
            );
            Ok(TickOutcome::Holding)
        }
        Evaluation::Idle(PositionState::Closing) => Ok(TickOutcome::CloseBackoff),
        Evaluation::Idle(_) => Ok(TickOutcome::Skipped("no active position")),
    }
}

/// A record stuck in CLOSING: retry when the policy allows.
async fn retry_close(engine: &TradingEngine, loud: bool) -> Result<TickOutcome, TradeError> {
    match engine.desk().claim_close_retry().await? {
        RetryClaim::Claimed(ticket) => {
            engine.close(ticket).await?;
            Ok(TickOutcome::Closed(ExitReason::Retry))
        }
        RetryClaim::NotClosing => Ok(TickOutcome::Skipped("nothing to close")),
        RetryClaim::InFlight => {
            log::debug!("{}: close in flight, skipping", engine.params().symbol);
            Ok(TickOutcome::CloseBackoff)
        }
        RetryClaim::Backoff(wait) => {
            log::debug!("{}: next close attempt in {:?}", engine.params().symbol, wait);
            Ok(TickOutcome::CloseBackoff)
        }
        RetryClaim::Exhausted(attempts) if loud => {
            // retries are over, but a venue that went flat still clears the record
            let symbol = &engine.params().symbol;
            if engine.exchange().fetch_position(symbol).await?.is_flat() {
                log::warn!("{symbol}: venue is flat after {attempts} failed closes; resetting");
                engine.desk().reset("venue reports flat").await?;
                return Ok(TickOutcome::Reconciled);
            }
            Err(TradeError::ManualIntervention(format!(
                "{symbol}: close failed {attempts} times, position left open with closing set"
            )))
        }
        RetryClaim::Exhausted(_) => Ok(TickOutcome::CloseBackoff),
    }
}

/// One strategy cycle.
pub async fn strategy_tick(engine: &TradingEngine) -> Result<TickOutcome, TradeError> {
    let params = engine.params();
    let symbol = params.symbol.as_str();
    log::info!("--- divergence cycle {symbol} [{}] ---", params.bar);

    let (record, state) = engine.desk().snapshot().await?;
    if state == PositionState::Closing {
        log::info!("{symbol}: close pending, skipping cycle");
        return retry_close(engine, true).await;
    }

    // ── reconcile ──────────────────────────────────────────────
    let venue = engine.exchange().fetch_position(symbol).await?;
    match (&record, venue.is_flat()) {
        (PositionRecord::Active(p), true) => {
            log::warn!(
                "{symbol}: record holds {} {} but venue is flat; resetting",
                p.side.as_str(), p.quantity
            );
            engine.desk().reset("venue reports flat").await?;
            return Ok(TickOutcome::Reconciled);
        }
        (PositionRecord::Active(p), false) if venue.side != Some(p.side) => {
            return Err(TradeError::ManualIntervention(format!(
                "{symbol}: record holds {} but venue holds {:?} {}",
                p.side.as_str(), venue.side, venue.quantity
            )));
        }
        (PositionRecord::Flat, false) => {
            return Err(TradeError::ManualIntervention(format!(
                "{symbol}: venue holds {:?} {} with no local record",
                venue.side, venue.quantity
            )));
        }
        _ => {}
    }

    // ── data & indicators ──────────────────────────────────────
    let candles = engine.exchange().fetch_candles(symbol, &params.bar, params.fetch_limit).await?;
    if candles.len() < params.fetch_limit {
        log::warn!("{symbol}: insufficient candle data ({} of {}), skipping", candles.len(), params.fetch_limit);
        return Ok(TickOutcome::Skipped("insufficient history"));
    }
    let series = indicators::compute(&candles, params.rsi_period, params.atr_period);
    let price = match candles.last() {
        Some(c) => c.close,
        None => return Ok(TickOutcome::Skipped("no candles")),
    };

    // ── exit ───────────────────────────────────────────────────
    if record.is_active() {
        let eval = engine.desk().observe(price, ExitCheck::Full).await?;
        return act_on(engine, eval, price).await;
    }

    // ── entry ──────────────────────────────────────────────────
    let side = match divergence::detect(&candles, &series, &params.divergence()) {
        DivergenceSignal::Bullish => Side::Long,
        DivergenceSignal::Bearish => Side::Short,
        DivergenceSignal::None => {
            log::info!("{symbol}: no entry conditions met");
            return Ok(TickOutcome::NoSignal);
        }
    };
    let volatility = match series.last_atr() {
        Some(v) if v.is_finite() && v > 0.0 => v,
        other => {
            log::warn!("{symbol}: {} signal but no usable ATR ({other:?}), skipping", side.as_str());
            return Ok(TickOutcome::Skipped("no volatility"));
        }
    };
    log::info!("{symbol}: {} divergence at {price}, ATR {volatility:.6}", side.as_str());
    engine.enter(side, price, volatility).await?;
    Ok(TickOutcome::Entered(side))
}

/// One fast-poller tick: ticker price against the trailing stop only.
pub async fn fast_tick(engine: &TradingEngine) -> Result<TickOutcome, TradeError> {
    let (_, state) = engine.desk().snapshot().await?;
    match state {
        PositionState::Closing => return retry_close(engine, false).await,
        PositionState::Active => {}
        _ => return Ok(TickOutcome::Skipped("no active position")),
    }
    let price = engine.exchange().fetch_ticker(&engine.params().symbol).await?;
    let eval = engine.desk().observe(price, ExitCheck::TrailingOnly).await?;
    act_on(engine, eval, price).await
}

/// Run `tick` every `period`, first one `period` from now, until `shutdown`
/// flips. Each tick is capped at `budget`; errors are logged, never propagated.
pub async fn run_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    budget: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TickOutcome, TradeError>>,
{
    let mut iv = interval_at(Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = iv.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match tokio::time::timeout(budget, tick()).await {
            Ok(Ok(outcome)) => log::debug!("{name}: {outcome:?}"),
            Ok(Err(e)) => log_tick_error(name, &e),
            Err(_) => log::warn!("{name}: tick exceeded {budget:?}, abandoned"),
        }
    }
    log::info!("{name}: stopped");
}

pub fn log_tick_error(name: &str, e: &TradeError) {
    match e {
        TradeError::ManualIntervention(_) => log::error!("{name}: {e}"),
        TradeError::BelowVenueMinimum { .. } => log::error!("{name}: entry skipped: {e}"),
        e if e.is_transient() => log::warn!("{name}: transient failure, retrying next tick: {e}"),
        e => log::error!("{name}: {e}"),
    }
}
