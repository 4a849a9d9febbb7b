// src/services/trading_engine.rs

//! Venue-facing halves of the position lifecycle: opening a position and
//! running a close sequence. Both drivers go through here, and every state
//! change goes through the desk.

use std::sync::Arc;

use chrono::Utc;

use crate::config::settings::StrategyParams;
use crate::services::exchange::{CancelOutcome, ExchangeClient, MarketMeta, TriggerKind};
use crate::services::position::{ActivePosition, CloseTicket};
use crate::services::position_desk::DeskHandle;
use crate::services::risk;
use crate::services::strategies::Side;
use crate::services::trailing::TrailParams;
use crate::utils::errors::TradeError;

/// Shared context handed to both drivers. Cheap to clone.
#[derive(Clone)]
pub struct TradingEngine {
    exchange: Arc<dyn ExchangeClient>,
    desk: DeskHandle,
    market: MarketMeta,
    params: Arc<StrategyParams>,
}

impl TradingEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        desk: DeskHandle,
        market: MarketMeta,
        params: Arc<StrategyParams>,
    ) -> Self {
        Self { exchange, desk, market, params }
    }

    pub fn exchange(&self) -> &dyn ExchangeClient {
        self.exchange.as_ref()
    }

    pub fn desk(&self) -> &DeskHandle {
        &self.desk
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    pub fn market(&self) -> &MarketMeta {
        &self.market
    }

    pub fn trail(&self) -> TrailParams {
        self.params.trail()
    }

    /// FLAT → ENTERING → ACTIVE on its own task, so an entry order that is
    /// already out always ends in ACTIVE or FLAT even if the tick is dropped.
    pub async fn enter(&self, side: Side, price: f64, volatility: f64) -> Result<ActivePosition, TradeError> {
        let engine = self.clone();
        tokio::spawn(async move { engine.execute_entry(side, price, volatility).await })
            .await
            .map_err(|e| TradeError::ManualIntervention(format!("entry task died: {e}")))?
    }

    /// On any failure before the entry order is accepted the desk returns
    /// to FLAT and nothing is persisted.
    pub async fn execute_entry(&self, side: Side, price: f64, volatility: f64) -> Result<ActivePosition, TradeError> {
        self.desk.begin_entry().await?;
        match self.open(side, price, volatility).await {
            Ok(position) => {
                self.desk.complete_entry(position.clone()).await?;
                log::info!(
                    "{} {} entered: {} @ {} | SL {} | TP {} | TSL {} | protective orders {:?}",
                    self.params.symbol,
                    side.as_str(),
                    position.quantity,
                    position.entry_price,
                    position.stop_loss_price,
                    position.target_price,
                    position.trailing_stop,
                    position.protective_order_ids
                );
                Ok(position)
            }
            Err(e) => {
                self.desk.abort_entry().await?;
                Err(e)
            }
        }
    }

    async fn open(&self, side: Side, price: f64, volatility: f64) -> Result<ActivePosition, TradeError> {
        let symbol = &self.params.symbol;
        let sizing = risk::size_order(self.params.order_notional, price, &self.market)?;
        log::info!(
            "{symbol}: attempting {} entry, {} @ market (~{:.2} notional, min qty {}, min notional {})",
            side.as_str(),
            sizing.quantity,
            sizing.notional,
            self.market.min_qty,
            self.market.min_notional
        );

        let order_id = self
            .exchange
            .submit_market_order(symbol, side.entry_order(), sizing.quantity, false)
            .await?;
        log::info!("{symbol}: entry order placed: {order_id}");

        let trail = self.trail();
        let levels = risk::entry_levels(
            side,
            price,
            volatility,
            self.params.profit_target_pct,
            &trail,
            self.market.price_step,
        );

        let mut protective_order_ids = Vec::new();
        if self.params.place_protective_orders {
            for (kind, trigger) in [(TriggerKind::StopLoss, levels.stop_loss), (TriggerKind::TakeProfit, levels.target)] {
                match self
                    .exchange
                    .submit_stop_order(symbol, side.exit_order(), sizing.quantity, trigger, kind, true)
                    .await
                {
                    Ok(id) => {
                        log::info!("{symbol}: {kind:?} order placed: {id} at {trigger}");
                        protective_order_ids.push(id);
                    }
                    // the position is open either way; the drivers still guard it
                    Err(e) => log::warn!("{symbol}: failed to place {kind:?} order at {trigger}: {e}"),
                }
            }
        }

        Ok(ActivePosition {
            side,
            quantity: sizing.quantity,
            entry_price: price,
            stop_loss_price: levels.stop_loss,
            target_price: levels.target,
            volatility_at_entry: volatility,
            extremum: price,
            trailing_stop: levels.trailing_stop,
            protective_order_ids,
            closing: false,
            close_attempts: 0,
            opened_at: Utc::now(),
        })
    }

    /// Run a close sequence on its own task so it completes even if the
    /// tick that started it is abandoned.
    pub async fn close(&self, ticket: CloseTicket) -> Result<(), TradeError> {
        let engine = self.clone();
        tokio::spawn(async move { engine.execute_close(ticket).await })
            .await
            .map_err(|e| TradeError::ManualIntervention(format!("close task died: {e}")))?
    }

    /// Run one close sequence for a ticket the desk handed out. The record
    /// is already persisted with `closing = true`.
    pub async fn execute_close(&self, ticket: CloseTicket) -> Result<(), TradeError> {
        let symbol = &self.params.symbol;
        let pos = &ticket.position;
        match ticket.price {
            Some(p) => log::info!(
                "{symbol}: EXIT on {} at {p} (TSL {}, TP {}); closing {} position, attempt {}",
                ticket.reason, pos.trailing_stop, pos.target_price, pos.side.as_str(), ticket.attempt
            ),
            None => log::info!(
                "{symbol}: {}: closing {} position, attempt {}",
                ticket.reason, pos.side.as_str(), ticket.attempt
            ),
        }

        for id in &pos.protective_order_ids {
            match self.exchange.cancel_order(id, symbol).await {
                Ok(CancelOutcome::Cancelled) => log::info!("{symbol}: cancelled resting order {id}"),
                Ok(CancelOutcome::NotFound) => log::debug!("{symbol}: resting order {id} already gone"),
                Err(e) => log::warn!("{symbol}: failed to cancel order {id}: {e}"),
            }
        }

        match self.flatten(pos.side).await {
            Ok(()) => {
                self.desk.reset(format!("closed on {}", ticket.reason)).await?;
                log::info!("{symbol}: position closed, record reset");
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "{symbol}: close of {} {} FAILED (attempt {}): {e}",
                    pos.side.as_str(), pos.quantity, ticket.attempt
                );
                self.desk.close_failed().await?;
                Err(e)
            }
        }
    }

    /// Reduce-only market order for whatever the venue says we hold.
    async fn flatten(&self, local_side: Side) -> Result<(), TradeError> {
        let symbol = &self.params.symbol;
        let venue = self.exchange.fetch_position(symbol).await?;
        if venue.is_flat() {
            log::info!("{symbol}: venue already flat, no close order needed");
            return Ok(());
        }
        let side = venue.side.unwrap_or(local_side);
        if side != local_side {
            log::warn!(
                "{symbol}: venue holds {} while record says {}; closing venue position",
                side.as_str(), local_side.as_str()
            );
        }
        let order_id = self
            .exchange
            .submit_market_order(symbol, side.exit_order(), venue.quantity, true)
            .await?;
        log::info!("{symbol}: market close order placed: {order_id} ({})", venue.quantity);
        Ok(())
    }
}
