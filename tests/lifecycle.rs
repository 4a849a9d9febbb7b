mod common;

use std::time::Duration;

use chrono::Utc;

use common::*;
use raptor_divergence::services::exchange::TriggerKind;
use raptor_divergence::services::position::{ActivePosition, ExitReason, PositionRecord, PositionState};
use raptor_divergence::services::scheduler::{fast_tick, strategy_tick, TickOutcome};
use raptor_divergence::services::strategies::{OrderSide, Side};
use raptor_divergence::utils::errors::{ApiError, TradeError};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn active(record: Option<PositionRecord>) -> ActivePosition {
    match record {
        Some(PositionRecord::Active(p)) => p,
        other => panic!("expected an active record, got {other:?}"),
    }
}

fn long_at_100() -> ActivePosition {
    ActivePosition {
        side: Side::Long,
        quantity: 14.0,
        entry_price: 100.0,
        stop_loss_price: 98.9,
        target_price: 101.0,
        volatility_at_entry: 1.0,
        extremum: 100.0,
        trailing_stop: 98.9,
        protective_order_ids: vec![],
        closing: false,
        close_attempts: 0,
        opened_at: Utc::now(),
    }
}

/*──────────────────────────────────────────────────────────────────────────*/
/* full lifecycle                                                          */
/*──────────────────────────────────────────────────────────────────────────*/

#[tokio::test]
async fn long_trade_trails_up_and_stops_out() {
    let h = harness(params(), None).await;

    let pos = h.engine.enter(Side::Long, 100.0, 1.0).await.unwrap();
    assert!(approx(pos.stop_loss_price, 98.9));
    assert!(approx(pos.target_price, 101.0));
    assert!(approx(pos.trailing_stop, 98.9));
    assert_eq!(
        h.venue.orders(),
        vec![SentOrder { side: OrderSide::Buy, quantity: 14.0, reduce_only: false }]
    );
    let triggers = h.venue.triggers();
    assert_eq!(triggers.len(), 2);
    assert_eq!(triggers[0].kind, TriggerKind::StopLoss);
    assert!(approx(triggers[0].trigger_price, 98.9));
    assert_eq!(triggers[1].kind, TriggerKind::TakeProfit);
    assert!(approx(triggers[1].trigger_price, 101.0));

    // the poller ignores the target but ratchets the stop
    h.venue.set_ticker(105.0);
    assert_eq!(fast_tick(&h.engine).await.unwrap(), TickOutcome::Holding);
    let rec = active(h.store.snapshot());
    assert!(approx(rec.trailing_stop, 103.9));
    assert!(approx(rec.extremum, 105.0));

    h.venue.set_ticker(103.8);
    assert_eq!(
        fast_tick(&h.engine).await.unwrap(),
        TickOutcome::Closed(ExitReason::TrailingStop)
    );
    assert_eq!(h.store.snapshot(), Some(PositionRecord::Flat));
    assert_eq!(
        h.venue.closes(),
        vec![SentOrder { side: OrderSide::Sell, quantity: 14.0, reduce_only: true }]
    );
    assert_eq!(h.venue.cancels().len(), 2);
    assert!(h.venue.position().is_flat());
}

#[tokio::test]
async fn cycle_enters_on_bullish_divergence() {
    let h = harness(params(), None).await;
    h.venue.set_candles(bullish_divergence_candles());

    assert_eq!(strategy_tick(&h.engine).await.unwrap(), TickOutcome::Entered(Side::Long));

    let rec = active(h.store.snapshot());
    assert_eq!(rec.side, Side::Long);
    assert!(approx(rec.entry_price, 98.5));
    assert!(rec.stop_loss_price < rec.entry_price && rec.target_price > rec.entry_price);
    assert_eq!(rec.protective_order_ids.len(), 2);
    let orders = h.venue.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert!(!orders[0].reduce_only);
}

#[tokio::test]
async fn cycle_takes_profit_at_target() {
    let h = harness(params(), Some(PositionRecord::Active(long_at_100()))).await;
    h.venue.set_position(Side::Long, 14.0);
    h.venue.set_candles(flat_candles(200, 101.2));

    assert_eq!(
        strategy_tick(&h.engine).await.unwrap(),
        TickOutcome::Closed(ExitReason::ProfitTarget)
    );
    assert_eq!(h.venue.closes().len(), 1);
    assert_eq!(h.store.snapshot(), Some(PositionRecord::Flat));
}

#[tokio::test]
async fn cycle_persists_holding_progress() {
    let h = harness(params(), Some(PositionRecord::Active(long_at_100()))).await;
    h.venue.set_position(Side::Long, 14.0);
    h.venue.set_candles(flat_candles(200, 100.5));

    assert_eq!(strategy_tick(&h.engine).await.unwrap(), TickOutcome::Holding);
    let rec = active(h.store.snapshot());
    assert!(approx(rec.extremum, 100.5));
    assert!(rec.trailing_stop > 98.9);
    assert!(h.venue.orders().is_empty());
}

#[tokio::test]
async fn short_history_skips_the_cycle() {
    let h = harness(params(), None).await;
    h.venue.set_candles(bullish_divergence_candles()[..150].to_vec());
    assert_eq!(
        strategy_tick(&h.engine).await.unwrap(),
        TickOutcome::Skipped("insufficient history")
    );
    assert!(h.venue.orders().is_empty());
}

#[tokio::test]
async fn quiet_market_means_no_signal() {
    let h = harness(params(), None).await;
    h.venue.set_candles(flat_candles(200, 3.0));
    assert_eq!(strategy_tick(&h.engine).await.unwrap(), TickOutcome::NoSignal);
    assert_eq!(h.store.snapshot(), None);
}

/*──────────────────────────────────────────────────────────────────────────*/
/* entry failures                                                          */
/*──────────────────────────────────────────────────────────────────────────*/

#[tokio::test]
async fn entry_below_minimum_notional_sends_nothing() {
    let p = params();
    let policy = p.retry_policy();
    let h = harness_with_policy(
        raptor_divergence::config::settings::StrategyParams { order_notional: 5.5, ..p },
        None,
        policy,
    )
    .await;
    // qty step 0.1 at price 60 → 0.0 after truncation → rejected
    let err = h.engine.enter(Side::Long, 60.0, 1.0).await.unwrap_err();
    assert!(matches!(err, TradeError::BelowVenueMinimum { .. }), "{err}");
    assert!(h.venue.orders().is_empty());
    assert_eq!(h.store.snapshot(), None);
    assert_eq!(h.engine.desk().snapshot().await.unwrap().1, PositionState::Flat);
}

#[tokio::test]
async fn rejected_entry_order_leaves_record_flat() {
    let h = harness(params(), None).await;
    h.venue.fail_next_orders(1);

    let err = h.engine.enter(Side::Short, 100.0, 1.0).await.unwrap_err();
    assert!(matches!(err, TradeError::Api(ApiError::Venue { .. })));
    assert_eq!(h.store.snapshot(), None);
    assert!(h.venue.triggers().is_empty());

    // and the desk accepts the next attempt
    let pos = h.engine.enter(Side::Short, 100.0, 1.0).await.unwrap();
    assert!(approx(pos.stop_loss_price, 101.1));
    assert!(approx(pos.target_price, 99.0));
}

#[tokio::test]
async fn entry_outlives_an_abandoned_tick() {
    let h = harness(params(), None).await;
    h.venue.delay_orders(Duration::from_millis(200));

    let cut = tokio::time::timeout(Duration::from_millis(50), h.engine.enter(Side::Long, 100.0, 1.0)).await;
    assert!(cut.is_err());

    // the order was already on its way; the entry finishes without the tick
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.engine.desk().snapshot().await.unwrap().1, PositionState::Active);
    assert_eq!(active(h.store.snapshot()).side, Side::Long);
    assert_eq!(h.venue.position().side, Some(Side::Long));

    h.venue.set_candles(flat_candles(200, 100.0));
    assert_eq!(strategy_tick(&h.engine).await.unwrap(), TickOutcome::Holding);
}

#[tokio::test]
async fn rejected_entry_in_an_abandoned_tick_frees_the_desk() {
    let h = harness(params(), None).await;
    h.venue.delay_orders(Duration::from_millis(200));
    h.venue.fail_next_orders(1);

    let cut = tokio::time::timeout(Duration::from_millis(50), h.engine.enter(Side::Long, 100.0, 1.0)).await;
    assert!(cut.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.engine.desk().snapshot().await.unwrap().1, PositionState::Flat);
    assert_eq!(h.store.snapshot(), None);

    // next cycle is free to enter again
    h.venue.set_candles(bullish_divergence_candles());
    assert_eq!(strategy_tick(&h.engine).await.unwrap(), TickOutcome::Entered(Side::Long));
}

/*──────────────────────────────────────────────────────────────────────────*/
/* reconciliation                                                          */
/*──────────────────────────────────────────────────────────────────────────*/

#[tokio::test]
async fn active_record_with_flat_venue_is_reset() {
    let h = harness(params(), Some(PositionRecord::Active(long_at_100()))).await;
    assert_eq!(strategy_tick(&h.engine).await.unwrap(), TickOutcome::Reconciled);
    assert_eq!(h.store.snapshot(), Some(PositionRecord::Flat));
    assert!(h.venue.orders().is_empty());
}

#[tokio::test]
async fn foreign_venue_position_needs_an_operator() {
    let h = harness(params(), None).await;
    h.venue.set_position(Side::Long, 3.0);
    h.venue.set_candles(bullish_divergence_candles());

    let err = strategy_tick(&h.engine).await.unwrap_err();
    assert!(matches!(err, TradeError::ManualIntervention(_)));
    assert!(h.venue.orders().is_empty());
    assert_eq!(h.store.snapshot(), None);
}

#[tokio::test]
async fn poller_does_not_reconcile() {
    let h = harness(params(), None).await;
    h.venue.set_position(Side::Long, 3.0);
    assert_eq!(
        fast_tick(&h.engine).await.unwrap(),
        TickOutcome::Skipped("no active position")
    );
}

/*──────────────────────────────────────────────────────────────────────────*/
/* close failures and races                                                */
/*──────────────────────────────────────────────────────────────────────────*/

#[tokio::test]
async fn failed_close_stays_closing_until_a_retry_succeeds() {
    let h = harness_with_policy(params(), None, eager_retries()).await;
    h.engine.enter(Side::Long, 100.0, 1.0).await.unwrap();

    h.venue.fail_next_orders(1);
    h.venue.set_ticker(98.0);
    assert!(fast_tick(&h.engine).await.is_err());

    let rec = active(h.store.snapshot());
    assert!(rec.closing);
    assert_eq!(rec.close_attempts, 1);
    assert!(h.venue.closes().is_empty());

    // the cycle skips its normal work while a close is pending and retries it
    h.venue.set_candles(bullish_divergence_candles());
    assert_eq!(
        strategy_tick(&h.engine).await.unwrap(),
        TickOutcome::Closed(ExitReason::Retry)
    );
    assert_eq!(h.venue.closes().len(), 1);
    assert_eq!(h.store.snapshot(), Some(PositionRecord::Flat));
}

#[tokio::test]
async fn close_failure_backs_off_with_the_default_policy() {
    let h = harness(params(), None).await;
    h.engine.enter(Side::Long, 100.0, 1.0).await.unwrap();
    h.venue.fail_next_orders(1);
    h.venue.set_ticker(98.0);
    assert!(fast_tick(&h.engine).await.is_err());

    assert_eq!(fast_tick(&h.engine).await.unwrap(), TickOutcome::CloseBackoff);
    assert!(h.venue.closes().is_empty());
}

#[tokio::test]
async fn exhausted_retries_surface_as_manual_intervention() {
    let h = harness_with_policy(params(), None, eager_retries()).await;
    h.engine.enter(Side::Long, 100.0, 1.0).await.unwrap();
    h.venue.fail_next_orders(3);
    h.venue.set_ticker(98.0);

    assert!(fast_tick(&h.engine).await.is_err());
    assert!(fast_tick(&h.engine).await.is_err());
    assert!(fast_tick(&h.engine).await.is_err());
    assert_eq!(fast_tick(&h.engine).await.unwrap(), TickOutcome::CloseBackoff);
    assert!(matches!(
        strategy_tick(&h.engine).await,
        Err(TradeError::ManualIntervention(_))
    ));
    assert!(active(h.store.snapshot()).closing);

    // someone flattens it by hand; the next cycle notices
    h.venue.flatten();
    assert_eq!(strategy_tick(&h.engine).await.unwrap(), TickOutcome::Reconciled);
    assert_eq!(h.store.snapshot(), Some(PositionRecord::Flat));
    assert!(h.venue.closes().is_empty());
}

#[tokio::test]
async fn venue_already_flat_resets_without_an_order() {
    let h = harness(params(), Some(PositionRecord::Active(long_at_100()))).await;
    h.venue.set_ticker(98.0);
    assert_eq!(
        fast_tick(&h.engine).await.unwrap(),
        TickOutcome::Closed(ExitReason::TrailingStop)
    );
    assert!(h.venue.orders().is_empty());
    assert_eq!(h.store.snapshot(), Some(PositionRecord::Flat));
}

#[tokio::test]
async fn concurrent_drivers_send_one_close() {
    let h = harness(params(), None).await;
    h.engine.enter(Side::Long, 100.0, 1.0).await.unwrap();
    h.venue.delay_orders(Duration::from_millis(50));
    h.venue.set_ticker(98.0);
    h.venue.set_candles(flat_candles(200, 98.0));

    let (fast, slow) = tokio::join!(fast_tick(&h.engine), strategy_tick(&h.engine));
    fast.unwrap();
    slow.unwrap();

    assert_eq!(h.venue.closes().len(), 1);
    assert_eq!(h.store.snapshot(), Some(PositionRecord::Flat));
}
