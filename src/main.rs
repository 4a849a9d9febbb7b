use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use raptor_divergence::{
    config::settings::{Settings, StoreBackend},
    db::{
        position_store::{JsonFilePositionStore, PositionStore, RedisPositionStore},
        redis::RedisPool,
    },
    services::{
        blowfin::client::BlowfinClient,
        exchange::ExchangeClient,
        position_desk,
        scheduler::{self, fast_tick, strategy_tick},
        trading_engine::TradingEngine,
    },
    utils::errors::ConfigError,
};

fn init_logging() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    log::info!("Starting raptor-divergence…");

    let settings = Settings::new().context("loading settings")?;
    let params = Arc::new(settings.params.clone());

    let store: Arc<dyn PositionStore> = match &settings.store {
        StoreBackend::Redis { url, key } => {
            let redis = RedisPool::new(url).await.context("connecting to redis")?;
            redis.ping().await.context("redis ping")?;
            log::info!("position store: redis key {key}");
            Arc::new(RedisPositionStore::new(redis, key.clone()))
        }
        StoreBackend::File { path } => {
            log::info!("position store: {path}");
            Arc::new(JsonFilePositionStore::new(path))
        }
    };

    let client = BlowfinClient::new(
        settings.credentials.clone(),
        settings.is_demo(),
        params.margin_mode.clone(),
        params.request_timeout(),
    )
    .context("building venue client")?;

    // an unresolvable market is a configuration error
    let mut market = client
        .market_meta(&params.symbol)
        .await
        .map_err(|source| ConfigError::Market { symbol: params.symbol.clone(), source })?;
    market.min_notional = market.min_notional.max(params.min_notional);

    log::info!(
        "{} [{}] on {} | notional {} | RSI {} ATR {} x{} | TP {:.2}% SL {:.2}% | swing {} align {} | every {}s, stop poll {}s",
        params.symbol,
        params.bar,
        if settings.is_demo() { "BlowFin demo" } else { "BlowFin LIVE" },
        params.order_notional,
        params.rsi_period,
        params.atr_period,
        params.atr_multiplier,
        params.profit_target_pct * 100.0,
        params.stop_loss_pct * 100.0,
        params.swing_window,
        params.align_window,
        params.schedule_secs,
        params.fast_poll_secs,
    );
    log::info!(
        "market rules: qty step {} price step {} min qty {} min notional {}",
        market.qty_step, market.price_step, market.min_qty, market.min_notional
    );

    let desk = position_desk::spawn(store, params.trail(), params.retry_policy())
        .await
        .context("loading position record")?;
    let engine = TradingEngine::new(Arc::new(client), desk, market, params.clone());

    let cycle_budget = params.schedule().max(params.request_timeout());
    let poll_budget = params.request_timeout();

    // --- first cycle right away -------------------------------------------
    match tokio::time::timeout(cycle_budget, strategy_tick(&engine)).await {
        Ok(Ok(outcome)) => log::info!("initial cycle: {outcome:?}"),
        Ok(Err(e)) => scheduler::log_tick_error("initial cycle", &e),
        Err(_) => log::warn!("initial cycle exceeded {cycle_budget:?}, abandoned"),
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    let slow = {
        let engine = engine.clone();
        tokio::spawn(scheduler::run_ticker(
            "strategy cycle",
            params.schedule(),
            cycle_budget,
            stop_rx.clone(),
            move || {
                let engine = engine.clone();
                async move { strategy_tick(&engine).await }
            },
        ))
    };
    let fast = {
        let engine = engine.clone();
        tokio::spawn(scheduler::run_ticker(
            "stop poller",
            params.fast_poll(),
            poll_budget,
            stop_rx,
            move || {
                let engine = engine.clone();
                async move { fast_tick(&engine).await }
            },
        ))
    };

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    log::info!("shutdown requested");
    let _ = stop_tx.send(true);
    let _ = tokio::join!(slow, fast);
    log::info!("bye");
    Ok(())
}
