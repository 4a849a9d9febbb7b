//! Production adapter that talks to BlowFin’s REST API.
//! Implements the `ExchangeClient` seam the strategy drivers are written against.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::services::blowfin::api::{
    self, BlowFinResponse, CancelTpslRequest, Instrument, InstrumentRow, OrderAck, OrderRequest,
    PositionRow, TickerRow, TpslAck, TpslRequest,
};
use crate::services::blowfin::auth::Credentials;
use crate::services::exchange::{CancelOutcome, ExchangeClient, MarketMeta, TriggerKind, VenuePosition};
use crate::services::strategies::{Candle, OrderSide};
use crate::utils::errors::ApiError;

pub struct BlowfinClient {
    http: Client,
    creds: Credentials,
    base_url: String,
    margin_mode: String,
    timeout: Duration,
    instruments: Mutex<HashMap<String, Instrument>>,
}

impl BlowfinClient {
    pub fn new(
        creds: Credentials,
        demo: bool,
        margin_mode: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base = if demo { api::DEMO_BASE_URL } else { api::LIVE_BASE_URL };
        Self::with_base_url(creds, base, margin_mode, timeout)
    }

    pub fn with_base_url(
        creds: Credentials,
        base_url: impl Into<String>,
        margin_mode: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            creds,
            base_url: base_url.into(),
            margin_mode: margin_mode.into(),
            timeout,
            instruments: Mutex::new(HashMap::new()),
        })
    }

    /// Runs `fut` under the per-call deadline.
    async fn deadline<T>(
        &self,
        call: &'static str,
        fut: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ApiError::Timeout(call)),
        }
    }

    async fn public_get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        resp.json::<BlowFinResponse>().await?.into_data()
    }

    async fn signed_get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let s = self.creds.sign("GET", path_and_query, "");
        let resp = self
            .http
            .get(&url)
            .header("ACCESS-KEY", &self.creds.api_key)
            .header("ACCESS-SIGN", s.signature)
            .header("ACCESS-TIMESTAMP", s.timestamp)
            .header("ACCESS-NONCE", s.nonce)
            .header("ACCESS-PASSPHRASE", &self.creds.passphrase)
            .send()
            .await?
            .error_for_status()?;
        resp.json::<BlowFinResponse>().await?.into_data()
    }

    async fn signed_post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<BlowFinResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let body = serde_json::to_string(body)?;
        let s = self.creds.sign("POST", path, &body);
        let resp = self
            .http
            .post(&url)
            .header("ACCESS-KEY", &self.creds.api_key)
            .header("ACCESS-SIGN", s.signature)
            .header("ACCESS-TIMESTAMP", s.timestamp)
            .header("ACCESS-NONCE", s.nonce)
            .header("ACCESS-PASSPHRASE", &self.creds.passphrase)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<BlowFinResponse>().await?)
    }

    /// Cached instrument rules; fetched on first use.
    async fn instrument(&self, symbol: &str) -> Result<Instrument, ApiError> {
        if let Some(i) = self.instruments.lock().await.get(symbol) {
            return Ok(*i);
        }
        let rows: Vec<InstrumentRow> = self
            .public_get(&format!("{}?instId={}", api::INSTRUMENTS_PATH, symbol))
            .await?;
        let row = rows
            .iter()
            .find(|r| r.inst_id == symbol)
            .ok_or_else(|| ApiError::Other(format!("unknown instrument {symbol}")))?;
        let inst = row.parse()?;
        log::debug!("blowfin: {symbol} rules {inst:?}");
        self.instruments.lock().await.insert(symbol.to_string(), inst);
        Ok(inst)
    }
}

/// Per-order acknowledgements carry their own code; "0" or absent is success.
fn check_ack(code: Option<String>, msg: Option<String>) -> Result<(), ApiError> {
    match code {
        Some(c) if c != "0" => Err(ApiError::Venue { code: c, msg: msg.unwrap_or_default() }),
        _ => Ok(()),
    }
}

#[async_trait]
impl ExchangeClient for BlowfinClient {
    async fn fetch_candles(&self, symbol: &str, bar: &str, limit: usize) -> Result<Vec<Candle>, ApiError> {
        self.deadline("fetch_candles", async {
            let rows: Vec<Vec<String>> = self
                .public_get(&format!("{}?instId={}&bar={}&limit={}", api::CANDLES_PATH, symbol, bar, limit))
                .await?;
            api::parse_candles(rows)
        })
        .await
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<f64, ApiError> {
        self.deadline("fetch_ticker", async {
            let rows: Vec<TickerRow> = self
                .public_get(&format!("{}?instId={}", api::TICKERS_PATH, symbol))
                .await?;
            let row = rows
                .iter()
                .find(|r| r.inst_id == symbol)
                .ok_or_else(|| ApiError::Other(format!("no ticker for {symbol}")))?;
            api::num("last", &row.last)
        })
        .await
    }

    async fn fetch_position(&self, symbol: &str) -> Result<VenuePosition, ApiError> {
        self.deadline("fetch_position", async {
            let inst = self.instrument(symbol).await?;
            let rows: Vec<PositionRow> = self
                .signed_get(&format!("{}?instId={}", api::POSITIONS_PATH, symbol))
                .await?;
            let mine: Vec<PositionRow> = rows.into_iter().filter(|r| r.inst_id == symbol).collect();
            api::parse_position(&mine, &inst)
        })
        .await
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<String, ApiError> {
        self.deadline("submit_market_order", async {
            let inst = self.instrument(symbol).await?;
            let order = OrderRequest {
                inst_id: symbol.to_string(),
                margin_mode: self.margin_mode.clone(),
                position_side: "net".into(),
                side: side.as_str().into(),
                order_type: "market".into(),
                size: inst.contracts(quantity),
                reduce_only: reduce_only.to_string(),
            };
            log::debug!("blowfin: order {order:?}");
            let acks: Vec<OrderAck> = self.signed_post(api::ORDER_PATH, &order).await?.into_data()?;
            let ack = acks
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::Other("order accepted without an ack".into()))?;
            check_ack(ack.code, ack.msg)?;
            Ok(ack.order_id)
        })
        .await
    }

    async fn submit_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
        kind: TriggerKind,
        reduce_only: bool,
    ) -> Result<String, ApiError> {
        self.deadline("submit_stop_order", async {
            let inst = self.instrument(symbol).await?;
            let trigger = Some(inst.price(trigger_price));
            // "-1" executes the triggered leg at market
            let market = Some("-1".to_string());
            let (sl_trigger_price, sl_order_price, tp_trigger_price, tp_order_price) = match kind {
                TriggerKind::StopLoss => (trigger, market, None, None),
                TriggerKind::TakeProfit => (None, None, trigger, market),
            };
            let req = TpslRequest {
                inst_id: symbol.to_string(),
                margin_mode: self.margin_mode.clone(),
                position_side: "net".into(),
                side: side.as_str().into(),
                size: inst.contracts(quantity),
                reduce_only: reduce_only.to_string(),
                sl_trigger_price,
                sl_order_price,
                tp_trigger_price,
                tp_order_price,
            };
            let data: serde_json::Value = self.signed_post(api::TPSL_PATH, &req).await?.into_data()?;
            // a single object, or a one-element array on some gateways
            let ack: TpslAck = match data {
                serde_json::Value::Array(mut v) if !v.is_empty() => serde_json::from_value(v.remove(0))?,
                other => serde_json::from_value(other)?,
            };
            check_ack(ack.code, ack.msg)?;
            Ok(ack.tpsl_id)
        })
        .await
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<CancelOutcome, ApiError> {
        self.deadline("cancel_order", async {
            let req = [CancelTpslRequest { inst_id: symbol.to_string(), tpsl_id: order_id.to_string() }];
            let resp = self.signed_post(api::CANCEL_TPSL_PATH, &req[..]).await?;
            let outcome = match resp.into_data::<Option<Vec<TpslAck>>>() {
                Ok(acks) => match acks.unwrap_or_default().into_iter().next() {
                    Some(a) => match check_ack(a.code, a.msg) {
                        Ok(()) => CancelOutcome::Cancelled,
                        Err(e) => not_found_or(e)?,
                    },
                    None => CancelOutcome::Cancelled,
                },
                Err(e) => not_found_or(e)?,
            };
            Ok(outcome)
        })
        .await
    }

    async fn market_meta(&self, symbol: &str) -> Result<MarketMeta, ApiError> {
        self.deadline("market_meta", async { Ok(self.instrument(symbol).await?.meta()) }).await
    }
}

/// An order the venue no longer knows about is already gone.
fn not_found_or(e: ApiError) -> Result<CancelOutcome, ApiError> {
    match &e {
        ApiError::Venue { msg, .. } if msg.to_lowercase().contains("not exist") => Ok(CancelOutcome::NotFound),
        _ => Err(e),
    }
}
