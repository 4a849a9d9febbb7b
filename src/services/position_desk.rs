//! Single owner of the position record.
//!
//! The strategy cycle and the fast stop poller never touch the record
//! directly; they send requests to one task that applies them in arrival
//! order and persists the result before replying. A decision that gates a
//! venue call (an exit, a close retry) is persisted *before* the caller gets
//! its ticket, and rolled back if the write fails.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::db::position_store::PositionStore;
use crate::services::position::{
    ActivePosition, Evaluation, ExitCheck, PositionBook, PositionRecord, PositionState, RetryClaim,
    RetryPolicy,
};
use crate::services::trailing::TrailParams;
use crate::utils::errors::{StoreError, TradeError};

const MAILBOX: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, TradeError>>;

enum Request {
    Snapshot(Reply<(PositionRecord, PositionState)>),
    BeginEntry(Reply<()>),
    CompleteEntry(Box<ActivePosition>, Reply<()>),
    AbortEntry(Reply<()>),
    Observe { price: f64, check: ExitCheck, reply: Reply<Evaluation> },
    ClaimRetry(Reply<RetryClaim>),
    CloseFailed(Reply<()>),
    Reset { reason: String, reply: Reply<()> },
}

/// Cheap-to-clone handle to the desk task.
#[derive(Clone)]
pub struct DeskHandle {
    tx: mpsc::Sender<Request>,
}

struct PositionDesk {
    book: PositionBook,
    store: Arc<dyn PositionStore>,
    trail: TrailParams,
    retry: RetryPolicy,
}

/// Load the persisted record (flat if none) and start the owner task.
pub async fn spawn(
    store: Arc<dyn PositionStore>,
    trail: TrailParams,
    retry: RetryPolicy,
) -> Result<DeskHandle, StoreError> {
    let record = store.load().await?.unwrap_or_default();
    match &record {
        PositionRecord::Flat => log::info!("position desk: starting flat"),
        PositionRecord::Active(p) => log::info!(
            "position desk: resuming {} {} @ {} (TSL {}, closing={}, close attempts {})",
            p.side.as_str(), p.quantity, p.entry_price, p.trailing_stop, p.closing, p.close_attempts
        ),
    }

    let (tx, rx) = mpsc::channel(MAILBOX);
    let desk = PositionDesk { book: PositionBook::new(record), store, trail, retry };
    tokio::spawn(desk.run(rx));
    Ok(DeskHandle { tx })
}

impl PositionDesk {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(req) = rx.recv().await {
            self.handle(req).await;
        }
        log::debug!("position desk: all handles dropped, stopping");
    }

    async fn handle(&mut self, req: Request) {
        match req {
            Request::Snapshot(reply) => {
                let _ = reply.send(Ok((self.book.record().clone(), self.book.state())));
            }
            Request::BeginEntry(reply) => {
                let r = self.book.begin_entry().map_err(|e| TradeError::InvalidRequest(e.to_string()));
                let _ = reply.send(r);
            }
            Request::CompleteEntry(position, reply) => {
                let r = match self.book.complete_entry(*position) {
                    // the venue position exists now; keep it in memory even if the write fails
                    Ok(()) => self.persist().await,
                    Err(e) => Err(TradeError::InvalidRequest(e.to_string())),
                };
                let _ = reply.send(r);
            }
            Request::AbortEntry(reply) => {
                self.book.abort_entry();
                let _ = reply.send(Ok(()));
            }
            Request::Observe { price, check, reply } => {
                let before = self.book.clone();
                let eval = self.book.observe(price, &self.trail, check);
                let r = match eval {
                    Evaluation::Idle(_) => Ok(eval),
                    Evaluation::Holding { .. } => self.persist().await.map(|_| eval),
                    Evaluation::Exit(_) => match self.persist().await {
                        Ok(()) => Ok(eval),
                        Err(e) => {
                            self.book = before;
                            Err(e)
                        }
                    },
                };
                let _ = reply.send(r);
            }
            Request::ClaimRetry(reply) => {
                let before = self.book.clone();
                let claim = self.book.claim_close_retry(Instant::now(), &self.retry);
                // the in-flight gate is memory-only, but persist anyway so the
                // claim is ordered after any earlier write
                let r = match claim {
                    RetryClaim::Claimed(_) => match self.persist().await {
                        Ok(()) => Ok(claim),
                        Err(e) => {
                            self.book = before;
                            Err(e)
                        }
                    },
                    other => Ok(other),
                };
                let _ = reply.send(r);
            }
            Request::CloseFailed(reply) => {
                self.book.close_failed(Instant::now(), &self.retry);
                let _ = reply.send(self.persist().await);
            }
            Request::Reset { reason, reply } => {
                if self.book.record().is_active() {
                    log::info!("position desk: resetting to flat ({reason})");
                }
                self.book.reset();
                let _ = reply.send(self.persist().await);
            }
        }
    }

    async fn persist(&self) -> Result<(), TradeError> {
        self.store.save(self.book.record()).await.map_err(TradeError::Store)
    }
}

impl DeskHandle {
    async fn ask<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, TradeError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| TradeError::DeskClosed)?;
        rx.await.map_err(|_| TradeError::DeskClosed)?
    }

    pub async fn snapshot(&self) -> Result<(PositionRecord, PositionState), TradeError> {
        self.ask(Request::Snapshot).await
    }

    pub async fn begin_entry(&self) -> Result<(), TradeError> {
        self.ask(Request::BeginEntry).await
    }

    pub async fn complete_entry(&self, position: ActivePosition) -> Result<(), TradeError> {
        self.ask(|r| Request::CompleteEntry(Box::new(position), r)).await
    }

    pub async fn abort_entry(&self) -> Result<(), TradeError> {
        self.ask(Request::AbortEntry).await
    }

    /// Fold one price into the record; may hand out a close ticket.
    pub async fn observe(&self, price: f64, check: ExitCheck) -> Result<Evaluation, TradeError> {
        self.ask(|reply| Request::Observe { price, check, reply }).await
    }

    pub async fn claim_close_retry(&self) -> Result<RetryClaim, TradeError> {
        self.ask(Request::ClaimRetry).await
    }

    pub async fn close_failed(&self) -> Result<(), TradeError> {
        self.ask(Request::CloseFailed).await
    }

    /// Confirmed close or reconciliation: back to the inactive template.
    pub async fn reset(&self, reason: impl Into<String>) -> Result<(), TradeError> {
        let reason = reason.into();
        self.ask(|reply| Request::Reset { reason, reply }).await
    }
}
