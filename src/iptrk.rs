//! Per source address login throttling.
//!
//! While the worker runs every update is funnelled through one channel so
//! counts for an address never race. Without it callers hit the store
//! directly.

use std::{
    net::IpAddr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use sqlx::{types::ipnetwork::IpNetwork, PgPool, Row};
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{error::Result, worker::Worker};

const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Count(IpAddr),
    Reset(Option<IpAddr>),
    Expire,
}

#[derive(Debug)]
struct Command {
    op: Op,
    reply: oneshot::Sender<Result<bool>>,
}

/// One row of the tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpTrkEntry {
    pub ip: IpAddr,
    pub count: i32,
    pub entered: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub blocked: bool,
}

/// Direct access to the `iptrk` table.
#[derive(Debug, Clone)]
pub struct IpStore {
    pool: PgPool,
    max: i32,
    decay: String,
}

impl IpStore {
    #[must_use]
    pub fn new(pool: PgPool, max: i32, decay: impl Into<String>) -> Self {
        Self {
            pool,
            max,
            decay: decay.into(),
        }
    }

    /// Records one attempt from `ip`; true when the address is now limited.
    ///
    /// # Errors
    /// The store error.
    pub async fn count(&self, ip: IpAddr) -> Result<bool> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "INSERT");
        let count: i32 = sqlx::query_scalar(
            "INSERT INTO iptrk (ip) VALUES ($1) \
             ON CONFLICT (ip) DO UPDATE SET count = iptrk.count + 1, last = NOW() \
             RETURNING count",
        )
        .bind(IpNetwork::from(ip))
        .fetch_one(&self.pool)
        .instrument(span)
        .await?;

        let limited = count > self.max;
        if limited {
            warn!("IPtrk: {ip} is limited after {count} attempts");
        }
        Ok(limited)
    }

    /// Forgets `ip`, or everything when `None`. True when a row went away.
    ///
    /// # Errors
    /// The store error.
    pub async fn reset(&self, ip: Option<IpAddr>) -> Result<bool> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "DELETE");
        let done = match ip {
            Some(ip) => {
                sqlx::query("DELETE FROM iptrk WHERE ip = $1")
                    .bind(IpNetwork::from(ip))
                    .execute(&self.pool)
                    .instrument(span)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM iptrk")
                    .execute(&self.pool)
                    .instrument(span)
                    .await?
            }
        };
        Ok(done.rows_affected() > 0)
    }

    /// Drops entries idle for longer than the decay interval.
    ///
    /// # Errors
    /// The store error.
    pub async fn expire(&self) -> Result<u64> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "DELETE");
        let done = sqlx::query("DELETE FROM iptrk WHERE last < NOW() - $1::INTERVAL")
            .bind(&self.decay)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(done.rows_affected())
    }

    /// # Errors
    /// The store error.
    pub async fn list(&self) -> Result<Vec<IpTrkEntry>> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "SELECT");
        let rows = sqlx::query("SELECT ip, count, entered, last FROM iptrk ORDER BY ip")
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<IpTrkEntry> {
                let net: IpNetwork = row.try_get("ip")?;
                let count: i32 = row.try_get("count")?;
                Ok(IpTrkEntry {
                    ip: net.ip(),
                    count,
                    entered: row.try_get("entered")?,
                    last: row.try_get("last")?,
                    blocked: count > self.max,
                })
            })
            .collect()
    }

    async fn apply(&self, op: Op) -> Result<bool> {
        match op {
            Op::Count(ip) => self.count(ip).await,
            Op::Reset(ip) => self.reset(ip).await,
            Op::Expire => self.expire().await.map(|n| n > 0),
        }
    }
}

/// Front of the tracker shared by every context.
#[derive(Debug)]
pub struct IpTracker {
    store: IpStore,
    queue: Mutex<Option<mpsc::Sender<Command>>>,
}

impl IpTracker {
    #[must_use]
    pub fn new(store: IpStore) -> Self {
        Self {
            store,
            queue: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn store(&self) -> &IpStore {
        &self.store
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sender().is_some()
    }

    fn sender(&self) -> Option<mpsc::Sender<Command>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn submit(&self, op: Op) -> Result<bool> {
        if let Some(sender) = self.sender() {
            let (reply, answer) = oneshot::channel();
            if sender.send(Command { op, reply }).await.is_ok() {
                if let Ok(result) = answer.await {
                    return result;
                }
            }
            debug!("IPtrk worker gone, applying {op:?} directly");
        }
        self.store.apply(op).await
    }

    /// Counts one attempt from `ip`.
    ///
    /// # Errors
    /// The store error.
    pub async fn count(&self, ip: IpAddr) -> Result<bool> {
        self.submit(Op::Count(ip)).await
    }

    /// # Errors
    /// The store error.
    pub async fn reset(&self, ip: Option<IpAddr>) -> Result<bool> {
        self.submit(Op::Reset(ip)).await
    }

    /// # Errors
    /// The store error.
    pub async fn expire(&self) -> Result<bool> {
        self.submit(Op::Expire).await
    }

    /// # Errors
    /// The store error.
    pub async fn list(&self) -> Result<Vec<IpTrkEntry>> {
        self.store.list().await
    }

    /// Same as [`IpTracker::reset`] for one address.
    ///
    /// # Errors
    /// The store error.
    pub async fn remove(&self, ip: IpAddr) -> Result<bool> {
        self.reset(Some(ip)).await
    }

    /// Starts the serialising worker, which also expires idle entries every
    /// `sweep`. Stopping the returned worker falls back to direct access.
    pub fn start(self: &std::sync::Arc<Self>, sweep: Duration) -> Worker {
        let (tx, mut rx) = mpsc::channel::<Command>(QUEUE_DEPTH);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let tracker = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    Some(cmd) = rx.recv() => {
                        let result = tracker.store.apply(cmd.op).await;
                        // The caller may have given up waiting.
                        let _ = cmd.reply.send(result);
                    }
                    _ = ticker.tick() => {
                        match tracker.store.expire().await {
                            Ok(n) if n > 0 => debug!("IPtrk expired {n} entries"),
                            Ok(_) => {}
                            Err(err) => error!("IPtrk expire failed: {err}"),
                        }
                    }
                }
            }

            *tracker.queue.lock().unwrap_or_else(PoisonError::into_inner) = None;
            // Drain what was queued before the sender went away.
            rx.close();
            while let Some(cmd) = rx.recv().await {
                let result = tracker.store.apply(cmd.op).await;
                let _ = cmd.reply.send(result);
            }

            info!("IPtrk worker stopped");
        });

        Worker::new("iptrk", shutdown_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn lazy_tracker() -> Arc<IpTracker> {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://nobody@127.0.0.1:1/none")
            .unwrap();
        Arc::new(IpTracker::new(IpStore::new(pool, 5, "1 hour")))
    }

    #[tokio::test]
    async fn worker_registers_and_unregisters() {
        let tracker = lazy_tracker();
        assert!(!tracker.is_running());

        let worker = tracker.start(Duration::from_secs(3600));
        assert!(tracker.is_running());
        assert_eq!(worker.name(), "iptrk");

        worker.stop().await;
        assert!(!tracker.is_running());
    }
}
