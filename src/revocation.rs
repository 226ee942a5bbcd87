//! Revoked token bookkeeping: a bounded LRU in front of `jwt_invalidated`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use tokio::{
    sync::{oneshot, Mutex},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, Instrument};

use crate::{error::Result, token::Claims, worker::Worker};

/// Maximum number of cached tokens.
pub const CAPACITY: usize = 512;

#[derive(Debug)]
struct Node {
    token: String,
    revoked: bool,
    expires: DateTime<Utc>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena backed doubly linked recency list with a map index.
#[derive(Debug)]
struct Lru {
    capacity: usize,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity + 1),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity + 1),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self.node(slot).map(|n| (n.prev, n.next)) else {
            return;
        };

        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Cached answer for `token`, promoting it on a hit.
    fn get(&mut self, token: &str) -> Option<bool> {
        let slot = *self.index.get(token)?;
        self.unlink(slot);
        self.push_front(slot);
        self.node(slot).map(|n| n.revoked)
    }

    fn insert(&mut self, token: &str, revoked: bool, expires: DateTime<Utc>) {
        self.remove(token);

        let node = Node {
            token: token.to_string(),
            revoked,
            expires,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        self.index.insert(token.to_string(), slot);
        self.push_front(slot);

        while self.len() > self.capacity {
            let Some(tail) = self.tail else { break };
            let Some(victim) = self.node(tail).map(|n| n.token.clone()) else {
                break;
            };
            self.remove(&victim);
        }
    }

    fn remove(&mut self, token: &str) -> bool {
        let Some(slot) = self.index.remove(token) else {
            return false;
        };
        self.unlink(slot);
        self.slots[slot] = None;
        self.free.push(slot);
        true
    }

    /// Drops every entry for which `keep` is false; returns how many went.
    fn retain(&mut self, mut keep: impl FnMut(&Node) -> bool) -> usize {
        let doomed: Vec<String> = self
            .slots
            .iter()
            .flatten()
            .filter(|n| !keep(n))
            .map(|n| n.token.clone())
            .collect();

        for token in &doomed {
            self.remove(token);
        }
        doomed.len()
    }

    /// Map keys and list members are the same set and the list is well formed.
    fn is_consistent(&self) -> bool {
        let mut seen = 0;
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(slot) = cursor {
            let Some(node) = self.node(slot) else {
                return false;
            };
            if node.prev != prev || self.index.get(&node.token) != Some(&slot) {
                return false;
            }
            seen += 1;
            if seen > self.index.len() {
                return false;
            }
            prev = Some(slot);
            cursor = node.next;
        }

        self.tail == prev && seen == self.index.len() && seen <= self.capacity
    }
}

fn expiry(claims: &Claims) -> DateTime<Utc> {
    Utc.timestamp_opt(claims.exp, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Shared by every context of the process.
#[derive(Debug)]
pub struct RevocationCache {
    pool: PgPool,
    lru: Mutex<Lru>,
}

impl RevocationCache {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_capacity(pool, CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(pool: PgPool, capacity: usize) -> Self {
        Self {
            pool,
            lru: Mutex::new(Lru::new(capacity)),
        }
    }

    /// Whether `token` was revoked. A miss consults the store and caches
    /// the answer until the token's own expiry.
    ///
    /// # Errors
    /// The store error on a miss.
    pub async fn is_revoked(&self, token: &str, claims: &Claims) -> Result<bool> {
        let mut lru = self.lru.lock().await;

        if let Some(revoked) = lru.get(token) {
            return Ok(revoked);
        }

        let span = info_span!("db.query", db.system = "postgresql", db.operation = "SELECT");
        let revoked = sqlx::query("SELECT 1 FROM jwt_invalidated WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?
            .is_some();

        lru.insert(token, revoked, expiry(claims));
        Ok(revoked)
    }

    /// Marks `token` revoked in the store and the cache.
    ///
    /// # Errors
    /// The store error.
    pub async fn revoke(&self, token: &str, claims: &Claims) -> Result<()> {
        let expires = expiry(claims);
        let mut lru = self.lru.lock().await;
        lru.remove(token);

        let span = info_span!("db.query", db.system = "postgresql", db.operation = "INSERT");
        sqlx::query(
            "INSERT INTO jwt_invalidated (token, expires) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(token)
        .bind(expires)
        .execute(&self.pool)
        .instrument(span)
        .await?;

        lru.insert(token, true, expires);
        debug!("Revoked token for {}", claims.sub);
        Ok(())
    }

    /// Deletes expired rows from the store and drops expired as well as
    /// non-revoked entries from the cache, so other nodes' revocations are
    /// seen on the next lookup. Returns the number of deleted rows.
    ///
    /// # Errors
    /// The store error.
    pub async fn sweep(&self) -> Result<u64> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "DELETE");
        let deleted = sqlx::query("DELETE FROM jwt_invalidated WHERE expires < NOW()")
            .execute(&self.pool)
            .instrument(span)
            .await?
            .rows_affected();

        let now = Utc::now();
        let dropped = self
            .lru
            .lock()
            .await
            .retain(|n| n.revoked && n.expires >= now);

        debug!("Revocation sweep: {deleted} rows deleted, {dropped} cache entries dropped");
        Ok(deleted)
    }

    pub async fn len(&self) -> usize {
        self.lru.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `token` currently sits in the cache.
    pub async fn is_cached(&self, token: &str) -> bool {
        self.lru.lock().await.index.contains_key(token)
    }

    pub async fn is_consistent(&self) -> bool {
        self.lru.lock().await.is_consistent()
    }

    /// Runs [`RevocationCache::sweep`] every `every` until stopped.
    #[must_use]
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) -> Worker {
        let cache = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = cache.sweep().await {
                            error!("Revocation sweep failed: {err}");
                        }
                    }
                }
            }

            info!("Revocation sweeper stopped");
        });

        Worker::new("revocation sweeper", shutdown_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn later() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::minutes(10)
    }

    #[test]
    fn lru_evicts_least_recent() {
        let mut lru = Lru::new(3);
        lru.insert("a", true, later());
        lru.insert("b", true, later());
        lru.insert("c", false, later());
        assert_eq!(lru.get("a"), Some(true));

        lru.insert("d", true, later());
        assert_eq!(lru.len(), 3);
        assert_eq!(lru.get("b"), None);
        assert_eq!(lru.get("c"), Some(false));
        assert!(lru.is_consistent());
    }

    #[test]
    fn reinsert_replaces() {
        let mut lru = Lru::new(2);
        lru.insert("a", false, later());
        lru.insert("a", true, later());
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get("a"), Some(true));
        assert!(lru.is_consistent());
    }

    #[test]
    fn capacity_bound_holds_under_churn() {
        let mut lru = Lru::new(CAPACITY);
        for n in 0..(CAPACITY * 3) {
            lru.insert(&format!("t{n}"), n % 2 == 0, later());
            if n % 7 == 0 {
                lru.remove(&format!("t{}", n / 2));
            }
            assert!(lru.len() <= CAPACITY);
        }
        assert!(lru.is_consistent());
        // Slots are recycled rather than growing without bound.
        assert!(lru.slots.len() <= CAPACITY + 1);
    }

    #[test]
    fn retain_drops_expired_and_unrevoked() {
        let mut lru = Lru::new(8);
        let past = Utc::now() - ChronoDuration::minutes(1);
        lru.insert("old", true, past);
        lru.insert("fresh", true, later());
        lru.insert("valid", false, later());

        let now = Utc::now();
        assert_eq!(lru.retain(|n| n.revoked && n.expires >= now), 2);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get("fresh"), Some(true));
        assert!(lru.is_consistent());
    }

    #[test]
    fn empty_list_is_consistent() {
        let mut lru = Lru::new(1);
        assert!(lru.is_consistent());
        lru.insert("x", true, later());
        assert!(lru.remove("x"));
        assert!(!lru.remove("x"));
        assert!(lru.is_consistent());
        assert_eq!(lru.head, None);
        assert_eq!(lru.tail, None);
    }
}
