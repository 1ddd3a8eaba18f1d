//! Distributed Lock
//!
//! Mutual exclusion between stations built on a single register cell in
//! the remote store, which offers no compare-and-swap. A claim is a
//! write followed by a settle delay and a read-back: whoever's token
//! survives in the register owns the lease. Liveness comes from the TTL;
//! a holder that stops renewing is overwritten once its token ages out,
//! so a crashed station can never wedge the fleet.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::store::{RangeSpec, RemoteStore};

/// Lease token as written to the register cell.
///
/// Wire form is `<uuid>_<issued-at-millis>`; the id makes tokens
/// unguessable and the timestamp makes staleness checkable by any
/// observer without coordination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub opaque_id: Uuid,
    pub issued_at: i64,
}

impl LockToken {
    pub fn fresh() -> Self {
        Self {
            opaque_id: Uuid::new_v4(),
            issued_at: Utc::now().timestamp_millis(),
        }
    }

    /// Parse a register cell value. Anything malformed is `None`, which
    /// callers treat the same as an empty register.
    pub fn parse(cell: &str) -> Option<Self> {
        let (id_part, ts_part) = cell.trim().rsplit_once('_')?;
        let opaque_id = Uuid::parse_str(id_part).ok()?;
        let issued_at = ts_part.parse().ok()?;
        Some(Self {
            opaque_id,
            issued_at,
        })
    }

    /// Age of the token relative to the local clock.
    pub fn age(&self) -> Duration {
        let now = Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(self.issued_at).max(0) as u64)
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.opaque_id, self.issued_at)
    }
}

/// Lease over the shared register cell
pub struct DistributedLock {
    store: Arc<dyn RemoteStore>,
    control: RangeSpec,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn RemoteStore>, control: RangeSpec, config: LockConfig) -> Self {
        Self {
            store,
            control,
            config,
        }
    }

    /// Acquire the lease, waiting up to `max_wait`.
    ///
    /// An empty, malformed, or expired register is claimable; a fresh
    /// foreign token means backing off with jitter and trying again.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let started = tokio::time::Instant::now();
        let max_wait = self.config.max_wait();

        loop {
            match self.read_register().await? {
                Some(holder) if !holder.is_expired(self.config.ttl()) => {
                    debug!(holder = %holder, age_ms = holder.age().as_millis() as u64, "lock held, backing off");
                }
                other => {
                    if let Some(stale) = other {
                        info!(holder = %stale, "taking over expired lease");
                    }
                    if let Some(guard) = self.try_claim().await? {
                        return Ok(guard);
                    }
                    // Lost the write race; fall through to backoff
                }
            }

            if started.elapsed() >= max_wait {
                return Err(Error::LockTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let backoff = {
                let mut rng = rand::thread_rng();
                rng.gen_range(self.config.backoff_min_ms..=self.config.backoff_max_ms)
            };
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    /// Write our token, wait for the register to settle, and read it back.
    /// Only a surviving token counts as ownership.
    async fn try_claim(&self) -> Result<Option<LockGuard>> {
        let token = LockToken::fresh();
        self.store
            .update_range(&self.control, vec![vec![token.to_string()]])
            .await?;

        tokio::time::sleep(self.config.settle()).await;

        match self.read_register().await? {
            Some(observed) if observed == token => {
                info!(token = %token, "lock acquired");
                Ok(Some(LockGuard::start(
                    self.store.clone(),
                    self.control.clone(),
                    token,
                    self.config.renew_interval(),
                )))
            }
            observed => {
                debug!(observed = ?observed.map(|t| t.to_string()), "lost claim race");
                Ok(None)
            }
        }
    }

    async fn read_register(&self) -> Result<Option<LockToken>> {
        let rows = self.store.read_range(&self.control).await?;
        let cell = rows
            .first()
            .and_then(|row| row.first())
            .map(|s| s.as_str())
            .unwrap_or("");
        Ok(LockToken::parse(cell))
    }
}

/// Held lease. Renews itself in the background until released.
///
/// If a renewal write fails the guard flips its lost signal and stops
/// renewing; the critical section must watch [`LockGuard::is_lost`] (or
/// the signal receiver) and abandon its work, because the register will
/// expire out from under it.
pub struct LockGuard {
    store: Arc<dyn RemoteStore>,
    control: RangeSpec,
    token: Arc<Mutex<LockToken>>,
    lost_rx: watch::Receiver<bool>,
    renew_task: JoinHandle<()>,
}

impl LockGuard {
    fn start(
        store: Arc<dyn RemoteStore>,
        control: RangeSpec,
        token: LockToken,
        renew_interval: Duration,
    ) -> Self {
        let token = Arc::new(Mutex::new(token));
        let (lost_tx, lost_rx) = watch::channel(false);

        let renew_task = {
            let store = store.clone();
            let control = control.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(renew_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await; // first tick completes immediately

                loop {
                    interval.tick().await;

                    let fresh = LockToken::fresh();
                    match store
                        .update_range(&control, vec![vec![fresh.to_string()]])
                        .await
                    {
                        Ok(()) => {
                            *token.lock().await = fresh;
                            debug!("lease renewed");
                        }
                        Err(e) => {
                            warn!(error = %e, "lease renewal failed, lock considered lost");
                            let _ = lost_tx.send(true);
                            return;
                        }
                    }
                }
            })
        };

        Self {
            store,
            control,
            token,
            lost_rx,
            renew_task,
        }
    }

    /// Whether a renewal failure has orphaned this guard.
    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// The lease token currently in the register on our behalf.
    /// Renewals swap it, so callers should not hold onto the value.
    pub async fn token(&self) -> LockToken {
        self.token.lock().await.clone()
    }

    /// Receiver that flips to `true` when the lease is lost.
    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Release the lease: clear the register only if it still holds our
    /// token. Clearing unconditionally would steal a successor's lease.
    pub async fn release(self) -> Result<()> {
        self.renew_task.abort();
        let ours = self.token.lock().await.clone();

        let rows = self.store.read_range(&self.control).await?;
        let cell = rows
            .first()
            .and_then(|row| row.first())
            .map(|s| s.as_str())
            .unwrap_or("");

        match LockToken::parse(cell) {
            Some(observed) if observed == ours => {
                self.store.clear_range(&self.control).await?;
                info!("lock released");
            }
            observed => {
                debug!(observed = ?observed.map(|t| t.to_string()), "register no longer ours, leaving it");
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renew_task.abort();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("control", &self.control)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fast_config() -> LockConfig {
        LockConfig {
            ttl_ms: 5_000,
            renew_interval_ms: 1_000,
            max_wait_ms: 500,
            settle_ms: 5,
            backoff_min_ms: 10,
            backoff_max_ms: 20,
        }
    }

    fn control() -> RangeSpec {
        RangeSpec::new("Control", "A1")
    }

    #[test]
    fn test_token_wire_roundtrip() {
        let token = LockToken::fresh();
        let parsed = LockToken::parse(&token.to_string()).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_malformed_register_is_empty() {
        assert!(LockToken::parse("").is_none());
        assert!(LockToken::parse("garbage").is_none());
        assert!(LockToken::parse("not-a-uuid_12345").is_none());
        assert!(LockToken::parse("d9b2d63d-a233-4123-847a-7d2a6c20e0c1_abc").is_none());
    }

    #[tokio::test]
    async fn test_acquire_on_empty_register() {
        let store = Arc::new(MemoryStore::new());
        let lock = DistributedLock::new(store.clone(), control(), fast_config());

        let guard = lock.acquire().await.unwrap();
        assert!(!guard.is_lost());
        assert!(format!("{guard:?}").contains("LockGuard"));

        // Register now holds our token
        let cell = store.sheet("Control").await[0][0].clone();
        assert!(LockToken::parse(&cell).is_some());

        guard.release().await.unwrap();
        let rows = store.sheet("Control").await;
        assert!(rows[0].is_empty() || rows[0][0].is_empty());
    }

    #[tokio::test]
    async fn test_fresh_foreign_token_blocks_until_timeout() {
        let store = Arc::new(MemoryStore::new());
        let foreign = LockToken::fresh();
        store
            .seed("Control", vec![vec![foreign.to_string()]])
            .await;

        let lock = DistributedLock::new(store, control(), fast_config());
        let err = lock.acquire().await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let stale = LockToken {
            opaque_id: Uuid::new_v4(),
            issued_at: Utc::now().timestamp_millis() - 60_000,
        };
        store.seed("Control", vec![vec![stale.to_string()]]).await;

        let lock = DistributedLock::new(store.clone(), control(), fast_config());
        let guard = lock.acquire().await.unwrap();

        let cell = store.sheet("Control").await[0][0].clone();
        let holder = LockToken::parse(&cell).unwrap();
        assert_ne!(holder.opaque_id, stale.opaque_id);

        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_clients_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut config = fast_config();
        config.max_wait_ms = 1_000;

        let lock_a = DistributedLock::new(store.clone(), control(), config.clone());
        let lock_b = DistributedLock::new(store.clone(), control(), config);

        let (a, b) = tokio::join!(lock_a.acquire(), lock_b.acquire());
        let wins = a.is_ok() as usize + b.is_ok() as usize;
        assert_eq!(wins, 1);

        if let Ok(guard) = a {
            guard.release().await.unwrap();
        }
        if let Ok(guard) = b {
            guard.release().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_loser_acquires_after_release() {
        let store = Arc::new(MemoryStore::new());
        let mut config = fast_config();
        config.max_wait_ms = 2_000;

        let lock_a = DistributedLock::new(store.clone(), control(), config.clone());
        let guard = lock_a.acquire().await.unwrap();

        let lock_b = DistributedLock::new(store.clone(), control(), config);
        let waiter = tokio::spawn(async move { lock_b.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.release().await.unwrap();

        let guard_b = waiter.await.unwrap().unwrap();
        guard_b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_token() {
        let store = Arc::new(MemoryStore::new());
        let lock = DistributedLock::new(store.clone(), control(), fast_config());
        let guard = lock.acquire().await.unwrap();

        // Another station overwrites the register while we hold the guard
        let foreign = LockToken::fresh();
        store
            .seed("Control", vec![vec![foreign.to_string()]])
            .await;

        guard.release().await.unwrap();

        let cell = store.sheet("Control").await[0][0].clone();
        assert_eq!(LockToken::parse(&cell).unwrap(), foreign);
    }

    #[tokio::test]
    async fn test_renewal_failure_flips_lost_signal() {
        let store = Arc::new(MemoryStore::new());
        let mut config = fast_config();
        config.renew_interval_ms = 20;

        let lock = DistributedLock::new(store.clone(), control(), config);
        let guard = lock.acquire().await.unwrap();
        assert!(!guard.is_lost());

        store.fail_next_updates(1);
        let mut signal = guard.lost_signal();
        tokio::time::timeout(Duration::from_secs(2), signal.changed())
            .await
            .expect("lost signal should fire")
            .unwrap();
        assert!(guard.is_lost());
    }
}
