//! Fork-safe connection pooling for controller transports.
//!
//! The pool bounds the number of live sessions per controller identity and
//! reuses idle sessions across check units. Every pooled entry is tagged
//! with the process id that created it: TLS state inherited across a process
//! boundary can crash rather than fail cleanly on reuse, so a tag that does
//! not match the current process is discarded and the session is rebuilt via
//! [`Transport::connect`] instead of being probed.
//!
//! Acquisition is a blocking resource: callers suspend on a per-identity
//! semaphore until a slot frees, bounded by a timeout. A timeout surfaces as
//! [`PoolError::Exhausted`]; the pool never hands out an unpooled session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::transport::{Transport, TransportError, TransportResult};

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors from connection pool acquisition.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No slot freed within the acquire timeout. Retryable by the caller
    /// after backoff; the pool itself does not retry.
    #[error("Connection pool exhausted for '{identity}' after {waited_ms}ms")]
    Exhausted { identity: String, waited_ms: u64 },

    /// Building a fresh session failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// An idle session together with the process that created it.
struct IdleEntry<C> {
    client: C,
    owner_pid: u32,
}

/// Per-identity slot bookkeeping. Cheap to clone; both fields are shared.
struct IdentityPool<C> {
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<IdleEntry<C>>>>,
}

impl<C> Clone for IdentityPool<C> {
    fn clone(&self) -> Self {
        Self {
            permits: Arc::clone(&self.permits),
            idle: Arc::clone(&self.idle),
        }
    }
}

/// A bounded, fork-safe pool of controller sessions.
///
/// At most `max_per_identity` sessions are live per controller identity.
/// Sessions are created lazily through the transport and returned to the
/// idle list when their [`PooledConnection`] guard drops.
pub struct ConnectionPool<T: Transport> {
    transport: Arc<T>,
    max_per_identity: usize,
    acquire_timeout: Duration,
    pools: Mutex<HashMap<String, IdentityPool<T::Client>>>,
}

impl<T: Transport> ConnectionPool<T> {
    /// Creates a pool over the given transport.
    ///
    /// # Arguments
    ///
    /// * `transport` - The device-session capability used to build sessions
    /// * `max_per_identity` - Slot bound per controller identity (min 1)
    /// * `acquire_timeout` - How long `acquire` may wait for a free slot
    pub fn new(transport: Arc<T>, max_per_identity: usize, acquire_timeout: Duration) -> Self {
        Self {
            transport,
            max_per_identity: max_per_identity.max(1),
            acquire_timeout,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn identity_pool(&self, identity: &str) -> IdentityPool<T::Client> {
        let mut pools = self.pools.lock().expect("pool map lock poisoned");
        pools
            .entry(identity.to_string())
            .or_insert_with(|| IdentityPool {
                permits: Arc::new(Semaphore::new(self.max_per_identity)),
                idle: Arc::new(Mutex::new(Vec::new())),
            })
            .clone()
    }

    /// Acquires a session for the given controller identity.
    ///
    /// Reuses an idle session created by this process when one is available;
    /// idle entries tagged with a foreign process id are dropped and replaced
    /// with a freshly-built session. Suspends until a slot frees, bounded by
    /// the pool's acquire timeout.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] when no slot frees in time, or
    /// [`PoolError::Transport`] when building a fresh session fails (the
    /// slot is released before returning).
    pub async fn acquire(&self, identity: &str) -> PoolResult<PooledConnection<T>> {
        let pool = self.identity_pool(identity);

        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&pool.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                return Err(PoolError::Exhausted {
                    identity: identity.to_string(),
                    waited_ms: self.acquire_timeout.as_millis() as u64,
                });
            }
        };

        let current_pid = std::process::id();
        let reused = {
            let mut idle = pool.idle.lock().expect("idle list lock poisoned");
            loop {
                match idle.pop() {
                    Some(entry) if entry.owner_pid == current_pid => break Some(entry.client),
                    Some(entry) => {
                        // Created in another process context; unusable.
                        debug!(
                            "Discarding session for '{}' created in process {}",
                            identity, entry.owner_pid
                        );
                    }
                    None => break None,
                }
            }
        };

        let client = match reused {
            Some(client) => client,
            None => {
                debug!("Building fresh session for '{}'", identity);
                self.transport.connect(identity).await?
            }
        };

        Ok(PooledConnection {
            client: Some(client),
            identity: identity.to_string(),
            owner_pid: current_pid,
            transport: Arc::clone(&self.transport),
            idle: Arc::clone(&pool.idle),
            _permit: permit,
        })
    }

    /// Number of idle sessions currently held for an identity.
    pub fn idle_count(&self, identity: &str) -> usize {
        let pools = self.pools.lock().expect("pool map lock poisoned");
        pools
            .get(identity)
            .map(|p| p.idle.lock().expect("idle list lock poisoned").len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn seed_idle(&self, identity: &str, client: T::Client, owner_pid: u32) {
        let pool = self.identity_pool(identity);
        pool.idle
            .lock()
            .unwrap()
            .push(IdleEntry { client, owner_pid });
    }
}

/// A pooled session guard.
///
/// Holds the slot permit for its identity; dropping the guard returns the
/// session to the idle list (when still in the creating process) and frees
/// the slot.
pub struct PooledConnection<T: Transport> {
    client: Option<T::Client>,
    identity: String,
    owner_pid: u32,
    transport: Arc<T>,
    idle: Arc<Mutex<Vec<IdleEntry<T::Client>>>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Transport> PooledConnection<T> {
    /// The controller identity this session is bound to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Executes a command on the pooled session.
    pub async fn execute(&mut self, command: &str) -> TransportResult<String> {
        let client = self
            .client
            .as_mut()
            .expect("pooled session already released");
        self.transport.execute(client, command).await
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        // Only same-process sessions are worth keeping.
        if self.owner_pid != std::process::id() {
            return;
        }
        if let Some(client) = self.client.take()
            && let Ok(mut idle) = self.idle.lock()
        {
            idle.push(IdleEntry {
                client,
                owner_pid: self.owner_pid,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport stub that counts connects and hands out numbered clients.
    struct CountingTransport {
        connects: AtomicUsize,
    }

    impl CountingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        type Client = usize;

        async fn connect(&self, _identity: &str) -> TransportResult<Self::Client> {
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn execute(
            &self,
            client: &mut Self::Client,
            _command: &str,
        ) -> TransportResult<String> {
            Ok(format!("client-{}", client))
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_acquire_builds_and_reuses() {
        let transport = CountingTransport::new();
        let pool = ConnectionPool::new(Arc::clone(&transport), 2, Duration::from_secs(1));

        {
            let mut conn = pool.acquire("ctrl-a").await.unwrap();
            assert_eq!(conn.execute("show").await.unwrap(), "client-0");
        }
        assert_eq!(pool.idle_count("ctrl-a"), 1);

        // Second acquire reuses the idle session; no new connect.
        let _conn = pool.acquire("ctrl-a").await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_exhausted() {
        let transport = CountingTransport::new();
        let pool = ConnectionPool::new(transport, 1, Duration::from_millis(50));

        let held = pool.acquire("ctrl-a").await.unwrap();
        match pool.acquire("ctrl-a").await {
            Err(PoolError::Exhausted { identity, .. }) => assert_eq!(identity, "ctrl-a"),
            Err(other) => panic!("expected Exhausted, got {:?}", other),
            Ok(_) => panic!("expected Exhausted, got a connection"),
        }
        drop(held);

        // Slot freed; acquisition succeeds again.
        assert!(pool.acquire("ctrl-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_process_entry_is_rebuilt() {
        let transport = CountingTransport::new();
        let pool = ConnectionPool::new(Arc::clone(&transport), 2, Duration::from_secs(1));

        // Simulate a session inherited across a fork boundary.
        let foreign_pid = std::process::id().wrapping_add(1);
        pool.seed_idle("ctrl-a", 999, foreign_pid);

        let mut conn = pool.acquire("ctrl-a").await.unwrap();
        // The inherited entry must never be returned.
        assert_eq!(conn.execute("show").await.unwrap(), "client-0");
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count("ctrl-a"), 0);
    }

    #[tokio::test]
    async fn test_per_identity_bound_holds_under_concurrency() {
        let transport = CountingTransport::new();
        let pool = Arc::new(ConnectionPool::new(transport, 2, Duration::from_secs(5)));
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire("ctrl-a").await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "slot bound violated");
    }

    #[tokio::test]
    async fn test_identities_have_independent_slots() {
        let transport = CountingTransport::new();
        let pool = ConnectionPool::new(transport, 1, Duration::from_millis(100));

        let _a = pool.acquire("ctrl-a").await.unwrap();
        // ctrl-a is saturated but ctrl-b acquires immediately.
        assert!(pool.acquire("ctrl-b").await.is_ok());
    }
}
