//! Process-wide session cache with single-flight login semantics.
//!
//! Each controller identity maps to a *flight*: a shared
//! [`tokio::sync::OnceCell`] that resolves to the login outcome. Concurrent
//! callers of [`AuthCache::get_or_fetch`] for the same identity join the
//! same flight, so exactly one login runs no matter how many check units
//! request it — and every waiter receives the same result, including the
//! same failure. Resolved flights that have expired (or failed, for later
//! callers) are swapped for a fresh cell under the map lock; the swap
//! compares cell pointers, so concurrent expiry observers trigger exactly
//! one refresh.
//!
//! The map lock is never held across an await, so a slow login for one
//! identity never blocks lookups for other identities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::debug;

use super::{AuthError, AuthResult, AuthSession, SessionCredential};

type Flight = Arc<OnceCell<Result<AuthSession, AuthError>>>;

/// Session cache keyed by controller identity.
///
/// Constructed once per run and injected into the orchestrator; there is no
/// ambient global state.
pub struct AuthCache {
    ttl: Duration,
    flights: Mutex<HashMap<String, Flight>>,
}

impl AuthCache {
    /// Creates a cache whose sessions expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the flight to join for `identity`, starting a fresh one when
    /// the stored flight has resolved to a failure or an expired session.
    fn flight_for(&self, identity: &str) -> Flight {
        let mut flights = self.flights.lock().expect("auth flight map poisoned");
        let flight = flights
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()));

        let stale = match flight.get() {
            Some(Ok(session)) => session.is_expired(),
            Some(Err(_)) => true,
            None => false, // in flight; join it
        };
        if stale {
            debug!("Starting fresh auth flight for '{}'", identity);
            *flight = Arc::new(OnceCell::new());
        }
        Arc::clone(flight)
    }

    /// Returns the cached session for `identity`, or runs `fetch` to obtain
    /// one — at most once across all concurrent callers.
    ///
    /// The first caller for an identity executes `fetch`; everyone who
    /// arrives while that login is in flight suspends and shares its
    /// outcome. A failure is shared by the waiters of that flight, but the
    /// next `get_or_fetch` after resolution starts a new flight (logins are
    /// not retried automatically within a flight).
    pub async fn get_or_fetch<F, Fut>(&self, identity: &str, fetch: F) -> AuthResult<AuthSession>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<SessionCredential>>,
    {
        let flight = self.flight_for(identity);
        let identity = identity.to_string();
        let ttl = self.ttl;

        flight
            .get_or_init(|| async move {
                debug!("Fetching credential for '{}'", identity);
                fetch()
                    .await
                    .map(|credential| AuthSession::new(identity, credential, ttl))
            })
            .await
            .clone()
    }

    /// Drops the cached session for `identity` (e.g., after a downstream
    /// 401). The next `get_or_fetch` triggers a fresh login.
    pub fn invalidate(&self, identity: &str) {
        let mut flights = self.flights.lock().expect("auth flight map poisoned");
        if flights.remove(identity).is_some() {
            debug!("Invalidated cached session for '{}'", identity);
        }
    }

    /// The cached session for `identity`, when one is resolved and live.
    pub fn cached(&self, identity: &str) -> Option<AuthSession> {
        let flights = self.flights.lock().expect("auth flight map poisoned");
        let flight = flights.get(identity)?;
        match flight.get() {
            Some(Ok(session)) if !session.is_expired() => Some(session.clone()),
            _ => None,
        }
    }
}
