//! Controller authentication: session types, the subprocess login executor,
//! and the process-wide single-flight auth cache.
//!
//! Login flows against controllers are unsafe to perform in-process in some
//! deployments (the same TLS-after-fork hazard the connection pool guards
//! against), so the actual login runs in a short-lived child process
//! ([`subprocess::SubprocessAuthExecutor`]). Sessions are expensive, so the
//! cache ([`cache::AuthCache`]) guarantees at-most-one login in flight per
//! controller identity.

pub mod cache;
pub mod subprocess;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use cache::AuthCache;
pub use subprocess::{LoginDescriptor, SubprocessAuthExecutor};

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors from login execution and caching.
///
/// `Clone` so that concurrent waiters joined on one login flight can all
/// receive the same failure instead of triggering duplicate logins.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// The login subprocess exited non-zero.
    #[error("Login subprocess failed (exit {exit_code}): {stderr}")]
    Execution { exit_code: i32, stderr: String },

    /// The login subprocess could not be spawned.
    #[error("Failed to spawn login subprocess: {0}")]
    Spawn(String),

    /// The login subprocess produced no parseable credential.
    #[error("Login produced no parseable credential: {0}")]
    MalformedOutput(String),

    /// The login subprocess exceeded its deadline.
    #[error("Login timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error materializing or reading the login script.
    #[error("IO error during login: {0}")]
    Io(String),
}

/// The credential a login flow yields, parsed from the subprocess stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredential {
    /// Bearer token or equivalent.
    pub token: String,

    /// Session cookie, when the controller uses cookie auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

/// An authenticated session for one controller identity.
///
/// Owned by the [`AuthCache`]; shared read access across concurrent check
/// units, mutated only by the cache's single-flight refresh path.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Controller identity the session authenticates against.
    pub identity: String,

    /// The credential to present on calls.
    pub credential: SessionCredential,

    acquired_at: Instant,
    ttl: Duration,
}

impl AuthSession {
    pub fn new(identity: impl Into<String>, credential: SessionCredential, ttl: Duration) -> Self {
        Self {
            identity: identity.into(),
            credential,
            acquired_at: Instant::now(),
            ttl,
        }
    }

    /// Whether the session has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }

    /// Time remaining before expiry, zero when already expired.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }
}
