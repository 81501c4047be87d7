//! netverify: a concurrent network verification runner.
//!
//! This crate executes device and controller verification checks in
//! parallel and aggregates their streamed results into a crash-resilient
//! report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery**: Find check files and classify them (API vs. device-to-device)
//! - **Auth**: Single-flight controller login with a TTL session cache
//! - **Pool**: Bounded, fork-safe per-identity device session pool
//! - **Stream**: Append-only JSONL result shards, one per test unit
//! - **Report**: Reconstruct the shards into an ordered report
//! - **Orchestrator**: Fan units out under per-class concurrency limits
//!
//! # Example
//!
//! ```no_run
//! use netverify::config::load_config;
//! use netverify::orchestrator::Orchestrator;
//! use netverify::transport::{ShellCheckRunner, ShellTransport};
//! use netverify::{categorize, discover};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("netverify.toml"))?;
//!     let paths = discover(std::path::Path::new("checks"))?;
//!     let units = categorize(&paths, config.discovery.strict)?.into_units();
//!
//!     let transport = ShellTransport::new(&config.transport.connector);
//!     let runner = ShellCheckRunner::new(&config.transport.check_command);
//!     let orchestrator = Orchestrator::new(config, transport, runner);
//!     let summary = orchestrator.run(&units).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod auth;
pub mod config;
pub mod discovery;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use auth::{AuthCache, AuthSession, SessionCredential};
pub use config::{Config, load_config};
pub use discovery::{TestUnit, UnitCategory, categorize, discover};
pub use orchestrator::{Orchestrator, RunSummary};
pub use pool::{ConnectionPool, PooledConnection};
pub use report::{Report, aggregate};
pub use stream::{CheckStatus, ExecutionContext, StreamCollector, UnitStream};
pub use transport::{CheckRunner, Transport};
