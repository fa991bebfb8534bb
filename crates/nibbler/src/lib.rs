//! # nibbler
//!
//! Adaptive range-walking checksum reconciliation between two data stores.
//!
//! A master and a remote store are walked in key order, one window at a
//! time, with support for:
//!
//! - **Two-tier comparison**: one batch checksum per window, row-by-row
//!   digests only where the batch differs
//! - **Adaptive windows** that grow toward a one-second target and shrink
//!   around mismatches
//! - **Resume capability** via signed JSON session files
//! - **Sampling** of differing records down to field level
//! - **Pluggable connectors** behind the [`Connector`] trait
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nibbler::{
//!     Config, Connector, FileSessionStore, MemoryConnector, ReconcileOptions, Reconciler,
//!     SessionStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> nibbler::Result<()> {
//!     let config = Config::load("nibbler.yaml")?;
//!     let master: Arc<dyn Connector<i64>> = Arc::new(
//!         MemoryConnector::from_json_lines("master", &config.master.path, "id")?,
//!     );
//!     let slave: Arc<dyn Connector<i64>> = Arc::new(
//!         MemoryConnector::from_json_lines("slave", &config.slave.path, "id")?,
//!     );
//!     let store: Arc<dyn SessionStore<i64>> = Arc::new(FileSessionStore::new(&config.state.dir));
//!
//!     let mut opts = ReconcileOptions::new(config.job.id.clone(), config.hash());
//!     opts.checksum = config.job.checksum_options()?;
//!
//!     let report = Reconciler::new(master, slave, store, opts).run().await?;
//!     println!("{} differences", report.totals.total_differences());
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod config;
pub mod connector;
pub mod error;
pub mod nibbler;
pub mod sampler;
pub mod session;
pub mod state;

// Re-exports for convenient access
pub use checksum::{
    ChecksumNibbler, ChecksumOptions, ComparisonTotals, DiffResult, FieldDiff, ReconcileObserver,
};
pub use config::{Config, JobConfig, KeyType, SourceConfig, StateBackendKind, StateConfig};
pub use connector::{
    Connector, ConnectorError, Key, KeyRange, KeyWindow, MemoryConnector, SessionFragment,
};
pub use error::{ReconcileError, Result};
pub use nibbler::{Nibble, NibbleRun, Nibbler, NibblerOptions, StopReason};
pub use session::{
    ProgressEvent, ReconcileOptions, ReconcileReport, Reconciler, Session, SessionStatus,
    TimeBudget,
};
pub use state::{FileSessionStore, MemorySessionStore, NoOpSessionStore, SessionStore};
