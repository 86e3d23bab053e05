// SPDX-License-Identifier: MIT
//! Health check system.
//!
//! Provides [`HealthReporter`] that aggregates multiple [`SystemHealthCheck`]
//! implementations into a single [`HealthReport`].
//!
//! # Included checks
//! - [`DatabaseHealthCheck`] — verifies SQLite can handle a `SELECT 1`
//! - [`StorageHealthCheck`] — verifies the data directory is writable
//! - [`MtaBinaryHealthCheck`] — verifies the configured MTA binary is executable
//!
//! # Usage
//! ```rust,no_run
//! use queuewatch::health::{
//!     reporter::HealthReporter,
//!     checks::{DatabaseHealthCheck, StorageHealthCheck, MtaBinaryHealthCheck},
//! };
//!
//! let reporter = HealthReporter::new()
//!     .with_check(DatabaseHealthCheck::new(pool))
//!     .with_check(StorageHealthCheck::new(&data_dir))
//!     .with_check(MtaBinaryHealthCheck::new(&binary_path));
//!
//! let report = reporter.get_health_report().await;
//! println!("overall: {}", report.status);
//! ```

pub mod checks;
pub mod reporter;

// Convenience re-exports.
pub use checks::{
    CheckResult, CheckStatus, DatabaseHealthCheck, MtaBinaryHealthCheck, StorageHealthCheck,
    SystemHealthCheck,
};
pub use reporter::{HealthReport, HealthReporter};
