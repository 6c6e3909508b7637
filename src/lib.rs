//! EcoScan offline-resilience layer.
//!
//! A partitioned cache orchestrator, a generation lifecycle, a health monitor
//! for the remote inference backend, a hybrid remote/local detection router
//! and a persistent sync queue for side effects produced while offline.
//! [`OfflineLayer`] assembles all of them from one [`Config`].

pub mod cache;
pub mod config;
pub mod control;
pub mod detect;
pub mod error;
pub mod health;
pub mod layer;
pub mod lifecycle;
pub mod observability;
pub mod sync;

pub use config::Config;
pub use error::{OfflineError, OfflineResult};
pub use layer::{OfflineLayer, ReportOutcome};
