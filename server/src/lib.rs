//! Player progress store for tapledger, plus the HTTP service in front of it.
//!
//! [`ProgressStore`] owns the record semantics (normalization, merge
//! upserts, aggregation and daily resets) over a pluggable [`store::Backend`].
//! [`Ledger`] wires a store to configuration and metrics for the axum
//! [`Api`].

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

mod aggregate;
mod api;
pub mod clock;
pub mod config;
mod metrics;
mod reset;
pub mod store;

pub use api::Api;
pub use clock::{Clock, SystemClock};
pub use config::{BackendKind, ServerConfig};
pub use metrics::{HttpMetricsSnapshot, LatencySnapshot, StoreMetrics, StoreMetricsSnapshot};
pub use store::{Backend, ProgressStore, ScannedRecord, StoreOptions};

use metrics::HttpMetrics;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller sent something unusable. Nothing was written.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The backend could not be reached or refused the operation.
    #[error("storage unavailable: {0:#}")]
    Storage(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A progress store together with the service configuration around it.
pub struct Ledger {
    pub config: ServerConfig,
    store: Arc<ProgressStore>,
    http_metrics: HttpMetrics,
}

impl Ledger {
    pub fn new(config: ServerConfig, store: ProgressStore) -> Self {
        Self {
            config,
            store: Arc::new(store),
            http_metrics: HttpMetrics::default(),
        }
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    /// Runs `op` against the store on the blocking pool. Backends perform
    /// synchronous I/O and must not run on the async workers.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProgressStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| Error::Storage(anyhow::Error::new(err).context("store task failed")))?
    }

    /// Polls for a civil-day rollover and resets daily counters when one is
    /// seen. Returns `None` when polling is disabled.
    pub fn start_reset_schedule(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let secs = self.config.reset_interval_secs.filter(|secs| *secs > 0)?;
        tracing::info!(interval_secs = secs, "starting daily reset schedule");
        let ledger = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match ledger.blocking(|store| store.reset_if_new_day()).await {
                    Ok(Some(report)) => {
                        tracing::info!(day = %report.day, reset = report.reset, "scheduled daily reset ran");
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!("scheduled daily reset failed: {err}"),
                }
            }
        }))
    }
}
