//! User-facing activity log, separate from process diagnostics.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};
use vidpub_core::{LogEntry, LogLevel};
use vidpub_storage::LogStore;

pub const LOG_CAPACITY: usize = 100;

#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn LogStore>,
    enabled: bool,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn LogStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Records a message and mirrors it to tracing. Storage failures are only traced.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(target: "vidpub::activity", "{message}"),
            LogLevel::Warning => warn!(target: "vidpub::activity", "{message}"),
            LogLevel::Error => error!(target: "vidpub::activity", "{message}"),
        }
        if !self.enabled {
            return;
        }
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };
        if let Err(err) = self.store.push_log(entry, LOG_CAPACITY).await {
            warn!("could not record activity log entry: {err:#}");
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }

    pub async fn entries(&self) -> Result<Vec<LogEntry>> {
        self.store.logs().await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear_logs().await
    }

    /// Drops entries older than `retention_days`. Zero keeps everything.
    pub async fn clean_old(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        self.store.retain_logs_since(cutoff).await
    }
}
