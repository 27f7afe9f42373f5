//! Sync orchestration: engine, activity log, source refresh, scheduling and runtime wiring.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use vidpub_api::{ApiClient, ApiError, VideoSource};
use vidpub_core::{PostStatus, Settings, SyncOptions, SyncResult};
use vidpub_storage::{
    BackoffPolicy, ContentRepository, HttpClientConfig, HttpFetch, HttpFetcher, MediaLibrary,
    MediaSideloader, OptionStore, SiteStore,
};

pub mod activity;
pub mod config;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod refresh;
pub mod schedule;

pub use activity::ActivityLog;
pub use config::{load_settings, SyncConfig};
pub use engine::SyncEngine;
pub use error::{RecordError, SyncError};
pub use refresh::{is_signed_url_expired, ResolvedSource, SourceRefresher};
pub use schedule::{build_scheduler, maybe_build_scheduler, run_scheduled_sync, ScheduledRun};

pub const CRATE_NAME: &str = "vidpub-sync";

/// Wall-clock budget for one sync run started by the runtime.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub total: usize,
    pub published: usize,
    pub drafts: usize,
    pub pending: usize,
    pub last_sync: String,
}

/// Everything a sync surface needs, built once from configuration.
pub struct SyncRuntime {
    config: SyncConfig,
    settings: Settings,
    store: Arc<SiteStore>,
    source: Arc<dyn VideoSource>,
    engine: SyncEngine,
}

impl SyncRuntime {
    pub async fn from_env() -> anyhow::Result<Self> {
        Self::new(SyncConfig::from_env()).await
    }

    pub async fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let settings = load_settings(&config.settings_path).await?;
        debug!(settings = ?settings.redacted(), "settings loaded");
        let http: Arc<dyn HttpFetch> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..BackoffPolicy::default()
            },
        })?);
        let store = SiteStore::open(&config.state_path)
            .await
            .context("opening site store")?
            .with_sideloader(MediaSideloader::new(
                http.clone(),
                MediaLibrary::new(config.media_dir.clone()),
            ));
        let source: Arc<dyn VideoSource> =
            Arc::new(ApiClient::new(http, &settings).with_user_agent(config.user_agent.clone()));
        Ok(Self::with_parts(config, settings, Arc::new(store), source))
    }

    pub fn with_parts(
        config: SyncConfig,
        settings: Settings,
        store: Arc<SiteStore>,
        source: Arc<dyn VideoSource>,
    ) -> Self {
        let engine = SyncEngine::new(source.clone(), store.clone(), settings.clone());
        Self {
            config,
            settings,
            store,
            source,
            engine,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<SiteStore> {
        &self.store
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn activity(&self) -> &ActivityLog {
        self.engine.activity()
    }

    pub fn refresher(&self) -> SourceRefresher {
        SourceRefresher::new(self.source.clone(), self.store.clone())
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        self.store.persist().await
    }

    pub async fn run_sync(&self, options: SyncOptions) -> Result<SyncResult, SyncError> {
        let outcome = bounded(self.engine.sync(options)).await;
        self.finish(outcome).await
    }

    pub async fn run_force_sync(
        &self,
        trigger_api: bool,
        payload: Option<serde_json::Value>,
    ) -> Result<SyncResult, SyncError> {
        let outcome = bounded(self.engine.force_sync(trigger_api, payload)).await;
        self.finish(outcome).await
    }

    /// Admin "sync now": ask upstream to refresh, then pull incrementally.
    pub async fn manual_sync(&self) -> Result<SyncResult, SyncError> {
        if let Err(err) = self.engine.trigger_remote(&json!({"limit": 1000})).await {
            return self.finish(Err(err)).await;
        }
        self.run_sync(SyncOptions::default()).await
    }

    pub async fn test_connection(&self) -> Result<(), ApiError> {
        self.source.test_connection().await
    }

    pub async fn stats(&self) -> anyhow::Result<SyncStats> {
        let counts = self.store.count_by_status().await?;
        let count = |status: PostStatus| counts.get(&status).copied().unwrap_or(0);
        let (published, drafts, pending) = (
            count(PostStatus::Publish),
            count(PostStatus::Draft),
            count(PostStatus::Pending),
        );
        Ok(SyncStats {
            total: published + drafts + pending,
            published,
            drafts,
            pending,
            last_sync: self
                .engine
                .last_sync()
                .await?
                .unwrap_or_else(|| "Never".to_string()),
        })
    }

    pub async fn clear_logs(&self) -> anyhow::Result<()> {
        self.activity().clear().await?;
        self.persist().await
    }

    /// Forgets the watermark, the activity log and every cached transient.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.store.delete_option(engine::LAST_SYNC_OPTION).await?;
        self.activity().clear().await?;
        for prefix in [engine::PAGE_CACHE_PREFIX, refresh::REFRESH_LOCK_PREFIX] {
            self.store.delete_transients_with_prefix(prefix).await?;
        }
        self.persist().await
    }

    async fn finish(
        &self,
        outcome: Result<SyncResult, SyncError>,
    ) -> Result<SyncResult, SyncError> {
        match (outcome, self.persist().await) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(err)) => Err(SyncError::Storage(err)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(persist_err)) => {
                warn!("could not persist site state after failed sync: {persist_err:#}");
                Err(err)
            }
        }
    }
}

async fn bounded<F>(run: F) -> Result<SyncResult, SyncError>
where
    F: Future<Output = Result<SyncResult, SyncError>>,
{
    tokio::time::timeout(RUN_TIMEOUT, run)
        .await
        .unwrap_or(Err(SyncError::TimedOut(RUN_TIMEOUT.as_secs())))
}

pub async fn run_sync_once_from_env(options: SyncOptions) -> anyhow::Result<SyncResult> {
    let runtime = SyncRuntime::from_env().await?;
    Ok(runtime.run_sync(options).await?)
}
