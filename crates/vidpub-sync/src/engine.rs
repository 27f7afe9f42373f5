//! Paginated pull of upstream videos and idempotent upsert into the content repository.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tokio::sync::OnceCell;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use vidpub_api::{ListQuery, VideoSource};
use vidpub_core::{
    meta, EntryId, MappedVideo, NewEntry, Pagination, Settings, SyncOptions, SyncResult, Taxonomy,
    TermId, UpsertAction, VideoPage,
};
use vidpub_storage::{ContentRepository, LogStore, OptionStore};

use crate::activity::ActivityLog;
use crate::error::{RecordError, SyncError};
use crate::mapping::map_video_fields;

pub const PER_PAGE: u64 = 50;
pub const MAX_PAGES: u64 = 100;
pub const PAGE_CACHE_PREFIX: &str = "vidpub_page_";
pub const PAGE_CACHE_TTL: Duration = Duration::from_secs(300);
pub const LAST_SYNC_OPTION: &str = "last_sync";
pub const WATERMARK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const ACTOR_ROOT_SLUG: &str = "actors";
pub const ACTOR_ROOT_NAME: &str = "นักแสดง";

/// Whether another page should be requested after `page` returned `count` records.
/// Without any paging hint the response counts as a single page.
pub fn should_continue(pagination: &Pagination, page: u64, count: usize) -> bool {
    if count == 0 {
        return false;
    }
    if let Some(has_more) = pagination.has_more {
        return has_more;
    }
    if pagination.next_page.is_some_and(|next| next > page) {
        return true;
    }
    pagination.page < pagination.total_pages.unwrap_or(1)
}

pub fn next_page_number(pagination: &Pagination, page: u64) -> u64 {
    pagination
        .next_page
        .filter(|next| *next > page)
        .unwrap_or(page + 1)
}

fn display_id(record: &JsonValue) -> String {
    match record.get("id") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    }
}

pub struct SyncEngine {
    source: Arc<dyn VideoSource>,
    repo: Arc<dyn ContentRepository>,
    options: Arc<dyn OptionStore>,
    log: ActivityLog,
    settings: Settings,
    actor_root: OnceCell<TermId>,
}

impl SyncEngine {
    pub fn new<S>(source: Arc<dyn VideoSource>, store: Arc<S>, settings: Settings) -> Self
    where
        S: ContentRepository + OptionStore + LogStore + 'static,
    {
        let log = ActivityLog::new(store.clone(), settings.logging_enabled);
        Self {
            source,
            repo: store.clone(),
            options: store,
            log,
            settings,
            actor_root: OnceCell::new(),
        }
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.log
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn sync(&self, options: SyncOptions) -> Result<SyncResult, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, full_sync = options.full_sync);
        self.run(run_id, options).instrument(span).await
    }

    /// Optionally asks upstream to refresh first, then runs a full, uncached sync.
    pub async fn force_sync(
        &self,
        trigger_api: bool,
        payload: Option<JsonValue>,
    ) -> Result<SyncResult, SyncError> {
        if trigger_api {
            let payload = payload
                .filter(|p| !(p.is_null() || p.as_object().is_some_and(|o| o.is_empty())))
                .unwrap_or_else(|| json!({"limit": 1000}));
            self.trigger_remote(&payload).await?;
        }
        self.sync(SyncOptions::full()).await
    }

    /// Asks upstream to refresh its catalogue. Failures land in the activity log.
    pub async fn trigger_remote(&self, payload: &JsonValue) -> Result<JsonValue, SyncError> {
        match self.source.trigger_remote_sync(payload).await {
            Ok(response) => {
                debug!(%response, "remote sync triggered");
                Ok(response)
            }
            Err(err) => {
                self.log.error(err.to_string()).await;
                Err(SyncError::RemoteTrigger(err))
            }
        }
    }

    pub async fn last_sync(&self) -> anyhow::Result<Option<String>> {
        Ok(self
            .options
            .get_option(LAST_SYNC_OPTION)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty()))
    }

    async fn run(&self, run_id: Uuid, options: SyncOptions) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        let full_sync = options.full_sync;
        let bypass_cache = options.bypass_cache || full_sync;

        let watermark = if full_sync {
            None
        } else {
            match options.since.filter(|s| !s.is_empty()) {
                Some(since) => Some(since),
                None => self.last_sync().await?,
            }
        };

        if full_sync {
            let cleared = self
                .options
                .delete_transients_with_prefix(PAGE_CACHE_PREFIX)
                .await?;
            debug!(cleared, "cleared cached pages");
        }

        let label = if full_sync { "Starting full sync" } else { "Starting sync" };
        match &watermark {
            Some(since) => self.log.info(format!("{label} (since {since})")).await,
            None => self.log.info(label).await,
        }

        let mut result = SyncResult::new(run_id);
        let mut page = 1u64;
        loop {
            let response = self.load_page(page, watermark.as_deref(), bypass_cache).await?;

            for record in &response.data {
                match self.process_video(record).await {
                    Ok(action) => result.record(action),
                    Err(err) => {
                        result.errors += 1;
                        self.log
                            .error(format!("Failed to process video {}: {err}", display_id(record)))
                            .await;
                    }
                }
            }

            if !should_continue(&response.pagination, page, response.data.len()) {
                break;
            }
            page = next_page_number(&response.pagination, page);
            if page > MAX_PAGES {
                self.log.warning("Sync stopped: reached page limit").await;
                break;
            }
        }

        let now = Utc::now().format(WATERMARK_FORMAT).to_string();
        self.options.set_option(LAST_SYNC_OPTION, json!(now)).await?;

        result.duration_secs = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        self.log.info(format!("Sync completed: {result}")).await;
        Ok(result)
    }

    async fn load_page(
        &self,
        page: u64,
        since: Option<&str>,
        bypass_cache: bool,
    ) -> Result<VideoPage, SyncError> {
        let cache_key = format!("{PAGE_CACHE_PREFIX}{page}");
        if !bypass_cache {
            if let Some(cached) = self.options.get_transient(&cache_key).await? {
                match serde_json::from_value::<VideoPage>(cached) {
                    Ok(cached) => {
                        debug!(page, "using cached page");
                        return Ok(cached);
                    }
                    Err(err) => warn!(page, "discarding unreadable cached page: {err}"),
                }
            }
        }

        let query = ListQuery {
            page,
            per_page: PER_PAGE,
            since: since.map(str::to_string),
        };
        let fetched = match self.source.fetch_videos(&query).await {
            Ok(fetched) => fetched,
            Err(source) => {
                self.log
                    .error(format!("Sync failed on page {page}: {source}"))
                    .await;
                return Err(SyncError::Page { page, source });
            }
        };

        if !bypass_cache {
            let value = serde_json::to_value(&fetched).context("serializing page for cache")?;
            self.options
                .set_transient(&cache_key, value, PAGE_CACHE_TTL)
                .await?;
        }
        Ok(fetched)
    }

    /// Maps one upstream record and creates or updates its entry.
    pub async fn process_video(&self, record: &JsonValue) -> Result<UpsertAction, RecordError> {
        let mapped = map_video_fields(record)?;
        match self.repo.find_by_external_id(&mapped.external_id).await? {
            Some(id) => {
                self.update_entry(id, &mapped).await?;
                Ok(UpsertAction::Updated)
            }
            None => {
                self.create_entry(&mapped).await?;
                Ok(UpsertAction::Created)
            }
        }
    }

    async fn create_entry(&self, video: &MappedVideo) -> anyhow::Result<EntryId> {
        let id = self
            .repo
            .create_entry(NewEntry {
                title: video.title.clone(),
                content: video.description.clone(),
                status: self.settings.post_status,
                author: self.settings.post_author,
            })
            .await?;
        self.save_meta(id, video).await?;
        self.assign_terms(id, video).await?;
        if !video.thumbnail_url.is_empty() {
            self.attach_thumbnail(id, &video.thumbnail_url).await;
        }
        Ok(id)
    }

    async fn update_entry(&self, id: EntryId, video: &MappedVideo) -> anyhow::Result<()> {
        let previous_thumbnail = self.repo.get_meta(id, meta::THUMBNAIL_URL).await?;
        self.repo
            .update_entry(id, &video.title, &video.description)
            .await?;
        self.save_meta(id, video).await?;
        self.assign_terms(id, video).await?;
        if !video.thumbnail_url.is_empty()
            && previous_thumbnail.as_deref() != Some(video.thumbnail_url.as_str())
        {
            self.attach_thumbnail(id, &video.thumbnail_url).await;
        }
        Ok(())
    }

    async fn save_meta(&self, id: EntryId, video: &MappedVideo) -> anyhow::Result<()> {
        let duration = video.duration.to_string();
        let fields = [
            (meta::EXTERNAL_ID, video.external_id.as_str()),
            (meta::VIDEO_URL, video.video_url.as_str()),
            (meta::PLAYBACK_URL, video.playback_url.as_str()),
            (meta::THUMBNAIL_URL, video.thumbnail_url.as_str()),
            (meta::DURATION, duration.as_str()),
            (meta::SOURCE_CREATED_AT, video.created_at.as_str()),
            (meta::SOURCE_UPDATED_AT, video.updated_at.as_str()),
            (meta::RAW_PAYLOAD, video.raw_payload.as_str()),
        ];
        for (key, value) in fields {
            self.repo.set_meta(id, key, value).await?;
        }
        Ok(())
    }

    async fn assign_terms(&self, id: EntryId, video: &MappedVideo) -> anyhow::Result<()> {
        for (taxonomy, labels) in [
            (Taxonomy::Category, &video.categories),
            (Taxonomy::Tag, &video.tags),
        ] {
            if labels.is_empty() {
                continue;
            }
            let mut term_ids = Vec::with_capacity(labels.len());
            for label in labels {
                match self.resolve_term(taxonomy, label, None).await {
                    Ok(term) => term_ids.push(term),
                    Err(err) => warn!(%id, label, "skipping {taxonomy} term: {err:#}"),
                }
            }
            if !term_ids.is_empty() {
                self.repo.set_entry_terms(id, taxonomy, &term_ids).await?;
            }
        }

        if !video.actors.is_empty() {
            let parent = self.actor_root().await;
            let mut term_ids = Vec::with_capacity(video.actors.len());
            for actor in &video.actors {
                match self.resolve_term(Taxonomy::Actor, actor, parent).await {
                    Ok(term) => term_ids.push(term),
                    Err(err) => warn!(%id, actor, "skipping actor term: {err:#}"),
                }
            }
            if !term_ids.is_empty() {
                self.repo
                    .set_entry_terms(id, Taxonomy::Actor, &term_ids)
                    .await?;
            }
        }
        Ok(())
    }

    async fn resolve_term(
        &self,
        taxonomy: Taxonomy,
        label: &str,
        parent: Option<TermId>,
    ) -> anyhow::Result<TermId> {
        if let Some(existing) = self.repo.find_term(taxonomy, label).await? {
            return Ok(existing);
        }
        self.repo
            .insert_term(taxonomy, label, None, parent)
            .await
            .with_context(|| format!("creating {taxonomy} term {label:?}"))
    }

    /// The root actor term, created on first use. Without it actors land at the root.
    async fn actor_root(&self) -> Option<TermId> {
        let root = self
            .actor_root
            .get_or_try_init(|| async {
                if let Some(found) = self.repo.find_term(Taxonomy::Actor, ACTOR_ROOT_SLUG).await? {
                    return Ok(found);
                }
                if let Some(found) = self.repo.find_term(Taxonomy::Actor, ACTOR_ROOT_NAME).await? {
                    return Ok(found);
                }
                self.repo
                    .insert_term(Taxonomy::Actor, ACTOR_ROOT_NAME, Some(ACTOR_ROOT_SLUG), None)
                    .await
            })
            .await;
        match root {
            Ok(root) => Some(*root),
            Err(err) => {
                warn!("actor root term unavailable: {err:#}");
                None
            }
        }
    }

    async fn attach_thumbnail(&self, id: EntryId, url: &str) {
        if let Err(err) = self.repo.attach_thumbnail_from_url(id, url).await {
            warn!(%id, url, "thumbnail sideload failed: {err:#}");
        }
    }
}
