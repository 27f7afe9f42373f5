//! Local site store: an in-memory content repository, option/transient table and
//! activity log, persisted as a single JSON snapshot.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use vidpub_core::{
    slugify, EntryId, LogEntry, MediaId, NewEntry, PostStatus, Taxonomy, Term, TermId, VideoEntry,
};

use crate::{
    image_extension, write_temp_file, ContentRepository, HttpFetch, HttpRequest, LogStore,
    MediaLibrary, OptionStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    pub entry: EntryId,
    pub source_url: String,
    pub relative_path: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub attached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Transient {
    value: JsonValue,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SiteState {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    entries: BTreeMap<EntryId, VideoEntry>,
    #[serde(default)]
    terms: Vec<Term>,
    #[serde(default)]
    media: BTreeMap<MediaId, MediaRecord>,
    #[serde(default)]
    options: BTreeMap<String, JsonValue>,
    #[serde(default)]
    transients: BTreeMap<String, Transient>,
    #[serde(default)]
    logs: VecDeque<LogEntry>,
}

impl SiteState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn entry_mut(&mut self, id: EntryId) -> anyhow::Result<&mut VideoEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| anyhow!("video entry {id} does not exist"))
    }
}

/// Fetches remote images and files them in a [`MediaLibrary`].
pub struct MediaSideloader {
    http: Arc<dyn HttpFetch>,
    library: MediaLibrary,
    timeout: Duration,
}

impl MediaSideloader {
    pub fn new(http: Arc<dyn HttpFetch>, library: MediaLibrary) -> Self {
        Self {
            http,
            library,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for MediaSideloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSideloader")
            .field("library", &self.library)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct SiteStore {
    state: Mutex<SiteState>,
    snapshot_path: Option<PathBuf>,
    sideloader: Option<MediaSideloader>,
}

impl SiteStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(SiteState::default()),
            snapshot_path: None,
            sideloader: None,
        }
    }

    /// Opens the snapshot at `path`, starting empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            SiteState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path),
            sideloader: None,
        })
    }

    pub fn with_sideloader(mut self, sideloader: MediaSideloader) -> Self {
        self.sideloader = Some(sideloader);
        self
    }

    /// Writes the snapshot atomically. A no-op for in-memory stores.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = {
            let state = self.state.lock().await;
            serde_json::to_vec_pretty(&*state).context("serializing site snapshot")?
        };
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
        let temp_path = parent.join(format!(".site.{}.tmp", Uuid::new_v4()));
        write_temp_file(&temp_path, &bytes).await?;
        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("replacing {}", path.display()));
        }
        debug!(path = %path.display(), bytes = bytes.len(), "site snapshot persisted");
        Ok(())
    }

    pub async fn entry(&self, id: EntryId) -> Option<VideoEntry> {
        self.state.lock().await.entries.get(&id).cloned()
    }

    pub async fn entries(&self) -> Vec<VideoEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }

    pub async fn terms(&self, taxonomy: Taxonomy) -> Vec<Term> {
        self.state
            .lock()
            .await
            .terms
            .iter()
            .filter(|t| t.taxonomy == taxonomy)
            .cloned()
            .collect()
    }

    pub async fn term(&self, id: TermId) -> Option<Term> {
        self.state
            .lock()
            .await
            .terms
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub async fn media(&self, id: MediaId) -> Option<MediaRecord> {
        self.state.lock().await.media.get(&id).cloned()
    }
}

#[async_trait]
impl ContentRepository for SiteStore {
    async fn find_by_external_id(&self, external_id: &str) -> anyhow::Result<Option<EntryId>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .find(|e| e.meta_value(vidpub_core::meta::EXTERNAL_ID) == Some(external_id))
            .map(|e| e.id))
    }

    async fn create_entry(&self, entry: NewEntry) -> anyhow::Result<EntryId> {
        let mut state = self.state.lock().await;
        let id = EntryId(state.allocate_id());
        let now = Utc::now();
        state.entries.insert(
            id,
            VideoEntry {
                id,
                status: entry.status,
                author: entry.author,
                title: entry.title,
                content: entry.content,
                meta: BTreeMap::new(),
                terms: BTreeMap::new(),
                thumbnail: None,
                created_at: now,
                modified_at: now,
            },
        );
        Ok(id)
    }

    async fn update_entry(&self, id: EntryId, title: &str, content: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(id)?;
        entry.title = title.to_string();
        entry.content = content.to_string();
        entry.modified_at = Utc::now();
        Ok(())
    }

    async fn get_meta(&self, id: EntryId, key: &str) -> anyhow::Result<Option<String>> {
        let state = self.state.lock().await;
        let entry = state
            .entries
            .get(&id)
            .ok_or_else(|| anyhow!("video entry {id} does not exist"))?;
        Ok(entry.meta.get(key).cloned())
    }

    async fn set_meta(&self, id: EntryId, key: &str, value: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state
            .entry_mut(id)?
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn find_term(&self, taxonomy: Taxonomy, label: &str) -> anyhow::Result<Option<TermId>> {
        let state = self.state.lock().await;
        Ok(state
            .terms
            .iter()
            .filter(|t| t.taxonomy == taxonomy)
            .find(|t| t.name == label || t.slug == label)
            .map(|t| t.id))
    }

    async fn insert_term(
        &self,
        taxonomy: Taxonomy,
        name: &str,
        slug: Option<&str>,
        parent: Option<TermId>,
    ) -> anyhow::Result<TermId> {
        let name = name.trim();
        if name.is_empty() {
            bail!("term name must not be empty");
        }
        let base_slug = match slug {
            Some(slug) if !slug.trim().is_empty() => slug.trim().to_string(),
            _ => slugify(name),
        };
        let base_slug = if base_slug.is_empty() {
            "term".to_string()
        } else {
            base_slug
        };
        let mut state = self.state.lock().await;
        if state
            .terms
            .iter()
            .any(|t| t.taxonomy == taxonomy && (t.name == name || t.slug == name))
        {
            bail!("term {name:?} already exists in {taxonomy}");
        }
        let slug_taken =
            |candidate: &str| state.terms.iter().any(|t| t.taxonomy == taxonomy && t.slug == candidate);
        let mut slug = base_slug.clone();
        let mut suffix = 2;
        while slug_taken(&slug) {
            slug = format!("{base_slug}-{suffix}");
            suffix += 1;
        }
        if let Some(parent) = parent {
            if !state.terms.iter().any(|t| t.id == parent && t.taxonomy == taxonomy) {
                bail!("parent term {parent} does not exist in {taxonomy}");
            }
        }
        let id = TermId(state.allocate_id());
        state.terms.push(Term {
            id,
            taxonomy,
            name: name.to_string(),
            slug,
            parent,
        });
        Ok(id)
    }

    async fn set_entry_terms(
        &self,
        id: EntryId,
        taxonomy: Taxonomy,
        terms: &[TermId],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(id)?;
        let mut unique = Vec::with_capacity(terms.len());
        for term in terms {
            if !unique.contains(term) {
                unique.push(*term);
            }
        }
        entry.terms.insert(taxonomy, unique);
        Ok(())
    }

    async fn attach_thumbnail_from_url(&self, id: EntryId, url: &str) -> anyhow::Result<MediaId> {
        let sideloader = self
            .sideloader
            .as_ref()
            .context("media sideloading is not configured")?;
        if self.state.lock().await.entries.get(&id).is_none() {
            bail!("video entry {id} does not exist");
        }

        let response = sideloader
            .http
            .execute(HttpRequest::get(url).timeout(sideloader.timeout))
            .await
            .with_context(|| format!("downloading thumbnail {url}"))?;
        if response.body.is_empty() {
            bail!("thumbnail {url} returned an empty body");
        }
        let extension = image_extension(url, response.content_type.as_deref());
        let attached_at = Utc::now();
        let stored = sideloader
            .library
            .store_bytes(attached_at, id, &extension, &response.body)
            .await?;

        let mut state = self.state.lock().await;
        let media_id = MediaId(state.allocate_id());
        state.media.insert(
            media_id,
            MediaRecord {
                id: media_id,
                entry: id,
                source_url: url.to_string(),
                relative_path: stored.relative_path.display().to_string(),
                content_hash: stored.content_hash,
                byte_size: stored.byte_size,
                attached_at,
            },
        );
        state.entry_mut(id)?.thumbnail = Some(media_id);
        Ok(media_id)
    }

    async fn count_by_status(&self) -> anyhow::Result<BTreeMap<PostStatus, usize>> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for entry in state.entries.values() {
            *counts.entry(entry.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl OptionStore for SiteStore {
    async fn get_option(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        Ok(self.state.lock().await.options.get(key).cloned())
    }

    async fn set_option(&self, key: &str, value: JsonValue) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .options
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_option(&self, key: &str) -> anyhow::Result<()> {
        self.state.lock().await.options.remove(key);
        Ok(())
    }

    async fn get_transient(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        let mut state = self.state.lock().await;
        let expired = match state.transients.get(key) {
            None => return Ok(None),
            Some(t) => t.expires_at <= Utc::now(),
        };
        if expired {
            state.transients.remove(key);
            return Ok(None);
        }
        Ok(state.transients.get(key).map(|t| t.value.clone()))
    }

    async fn set_transient(&self, key: &str, value: JsonValue, ttl: Duration) -> anyhow::Result<()> {
        let ttl = chrono::Duration::from_std(ttl).context("transient ttl out of range")?;
        self.state.lock().await.transients.insert(
            key.to_string(),
            Transient {
                value,
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete_transients_with_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.transients.len();
        state.transients.retain(|key, _| !key.starts_with(prefix));
        Ok(before - state.transients.len())
    }
}

#[async_trait]
impl LogStore for SiteStore {
    async fn push_log(&self, entry: LogEntry, max_entries: usize) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.logs.push_front(entry);
        state.logs.truncate(max_entries);
        Ok(())
    }

    async fn logs(&self) -> anyhow::Result<Vec<LogEntry>> {
        Ok(self.state.lock().await.logs.iter().cloned().collect())
    }

    async fn clear_logs(&self) -> anyhow::Result<()> {
        self.state.lock().await.logs.clear();
        Ok(())
    }

    async fn retain_logs_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.logs.len();
        state.logs.retain(|entry| entry.timestamp >= cutoff);
        Ok(before - state.logs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchError, FetchedResponse};
    use serde_json::json;
    use tempfile::tempdir;
    use vidpub_core::{meta, LogLevel};

    struct StaticImage;

    #[async_trait]
    impl HttpFetch for StaticImage {
        async fn execute(&self, request: HttpRequest) -> Result<FetchedResponse, FetchError> {
            if request.url.contains("missing") {
                return Err(FetchError::HttpStatus {
                    status: 404,
                    url: request.url,
                    body: String::new(),
                });
            }
            Ok(FetchedResponse {
                status: 200,
                final_url: request.url,
                content_type: Some("image/png".to_string()),
                body: b"\x89PNG-bytes".to_vec(),
            })
        }
    }

    fn new_entry(title: &str, status: PostStatus) -> NewEntry {
        NewEntry {
            title: title.to_string(),
            content: String::new(),
            status,
            author: 1,
        }
    }

    #[tokio::test]
    async fn external_id_lookup_spans_every_status() {
        let store = SiteStore::in_memory();
        let draft = store.create_entry(new_entry("a", PostStatus::Draft)).await.unwrap();
        store.set_meta(draft, meta::EXTERNAL_ID, "vid-1").await.unwrap();
        let pending = store.create_entry(new_entry("b", PostStatus::Pending)).await.unwrap();
        store.set_meta(pending, meta::EXTERNAL_ID, "vid-2").await.unwrap();

        assert_eq!(store.find_by_external_id("vid-1").await.unwrap(), Some(draft));
        assert_eq!(store.find_by_external_id("vid-2").await.unwrap(), Some(pending));
        assert_eq!(store.find_by_external_id("vid-3").await.unwrap(), None);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&PostStatus::Draft), Some(&1));
        assert_eq!(counts.get(&PostStatus::Pending), Some(&1));
        assert_eq!(counts.get(&PostStatus::Publish), None);
    }

    #[tokio::test]
    async fn terms_match_by_name_or_slug_and_reject_duplicates() {
        let store = SiteStore::in_memory();
        let root = store
            .insert_term(Taxonomy::Actor, "นักแสดง", Some("actors"), None)
            .await
            .unwrap();
        let jane = store
            .insert_term(Taxonomy::Actor, "Jane Doe", None, Some(root))
            .await
            .unwrap();

        assert_eq!(store.find_term(Taxonomy::Actor, "actors").await.unwrap(), Some(root));
        assert_eq!(store.find_term(Taxonomy::Actor, "Jane Doe").await.unwrap(), Some(jane));
        assert_eq!(store.find_term(Taxonomy::Actor, "jane-doe").await.unwrap(), Some(jane));
        assert_eq!(store.find_term(Taxonomy::Tag, "Jane Doe").await.unwrap(), None);
        assert_eq!(store.term(jane).await.unwrap().parent, Some(root));
        assert!(store
            .insert_term(Taxonomy::Actor, "Jane Doe", None, None)
            .await
            .is_err());
        assert!(store
            .insert_term(Taxonomy::Tag, "orphan", None, Some(root))
            .await
            .is_err());

        let shouted = store
            .insert_term(Taxonomy::Actor, "JANE DOE!", None, Some(root))
            .await
            .unwrap();
        assert_eq!(store.term(shouted).await.unwrap().slug, "jane-doe-2");
    }

    #[tokio::test]
    async fn transients_expire_and_clear_by_prefix() {
        let store = SiteStore::in_memory();
        store
            .set_transient("vidpub_page_1", json!({"n": 1}), Duration::from_secs(300))
            .await
            .unwrap();
        store
            .set_transient("vidpub_page_2", json!({"n": 2}), Duration::from_secs(300))
            .await
            .unwrap();
        store
            .set_transient("vidpub_refresh_9", json!(1), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(store.get_transient("vidpub_page_1").await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(store.get_transient("vidpub_refresh_9").await.unwrap(), None);
        assert_eq!(store.delete_transients_with_prefix("vidpub_page_").await.unwrap(), 2);
        assert_eq!(store.get_transient("vidpub_page_2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn log_ring_keeps_newest_entries_first() {
        let store = SiteStore::in_memory();
        for n in 0..5 {
            store
                .push_log(
                    LogEntry {
                        timestamp: Utc::now(),
                        level: LogLevel::Info,
                        message: format!("m{n}"),
                    },
                    3,
                )
                .await
                .unwrap();
        }
        let messages: Vec<_> = store
            .logs()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["m4", "m3", "m2"]);

        let dropped = store
            .retain_logs_since(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(dropped, 3);
        assert!(store.logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("site.json");

        let store = SiteStore::open(&path).await.unwrap();
        let id = store.create_entry(new_entry("Saved", PostStatus::Publish)).await.unwrap();
        store.set_meta(id, meta::EXTERNAL_ID, "vid-9").await.unwrap();
        let tag = store.insert_term(Taxonomy::Tag, "drama", None, None).await.unwrap();
        store.set_entry_terms(id, Taxonomy::Tag, &[tag, tag]).await.unwrap();
        store.set_option("last_sync", json!("2026-01-01 00:00:00")).await.unwrap();
        store.persist().await.unwrap();

        let reopened = SiteStore::open(&path).await.unwrap();
        let entry = reopened.entry(id).await.unwrap();
        assert_eq!(entry.title, "Saved");
        assert_eq!(entry.terms.get(&Taxonomy::Tag), Some(&vec![tag]));
        assert_eq!(reopened.find_by_external_id("vid-9").await.unwrap(), Some(id));
        assert_eq!(
            reopened.get_option("last_sync").await.unwrap(),
            Some(json!("2026-01-01 00:00:00"))
        );
        let next = reopened.create_entry(new_entry("Next", PostStatus::Draft)).await.unwrap();
        assert!(next.0 > tag.0);
    }

    #[tokio::test]
    async fn thumbnails_are_sideloaded_into_the_media_library() {
        let dir = tempdir().expect("tempdir");
        let store = SiteStore::in_memory().with_sideloader(MediaSideloader::new(
            Arc::new(StaticImage),
            MediaLibrary::new(dir.path()),
        ));
        let id = store.create_entry(new_entry("Thumb", PostStatus::Publish)).await.unwrap();

        let media = store
            .attach_thumbnail_from_url(id, "https://cdn.example.com/t.jpg")
            .await
            .unwrap();
        let record = store.media(media).await.unwrap();
        assert_eq!(record.entry, id);
        assert!(record.relative_path.ends_with(".png"));
        assert!(dir.path().join(&record.relative_path).exists());
        assert_eq!(store.entry(id).await.unwrap().thumbnail, Some(media));

        assert!(store
            .attach_thumbnail_from_url(id, "https://cdn.example.com/missing.jpg")
            .await
            .is_err());
        assert_eq!(store.entry(id).await.unwrap().thumbnail, Some(media));
    }

    #[tokio::test]
    async fn sideloading_requires_configuration() {
        let store = SiteStore::in_memory();
        let id = store.create_entry(new_entry("x", PostStatus::Publish)).await.unwrap();
        assert!(store
            .attach_thumbnail_from_url(id, "https://cdn.example.com/t.jpg")
            .await
            .is_err());
    }
}
