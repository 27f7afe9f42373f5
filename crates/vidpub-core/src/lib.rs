//! Core domain model for the video publisher sync workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "vidpub-core";

/// Metadata keys stored on every synced video entry.
pub mod meta {
    pub const EXTERNAL_ID: &str = "external_id";
    pub const VIDEO_URL: &str = "video_url";
    pub const PLAYBACK_URL: &str = "playback_url";
    pub const THUMBNAIL_URL: &str = "thumbnail_url";
    pub const DURATION: &str = "duration";
    pub const SOURCE_CREATED_AT: &str = "source_created_at";
    pub const SOURCE_UPDATED_AT: &str = "source_updated_at";
    pub const RAW_PAYLOAD: &str = "raw_payload";
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(EntryId);
id_newtype!(TermId);
id_newtype!(MediaId);

/// Lifecycle state of a video entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    #[default]
    Publish,
    Draft,
    Pending,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Publish => "publish",
            PostStatus::Draft => "draft",
            PostStatus::Pending => "pending",
        }
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publish" => Ok(PostStatus::Publish),
            "draft" => Ok(PostStatus::Draft),
            "pending" => Ok(PostStatus::Pending),
            other => Err(format!("unknown post status: {other}")),
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Taxonomy {
    #[serde(rename = "video_category")]
    Category,
    #[serde(rename = "video_tag")]
    Tag,
    #[serde(rename = "video_actor")]
    Actor,
}

impl Taxonomy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Taxonomy::Category => "video_category",
            Taxonomy::Tag => "video_tag",
            Taxonomy::Actor => "video_actor",
        }
    }
}

impl fmt::Display for Taxonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub taxonomy: Taxonomy,
    pub name: String,
    pub slug: String,
    pub parent: Option<TermId>,
}

/// Lowercased slug with every run of non-alphanumeric characters collapsed to `-`.
pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Persisted video entry as held by a content repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEntry {
    pub id: EntryId,
    pub status: PostStatus,
    pub author: u64,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub terms: BTreeMap<Taxonomy, Vec<TermId>>,
    pub thumbnail: Option<MediaId>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl VideoEntry {
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// Fields needed to create a brand new entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub title: String,
    pub content: String,
    pub status: PostStatus,
    pub author: u64,
}

/// Upstream record after field mapping, ready to upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedVideo {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub video_url: String,
    pub playback_url: String,
    pub thumbnail_url: String,
    pub duration: u64,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub actors: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub raw_payload: String,
}

/// Pagination hints normalized from any supported upstream envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u64,
    pub per_page: Option<u64>,
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
    pub next_page: Option<u64>,
    pub has_more: Option<bool>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: None,
            total: None,
            total_pages: None,
            next_page: None,
            has_more: None,
        }
    }
}

/// Normalized list response: every recognized shape collapses into this contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VideoPage {
    pub data: Vec<JsonValue>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncOptions {
    pub full_sync: bool,
    pub bypass_cache: bool,
    pub since: Option<String>,
}

impl SyncOptions {
    pub fn full() -> Self {
        Self {
            full_sync: true,
            bypass_cache: true,
            since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
}

/// Counters for one sync run. Never persisted beyond the summary log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    pub duration_secs: f64,
}

impl SyncResult {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            processed: 0,
            created: 0,
            updated: 0,
            errors: 0,
            duration_secs: 0.0,
        }
    }

    pub fn record(&mut self, action: UpsertAction) {
        self.processed += 1;
        match action {
            UpsertAction::Created => self.created += 1,
            UpsertAction::Updated => self.updated += 1,
        }
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed ({} created, {} updated, {} errors) in {:.2} seconds",
            self.processed, self.created, self.updated, self.errors, self.duration_secs
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncInterval {
    FiveMinutes,
    FifteenMinutes,
    #[default]
    Hourly,
    #[serde(rename = "twicedaily")]
    TwiceDaily,
    Daily,
}

impl SyncInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncInterval::FiveMinutes => "five_minutes",
            SyncInterval::FifteenMinutes => "fifteen_minutes",
            SyncInterval::Hourly => "hourly",
            SyncInterval::TwiceDaily => "twicedaily",
            SyncInterval::Daily => "daily",
        }
    }

    /// Six-field (seconds first) cron expression for the recurring sync job.
    pub fn cron_expression(&self) -> &'static str {
        match self {
            SyncInterval::FiveMinutes => "0 */5 * * * *",
            SyncInterval::FifteenMinutes => "0 */15 * * * *",
            SyncInterval::Hourly => "0 0 * * * *",
            SyncInterval::TwiceDaily => "0 0 */12 * * *",
            SyncInterval::Daily => "0 0 0 * * *",
        }
    }
}

impl FromStr for SyncInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "five_minutes" => Ok(SyncInterval::FiveMinutes),
            "fifteen_minutes" => Ok(SyncInterval::FifteenMinutes),
            "hourly" => Ok(SyncInterval::Hourly),
            "twicedaily" => Ok(SyncInterval::TwiceDaily),
            "daily" => Ok(SyncInterval::Daily),
            other => Err(format!("unknown sync interval: {other}")),
        }
    }
}

/// Unknown or missing enum values fall back to the default instead of failing the load.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Default,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| value.parse().ok()).unwrap_or_default())
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

/// Flat configuration bag read once per engine construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub sync_interval: SyncInterval,
    #[serde(default, deserialize_with = "lenient")]
    pub post_status: PostStatus,
    #[serde(default)]
    pub post_author: u64,
    #[serde(default = "default_true")]
    pub logging_enabled: bool,
    #[serde(default = "default_retention_days")]
    pub log_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            api_key: String::new(),
            project_id: String::new(),
            sync_interval: SyncInterval::default(),
            post_status: PostStatus::default(),
            post_author: 0,
            logging_enabled: true,
            log_retention_days: default_retention_days(),
        }
    }
}

impl Settings {
    pub fn sanitized(mut self) -> Self {
        self.api_base_url = self.api_base_url.trim().trim_end_matches('/').to_string();
        self.api_key = self.api_key.trim().to_string();
        self.project_id = self.project_id.trim().to_string();
        self
    }

    pub fn is_api_configured(&self) -> bool {
        !self.api_base_url.is_empty() && !self.api_key.is_empty()
    }

    /// Copy with the API key masked, for display surfaces.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            copy.api_key = "********".to_string();
        }
        copy
    }
}
