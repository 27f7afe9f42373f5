//! Playback source resolution with on-demand refresh of expiring signed URLs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};
use url::form_urlencoded;
use vidpub_api::{coerce_int, VideoSource};
use vidpub_core::{meta, EntryId};
use vidpub_storage::{ContentRepository, OptionStore};

use crate::mapping::{coalesced_string, sanitize_url};

pub const REFRESH_LOCK_PREFIX: &str = "vidpub_refresh_";
pub const REFRESH_LOCK_TTL: Duration = Duration::from_secs(60);
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Whether a pre-signed URL (`X-Amz-Date` + `X-Amz-Expires`) is within a minute of expiring.
/// URLs without both parameters never count as expired.
pub fn is_signed_url_expired(url: &str, now: DateTime<Utc>) -> bool {
    let Some((_, rest)) = url.split_once('?') else {
        return false;
    };
    let query = rest.split('#').next().unwrap_or_default();

    let mut signed_at = String::new();
    let mut expires = 0i64;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.to_ascii_lowercase().as_str() {
            "x-amz-date" => signed_at = value.into_owned(),
            "x-amz-expires" => expires = coerce_int(&JsonValue::String(value.into_owned())),
            _ => {}
        }
    }
    if signed_at.is_empty() || expires <= 0 {
        return false;
    }

    let signed_at: String = signed_at
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, 'T' | 'Z'))
        .collect();
    let Ok(signed_at) = NaiveDateTime::parse_from_str(&signed_at, "%Y%m%dT%H%M%SZ") else {
        return false;
    };
    let expires_at = signed_at.and_utc() + ChronoDuration::seconds(expires);
    now >= expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
}

fn unwrap_video_payload(payload: &JsonValue) -> &JsonValue {
    for key in ["video", "data"] {
        if let Some(inner @ (JsonValue::Object(_) | JsonValue::Array(_))) = payload.get(key) {
            return inner;
        }
    }
    payload
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSource {
    pub entry: EntryId,
    pub video_url: String,
    pub thumbnail_url: String,
    pub playback_url: String,
    /// The URL a player should load.
    pub effective_url: String,
    pub refreshed: bool,
}

pub struct SourceRefresher {
    source: Arc<dyn VideoSource>,
    repo: Arc<dyn ContentRepository>,
    options: Arc<dyn OptionStore>,
}

impl SourceRefresher {
    pub fn new<S>(source: Arc<dyn VideoSource>, store: Arc<S>) -> Self
    where
        S: ContentRepository + OptionStore + 'static,
    {
        Self {
            source,
            repo: store.clone(),
            options: store,
        }
    }

    pub async fn resolve(&self, entry: EntryId) -> Result<ResolvedSource> {
        let stored_video = self.repo.get_meta(entry, meta::VIDEO_URL).await?.unwrap_or_default();
        let stored_thumb = self
            .repo
            .get_meta(entry, meta::THUMBNAIL_URL)
            .await?
            .unwrap_or_default();
        let playback_url = self.playback_url(entry).await?;

        let (video_url, thumbnail_url, refreshed) =
            self.refresh(entry, stored_video, stored_thumb).await?;

        let video_stale = video_url.is_empty() || is_signed_url_expired(&video_url, Utc::now());
        let effective_url = if !playback_url.is_empty() && video_stale {
            playback_url.clone()
        } else {
            video_url.clone()
        };

        Ok(ResolvedSource {
            entry,
            video_url,
            thumbnail_url,
            playback_url,
            effective_url,
            refreshed,
        })
    }

    /// Re-fetches the upstream record when the stored video URL is missing or expired.
    /// Upstream failures fall back to the stored URLs.
    async fn refresh(
        &self,
        entry: EntryId,
        video_url: String,
        thumbnail_url: String,
    ) -> Result<(String, String, bool)> {
        let external_id = self
            .repo
            .get_meta(entry, meta::EXTERNAL_ID)
            .await?
            .unwrap_or_default();
        if external_id.is_empty() {
            return Ok((video_url, thumbnail_url, false));
        }
        if !video_url.is_empty() && !is_signed_url_expired(&video_url, Utc::now()) {
            return Ok((video_url, thumbnail_url, false));
        }

        let lock_key = format!("{REFRESH_LOCK_PREFIX}{entry}");
        if self.options.get_transient(&lock_key).await?.is_some() {
            debug!(%entry, "source refresh already in progress");
            return Ok((video_url, thumbnail_url, false));
        }
        self.options
            .set_transient(&lock_key, json!(1), REFRESH_LOCK_TTL)
            .await?;

        let payload = match self.source.fetch_video(&external_id).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%entry, external_id, "source refresh failed: {err}");
                return Ok((video_url, thumbnail_url, false));
            }
        };
        let record = unwrap_video_payload(&payload);

        let fresh_video = sanitize_url(&coalesced_string(
            record,
            &["playback_url", "playbackUrl", "video_url", "videoUrl", "url"],
        ));
        let fresh_thumb = sanitize_url(&coalesced_string(
            record,
            &["thumbnail_url", "thumbnailUrl", "thumbUrl"],
        ));

        let mut changed = false;
        let video_url = if !fresh_video.is_empty() && fresh_video != video_url {
            self.repo.set_meta(entry, meta::VIDEO_URL, &fresh_video).await?;
            changed = true;
            fresh_video
        } else {
            video_url
        };
        let thumbnail_url = if !fresh_thumb.is_empty() && fresh_thumb != thumbnail_url {
            self.repo
                .set_meta(entry, meta::THUMBNAIL_URL, &fresh_thumb)
                .await?;
            changed = true;
            fresh_thumb
        } else {
            thumbnail_url
        };

        Ok((video_url, thumbnail_url, changed))
    }

    /// Stored playback URL, recovered from the raw payload (and saved) when missing.
    pub async fn playback_url(&self, entry: EntryId) -> Result<String> {
        let stored = self
            .repo
            .get_meta(entry, meta::PLAYBACK_URL)
            .await?
            .unwrap_or_default();
        if !stored.is_empty() {
            return Ok(stored);
        }

        let raw = self
            .repo
            .get_meta(entry, meta::RAW_PAYLOAD)
            .await?
            .unwrap_or_default();
        let Ok(payload) = serde_json::from_str::<JsonValue>(&raw) else {
            return Ok(String::new());
        };
        if !(payload.is_object() || payload.is_array()) {
            return Ok(String::new());
        }

        let playback = coalesced_string(unwrap_video_payload(&payload), &["playback_url", "playbackUrl"]);
        if !playback.is_empty() {
            self.repo
                .set_meta(entry, meta::PLAYBACK_URL, &sanitize_url(&playback))
                .await?;
        }
        Ok(playback)
    }
}
