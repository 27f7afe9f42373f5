//! Upstream media-storage API client and response normalization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, instrument};
use url::form_urlencoded;
use vidpub_core::{Pagination, Settings, VideoPage};
use vidpub_storage::{FetchError, FetchedResponse, HttpFetch, HttpRequest};

pub const CRATE_NAME: &str = "vidpub-api";

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const SINGLE_TIMEOUT: Duration = Duration::from_secs(15);
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API credentials not configured")]
    NotConfigured,
    #[error("API request failed: {0}")]
    Transport(String),
    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to parse API response")]
    Json(#[source] serde_json::Error),
    #[error("API response does not include video data")]
    InvalidResponse,
    #[error("API sync returned status {status}: {body}")]
    SyncStatus { status: u16, body: String },
    #[error("API sync request failed: {0}")]
    SyncTransport(String),
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } => ApiError::Status { status, body },
            other => ApiError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u64,
    pub per_page: u64,
    pub since: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
            since: None,
        }
    }
}

/// Where the sync engine and the refresh path read videos from.
#[async_trait]
pub trait VideoSource: Send + Sync {
    async fn fetch_videos(&self, query: &ListQuery) -> Result<VideoPage, ApiError>;

    async fn fetch_video(&self, video_id: &str) -> Result<JsonValue, ApiError>;

    /// Asks the upstream service to refresh its own catalogue before a pull.
    async fn trigger_remote_sync(&self, payload: &JsonValue) -> Result<JsonValue, ApiError>;

    async fn test_connection(&self) -> Result<(), ApiError> {
        self.fetch_videos(&ListQuery {
            page: 1,
            per_page: 1,
            since: None,
        })
        .await
        .map(|_| ())
    }
}

pub struct ApiClient {
    http: Arc<dyn HttpFetch>,
    base_url: String,
    api_key: String,
    project_id: String,
    user_agent: String,
}

impl ApiClient {
    pub fn new(http: Arc<dyn HttpFetch>, settings: &Settings) -> Self {
        Self {
            http,
            base_url: settings.api_base_url.trim().trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            project_id: settings.project_id.clone(),
            user_agent: format!("vidpub/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    fn ensure_configured(&self) -> Result<(), ApiError> {
        if self.base_url.is_empty() || self.api_key.is_empty() {
            return Err(ApiError::NotConfigured);
        }
        Ok(())
    }

    pub fn videos_endpoint(&self) -> String {
        if self.base_url.is_empty() {
            return "/videos".to_string();
        }
        if ends_with_path_segment(&self.base_url, "videos") {
            return self.base_url.clone();
        }
        format!("{}/videos", self.base_url)
    }

    pub fn list_url(&self, query: &ListQuery) -> String {
        let per_page = query.per_page.to_string();
        let mut qs = form_urlencoded::Serializer::new(String::new());
        qs.append_pair("page", &query.page.to_string())
            .append_pair("per_page", &per_page)
            .append_pair("limit", &per_page);
        if let Some(since) = query.since.as_deref().filter(|s| !s.is_empty()) {
            qs.append_pair("since", since);
        }
        if !self.project_id.is_empty() {
            qs.append_pair("project_id", &self.project_id);
        }
        format!("{}?{}", self.videos_endpoint(), qs.finish())
    }

    pub fn single_url(&self, video_id: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(video_id.as_bytes()).collect();
        format!("{}/{}", self.videos_endpoint(), encoded)
    }

    pub fn remote_sync_url(&self) -> String {
        let base = &self.base_url;
        if base.is_empty() {
            return "/api/plugin/videos/sync".to_string();
        }
        if ends_with_path_segment(base, "sync") {
            base.clone()
        } else if ends_with_path_segment(base, "videos") {
            format!("{base}/sync")
        } else if ends_with_path_segment(base, "plugin") {
            format!("{base}/videos/sync")
        } else if ends_with_path_segment(base, "api") {
            format!("{base}/plugin/videos/sync")
        } else {
            format!("{base}/api/plugin/videos/sync")
        }
    }

    fn authorized(&self, request: HttpRequest) -> HttpRequest {
        request
            .bearer(&self.api_key)
            .header("Accept", "application/json")
            .header("User-Agent", self.user_agent.clone())
    }
}

#[async_trait]
impl VideoSource for ApiClient {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_videos(&self, query: &ListQuery) -> Result<VideoPage, ApiError> {
        self.ensure_configured()?;
        let request = self.authorized(HttpRequest::get(self.list_url(query))).timeout(LIST_TIMEOUT);
        let response = self.http.execute(request).await.map_err(|err| {
            let err = ApiError::from(err);
            error!(page = query.page, "{err}");
            err
        })?;
        normalize_list_response(&decode_json(&response)?)
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch_video(&self, video_id: &str) -> Result<JsonValue, ApiError> {
        self.ensure_configured()?;
        let request =
            self.authorized(HttpRequest::get(self.single_url(video_id))).timeout(SINGLE_TIMEOUT);
        let response = self.http.execute(request).await?;
        Ok(normalize_single_response(decode_json(&response)?))
    }

    #[instrument(level = "debug", skip(self, payload))]
    async fn trigger_remote_sync(&self, payload: &JsonValue) -> Result<JsonValue, ApiError> {
        self.ensure_configured()?;
        let body = serde_json::to_vec(payload).map_err(ApiError::Json)?;
        let request = self
            .authorized(HttpRequest::post(self.remote_sync_url(), body))
            .header("Content-Type", "application/json")
            .timeout(TRIGGER_TIMEOUT);
        let response = self.http.execute(request).await.map_err(|err| {
            let err = match err {
                FetchError::HttpStatus { status, body, .. } => ApiError::SyncStatus { status, body },
                other => ApiError::SyncTransport(other.to_string()),
            };
            error!("{err}");
            err
        })?;

        match serde_json::from_slice::<JsonValue>(&response.body) {
            Ok(value @ (JsonValue::Object(_) | JsonValue::Array(_))) => Ok(value),
            _ => Ok(json!({
                "status_code": response.status,
                "body": String::from_utf8_lossy(&response.body),
            })),
        }
    }
}

fn decode_json(response: &FetchedResponse) -> Result<JsonValue, ApiError> {
    serde_json::from_slice(&response.body).map_err(ApiError::Json)
}

fn ends_with_path_segment(url: &str, segment: &str) -> bool {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .is_some_and(|last| last.eq_ignore_ascii_case(segment))
}

/// Collapses every supported list envelope into `{ data, pagination }`.
pub fn normalize_list_response(data: &JsonValue) -> Result<VideoPage, ApiError> {
    let videos = extract_videos(data).ok_or(ApiError::InvalidResponse)?;
    Ok(VideoPage {
        data: videos,
        pagination: extract_pagination(data),
    })
}

/// Unwraps `video` or a video-like `data` member; otherwise returns the payload itself.
pub fn normalize_single_response(data: JsonValue) -> JsonValue {
    if let JsonValue::Object(mut map) = data {
        if matches!(map.get("video"), Some(JsonValue::Object(_))) {
            return map.remove("video").unwrap_or_default();
        }
        if map.get("data").is_some_and(looks_like_video) {
            return map.remove("data").unwrap_or_default();
        }
        return JsonValue::Object(map);
    }
    data
}

/// An object with a non-null `id`, `video_url` or `videoUrl`.
pub fn looks_like_video(value: &JsonValue) -> bool {
    value.as_object().is_some_and(|map| {
        ["id", "video_url", "videoUrl"]
            .iter()
            .any(|key| map.get(*key).is_some_and(|v| !v.is_null()))
    })
}

/// Arrays are lists; an empty object decodes the same as an empty list.
fn as_list(value: &JsonValue) -> Option<Vec<JsonValue>> {
    match value {
        JsonValue::Array(items) => Some(items.clone()),
        JsonValue::Object(map) if map.is_empty() => Some(Vec::new()),
        _ => None,
    }
}

fn present<'a>(value: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    value.get(key).filter(|v| !v.is_null())
}

fn list_or_single_video(value: &JsonValue) -> Option<Vec<JsonValue>> {
    as_list(value).or_else(|| looks_like_video(value).then(|| vec![value.clone()]))
}

fn extract_videos(data: &JsonValue) -> Option<Vec<JsonValue>> {
    if let Some(list) = as_list(data) {
        return Some(list);
    }

    if let Some(inner) = present(data, "data") {
        if let Some(list) = list_or_single_video(inner) {
            return Some(list);
        }
        if let Some(nested) = present(inner, "videos").filter(|v| v.is_object() || v.is_array()) {
            if let Some(list) = list_or_single_video(nested) {
                return Some(list);
            }
        }
    }

    if let Some(videos) = present(data, "videos").filter(|v| v.is_object() || v.is_array()) {
        if let Some(list) = list_or_single_video(videos) {
            return Some(list);
        }
    }

    for key in ["items", "results"] {
        if let Some(list) = present(data, key).and_then(as_list) {
            return Some(list);
        }
    }

    present(data, "video")
        .filter(|v| v.is_object() || v.is_array())
        .map(|v| vec![v.clone()])
}

fn pick<'a>(
    nested: &'a Map<String, JsonValue>,
    top: &'a JsonValue,
    nested_keys: &[&str],
    top_keys: &[&str],
) -> Option<&'a JsonValue> {
    nested_keys
        .iter()
        .find_map(|key| nested.get(*key).filter(|v| !v.is_null()))
        .or_else(|| top_keys.iter().find_map(|key| present(top, key)))
}

/// Integer coercion tolerant of numeric strings, floats and booleans.
pub fn coerce_int(value: &JsonValue) -> i64 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Bool(b) => i64::from(*b),
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        JsonValue::String(s) => leading_int(s),
        JsonValue::Array(items) => i64::from(!items.is_empty()),
        JsonValue::Object(map) => i64::from(!map.is_empty()),
    }
}

fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().map(|n| sign * n).unwrap_or(0)
}

pub fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty() && s != "0",
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

fn positive(value: i64) -> Option<u64> {
    u64::try_from(value).ok().filter(|v| *v > 0)
}

fn non_negative(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

/// Reads pagination from `pagination` or `meta`, falling back to top-level keys.
pub fn extract_pagination(data: &JsonValue) -> Pagination {
    let empty = Map::new();
    let nested = data
        .get("pagination")
        .and_then(JsonValue::as_object)
        .or_else(|| data.get("meta").and_then(JsonValue::as_object))
        .unwrap_or(&empty);

    let page = pick(nested, data, &["page", "current_page", "currentPage"], &["page"])
        .map(coerce_int)
        .unwrap_or(1);
    let per_page = pick(
        nested,
        data,
        &["per_page", "perPage", "limit", "page_size", "pageSize"],
        &["per_page", "perPage", "limit"],
    )
    .map(coerce_int);
    let total = pick(
        nested,
        data,
        &["total", "total_count", "totalCount"],
        &["total", "totalCount"],
    )
    .map(coerce_int);
    let mut total_pages = pick(
        nested,
        data,
        &["total_pages", "totalPages", "last_page", "pages"],
        &["total_pages", "totalPages"],
    )
    .map(coerce_int);
    let next_page = pick(nested, data, &["next_page", "nextPage"], &["next_page", "nextPage"])
        .map(coerce_int);
    let has_more_flag = pick(nested, data, &["has_more", "hasMore"], &["has_more", "hasMore"]);

    let per_page_known = per_page.filter(|pp| *pp != 0);

    if total_pages.map_or(true, |tp| tp < 1) {
        if let (Some(total), Some(pp)) = (total, per_page_known) {
            let (total, pp) = (total.max(0), pp.max(1));
            total_pages = Some(total / pp + i64::from(total % pp != 0));
        }
    }

    let has_more = if let Some(flag) = has_more_flag {
        Some(truthy(flag))
    } else if next_page.is_some_and(|next| next != 0 && next > page) {
        Some(true)
    } else if let (Some(total), Some(pp)) = (total, per_page_known) {
        Some(page.saturating_mul(pp) < total)
    } else {
        total_pages.map(|tp| page < tp)
    };

    Pagination {
        page: positive(page).unwrap_or(1),
        per_page: per_page.and_then(non_negative),
        total: total.and_then(non_negative),
        total_pages: total_pages.and_then(positive),
        next_page: next_page.and_then(positive),
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tokio::sync::Mutex;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .and_then(Path::parent)
            .expect("workspace root")
            .to_path_buf()
    }

    fn fixture(name: &str) -> JsonValue {
        let path = workspace_root().join("fixtures").join("api").join(name);
        let text = fs::read_to_string(&path).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    fn ids(page: &VideoPage) -> Vec<String> {
        page.data
            .iter()
            .map(|v| match v.get("id") {
                Some(JsonValue::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "-".to_string(),
            })
            .collect()
    }

    #[test]
    fn top_level_list_is_taken_as_is() {
        let page = normalize_list_response(&fixture("list_top_level.json")).unwrap();
        assert_eq!(ids(&page), vec!["vid-001", "vid-002"]);
        assert_eq!(page.pagination, Pagination::default());
    }

    #[test]
    fn data_list_with_total_derives_page_count() {
        let page = normalize_list_response(&fixture("list_data_pagination.json")).unwrap();
        assert_eq!(ids(&page), vec!["vid-010", "vid-011"]);
        assert_eq!(page.pagination.total_pages, Some(3));
        assert_eq!(page.pagination.has_more, Some(true));
    }

    #[test]
    fn single_video_under_data_becomes_one_item_list() {
        let page = normalize_list_response(&fixture("data_single.json")).unwrap();
        assert_eq!(ids(&page), vec!["vid-020"]);
    }

    #[test]
    fn nested_data_videos_with_meta_pagination() {
        let page = normalize_list_response(&fixture("data_videos_meta.json")).unwrap();
        assert_eq!(ids(&page), vec!["vid-030", "vid-031"]);
        assert_eq!(page.pagination.page, 2);
        assert_eq!(page.pagination.total_pages, Some(3));
        assert_eq!(page.pagination.has_more, Some(true));
    }

    #[test]
    fn single_videos_object_with_camel_case_flag() {
        let page = normalize_list_response(&fixture("videos_single.json")).unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.pagination.has_more, Some(false));
    }

    #[test]
    fn items_with_top_level_next_page() {
        let page = normalize_list_response(&fixture("items_next_page.json")).unwrap();
        assert_eq!(ids(&page), vec!["40"]);
        assert_eq!(page.pagination.page, 2);
        assert_eq!(page.pagination.next_page, Some(3));
        assert_eq!(page.pagination.has_more, Some(true));
    }

    #[test]
    fn results_with_string_counts() {
        let page = normalize_list_response(&fixture("results_string_counts.json")).unwrap();
        assert_eq!(ids(&page), vec!["vid-050", "vid-051"]);
        assert_eq!(page.pagination.per_page, Some(2));
        assert_eq!(page.pagination.total, Some(4));
        assert_eq!(page.pagination.total_pages, Some(2));
        assert_eq!(page.pagination.has_more, Some(false));
    }

    #[test]
    fn bare_video_wrapper_is_accepted() {
        let page = normalize_list_response(&fixture("video_wrapper.json")).unwrap();
        assert_eq!(ids(&page), vec!["vid-060"]);
    }

    #[test]
    fn unrecognized_shape_is_an_error() {
        let err = normalize_list_response(&fixture("unrecognized.json")).unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse));
        assert_eq!(err.to_string(), "API response does not include video data");
        assert!(normalize_list_response(&json!("just a string")).is_err());
    }

    #[test]
    fn empty_object_counts_as_empty_list() {
        let page = normalize_list_response(&json!({"data": {}})).unwrap();
        assert!(page.data.is_empty());
    }

    #[test]
    fn has_more_prefers_explicit_flag() {
        let p = extract_pagination(&json!({
            "pagination": {"page": 1, "has_more": false, "next_page": 2, "total": 100, "per_page": 10}
        }));
        assert_eq!(p.has_more, Some(false));
    }

    #[test]
    fn has_more_falls_back_to_next_page() {
        let p = extract_pagination(&json!({
            "pagination": {"page": 1, "nextPage": 2, "total": 5, "per_page": 10}
        }));
        assert_eq!(p.has_more, Some(true));

        let stale = extract_pagination(&json!({"pagination": {"page": 3, "next_page": 3}}));
        assert_eq!(stale.has_more, Some(false));
    }

    #[test]
    fn has_more_falls_back_to_total_arithmetic() {
        let p = extract_pagination(&json!({"meta": {"page": 2, "perPage": 25, "totalCount": 50}}));
        assert_eq!(p.has_more, Some(false));
        assert_eq!(p.total_pages, Some(2));

        let odd = extract_pagination(&json!({"total": 7, "per_page": 2}));
        assert_eq!(odd.total_pages, Some(4));

        let huge = extract_pagination(&json!({"total": i64::MAX, "per_page": 2}));
        assert_eq!(huge.total_pages, Some(i64::MAX as u64 / 2 + 1));
        assert_eq!(huge.has_more, Some(true));
    }

    #[test]
    fn has_more_falls_back_to_total_pages() {
        let p = extract_pagination(&json!({"pagination": {"page": 1, "last_page": 4}}));
        assert_eq!(p.has_more, Some(true));
        let last = extract_pagination(&json!({"pagination": {"page": 4, "pages": 4}}));
        assert_eq!(last.has_more, Some(false));
    }

    #[test]
    fn has_more_unknown_without_hints() {
        let p = extract_pagination(&json!({"data": []}));
        assert_eq!(p.has_more, None);
        assert_eq!(p.page, 1);
        assert_eq!(p.total_pages, None);
    }

    #[test]
    fn pagination_block_wins_over_meta() {
        let p = extract_pagination(&json!({
            "pagination": {"page": 5},
            "meta": {"page": 9}
        }));
        assert_eq!(p.page, 5);
    }

    #[test]
    fn int_coercion_is_lenient() {
        assert_eq!(coerce_int(&json!("12abc")), 12);
        assert_eq!(coerce_int(&json!(" -3")), -3);
        assert_eq!(coerce_int(&json!(7.9)), 7);
        assert_eq!(coerce_int(&json!(true)), 1);
        assert_eq!(coerce_int(&json!("abc")), 0);
        assert!(!truthy(&json!("0")));
        assert!(truthy(&json!("false")));
    }

    #[test]
    fn single_response_unwraps_known_envelopes() {
        assert_eq!(
            normalize_single_response(json!({"video": {"id": 1}})),
            json!({"id": 1})
        );
        assert_eq!(
            normalize_single_response(json!({"data": {"videoUrl": "u"}})),
            json!({"videoUrl": "u"})
        );
        assert_eq!(
            normalize_single_response(json!({"data": {"status": "x"}})),
            json!({"data": {"status": "x"}})
        );
    }

    #[derive(Default)]
    struct RecordingHttp {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<Vec<Result<FetchedResponse, FetchError>>>,
    }

    impl RecordingHttp {
        fn replying(responses: Vec<Result<FetchedResponse, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl HttpFetch for RecordingHttp {
        async fn execute(&self, request: HttpRequest) -> Result<FetchedResponse, FetchError> {
            let url = request.url.clone();
            self.requests.lock().await.push(request);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Err(FetchError::Transport(format!("no scripted response for {url}")));
            }
            responses.remove(0)
        }
    }

    fn ok(body: &str) -> Result<FetchedResponse, FetchError> {
        Ok(FetchedResponse {
            status: 200,
            final_url: "https://api.example.com".to_string(),
            content_type: Some("application/json".to_string()),
            body: body.as_bytes().to_vec(),
        })
    }

    fn settings(base: &str) -> Settings {
        Settings {
            api_base_url: base.to_string(),
            api_key: "secret".to_string(),
            project_id: "proj 1".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn endpoints_respect_existing_path_segments() {
        let http = RecordingHttp::replying(vec![]);
        let client = |base: &str| ApiClient::new(http.clone(), &settings(base));

        assert_eq!(client("https://m.example.com").videos_endpoint(), "https://m.example.com/videos");
        assert_eq!(client("https://m.example.com/api/Videos/").videos_endpoint(), "https://m.example.com/api/Videos");
        assert_eq!(client("").videos_endpoint(), "/videos");
        assert_eq!(
            client("https://m.example.com/videos").single_url("a b/c"),
            "https://m.example.com/videos/a+b%2Fc"
        );

        assert_eq!(client("https://m.example.com").remote_sync_url(), "https://m.example.com/api/plugin/videos/sync");
        assert_eq!(client("https://m.example.com/api").remote_sync_url(), "https://m.example.com/api/plugin/videos/sync");
        assert_eq!(client("https://m.example.com/api/plugin").remote_sync_url(), "https://m.example.com/api/plugin/videos/sync");
        assert_eq!(client("https://m.example.com/api/plugin/videos").remote_sync_url(), "https://m.example.com/api/plugin/videos/sync");
        assert_eq!(client("https://m.example.com/hook/sync").remote_sync_url(), "https://m.example.com/hook/sync");
        assert_eq!(client("").remote_sync_url(), "/api/plugin/videos/sync");
    }

    #[tokio::test]
    async fn fetch_videos_sends_query_and_bearer_token() {
        let http = RecordingHttp::replying(vec![ok(r#"{"data": [], "pagination": {"page": 3}}"#)]);
        let client = ApiClient::new(http.clone(), &settings("https://m.example.com"));

        let page = client
            .fetch_videos(&ListQuery {
                page: 3,
                per_page: 50,
                since: Some("2026-01-01 10:00:00".to_string()),
            })
            .await
            .unwrap();
        assert!(page.data.is_empty());
        assert_eq!(page.pagination.page, 3);

        let requests = http.requests.lock().await;
        assert_eq!(
            requests[0].url,
            "https://m.example.com/videos?page=3&per_page=50&limit=50&since=2026-01-01+10%3A00%3A00&project_id=proj+1"
        );
        assert!(requests[0]
            .headers
            .contains(&("Authorization".to_string(), "Bearer secret".to_string())));
        assert_eq!(requests[0].timeout, Some(LIST_TIMEOUT));
    }

    #[tokio::test]
    async fn unconfigured_client_never_touches_the_network() {
        let http = RecordingHttp::replying(vec![]);
        let client = ApiClient::new(http.clone(), &Settings::default());
        let err = client.test_connection().await.unwrap_err();
        assert!(matches!(err, ApiError::NotConfigured));
        assert!(http.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn status_and_parse_failures_are_typed() {
        let http = RecordingHttp::replying(vec![
            Err(FetchError::HttpStatus {
                status: 401,
                url: "https://m.example.com/videos".to_string(),
                body: "bad token".to_string(),
            }),
            ok("<html>oops</html>"),
        ]);
        let client = ApiClient::new(http.clone(), &settings("https://m.example.com"));

        let err = client.fetch_videos(&ListQuery::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "API returned status 401: bad token");

        let err = client.fetch_videos(&ListQuery::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::Json(_)));
        assert_eq!(err.to_string(), "Failed to parse API response");
    }

    #[tokio::test]
    async fn test_connection_requests_a_single_record() {
        let http = RecordingHttp::replying(vec![ok("[]")]);
        let client = ApiClient::new(http.clone(), &settings("https://m.example.com"));
        client.test_connection().await.unwrap();
        let requests = http.requests.lock().await;
        assert!(requests[0].url.contains("per_page=1&limit=1"));
    }

    #[tokio::test]
    async fn remote_sync_posts_json_and_tolerates_plain_bodies() {
        let http = RecordingHttp::replying(vec![ok(r#"{"queued": 12}"#), ok("accepted")]);
        let client = ApiClient::new(http.clone(), &settings("https://m.example.com/api"));

        let first = client.trigger_remote_sync(&json!({"limit": 1000})).await.unwrap();
        assert_eq!(first, json!({"queued": 12}));
        let second = client.trigger_remote_sync(&json!({})).await.unwrap();
        assert_eq!(second, json!({"status_code": 200, "body": "accepted"}));

        let requests = http.requests.lock().await;
        assert_eq!(requests[0].url, "https://m.example.com/api/plugin/videos/sync");
        assert_eq!(requests[0].body.as_deref(), Some(br#"{"limit":1000}"#.as_slice()));
    }

    #[tokio::test]
    async fn fetch_video_unwraps_the_record() {
        let http = RecordingHttp::replying(vec![ok(r#"{"video": {"id": "vid-9", "playbackUrl": "p"}}"#)]);
        let client = ApiClient::new(http.clone(), &settings("https://m.example.com"));
        let video = client.fetch_video("vid-9").await.unwrap();
        assert_eq!(video, json!({"id": "vid-9", "playbackUrl": "p"}));
        assert_eq!(http.requests.lock().await[0].url, "https://m.example.com/videos/vid-9");
    }

    #[tokio::test]
    async fn remote_sync_failures_name_the_sync_call() {
        let http = RecordingHttp::replying(vec![Err(FetchError::HttpStatus {
            status: 503,
            url: "https://m.example.com/api/plugin/videos/sync".to_string(),
            body: "busy".to_string(),
        })]);
        let client = ApiClient::new(http.clone(), &settings("https://m.example.com"));

        let err = client.trigger_remote_sync(&json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "API sync returned status 503: busy");

        let err = client.trigger_remote_sync(&json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::SyncTransport(_)));
        assert!(err.to_string().starts_with("API sync request failed: "));
    }
}
