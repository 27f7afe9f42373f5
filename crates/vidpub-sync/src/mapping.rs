//! Upstream record to [`MappedVideo`] field mapping.

use serde_json::Value as JsonValue;
use vidpub_api::coerce_int;
use vidpub_core::MappedVideo;

use crate::error::RecordError;

const UNTITLED: &str = "Untitled Video";

const CATEGORY_KEYS: &[&str] = &["categories", "category", "categorys"];
const ACTOR_KEYS: &[&str] = &[
    "actors",
    "actor",
    "casts",
    "cast",
    "performers",
    "starring",
    "stars",
    "actor_names",
];
const LABEL_KEYS: &[&str] = &["name", "title", "label", "slug"];

/// First present, non-null value among `keys`.
pub(crate) fn coalesce<'a>(record: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .find_map(|key| record.get(*key).filter(|v| !v.is_null()))
}

fn scalar_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(true) => "1".to_string(),
        _ => String::new(),
    }
}

pub(crate) fn coalesced_string(record: &JsonValue, keys: &[&str]) -> String {
    coalesce(record, keys).map(scalar_string).unwrap_or_default()
}

pub fn map_video_fields(raw: &JsonValue) -> Result<MappedVideo, RecordError> {
    let record = match raw.get("video") {
        Some(inner @ (JsonValue::Object(_) | JsonValue::Array(_))) => inner,
        _ => raw,
    };

    let external_id = coalesce(record, &["id", "video_id", "videoId"])
        .map(scalar_string)
        .unwrap_or_default();
    if external_id.is_empty() || external_id == "0" {
        return Err(RecordError::MissingId);
    }
    let external_id = sanitize_text(&external_id);
    if external_id.is_empty() {
        return Err(RecordError::MissingId);
    }

    let playback_url = coalesced_string(record, &["playback_url", "playbackUrl"]);
    let video_url = if playback_url.is_empty() {
        coalesced_string(record, &["video_url", "videoUrl", "url"])
    } else {
        playback_url.clone()
    };
    let thumbnail_url = coalesced_string(record, &["thumbnail_url", "thumbnailUrl", "thumbUrl"]);

    let title = coalesce(record, &["title", "name"])
        .map(scalar_string)
        .unwrap_or_else(|| UNTITLED.to_string());
    let description = coalesced_string(record, &["description", "desc"]);

    let duration = record
        .get("duration")
        .map(|d| coerce_int(d).unsigned_abs())
        .unwrap_or(0);

    Ok(MappedVideo {
        external_id,
        title: sanitize_text(&title),
        description: strip_element_blocks(&strip_element_blocks(&description, "script"), "style")
            .trim()
            .to_string(),
        video_url: sanitize_url(&video_url),
        playback_url: sanitize_url(&playback_url),
        thumbnail_url: sanitize_url(&thumbnail_url),
        duration,
        categories: coalesce(record, CATEGORY_KEYS)
            .map(normalize_term_input)
            .unwrap_or_default(),
        tags: record.get("tags").map(normalize_term_input).unwrap_or_default(),
        actors: coalesce(record, ACTOR_KEYS)
            .map(normalize_term_input)
            .unwrap_or_default(),
        created_at: sanitize_text(&coalesced_string(record, &["created_at", "createdAt"])),
        updated_at: sanitize_text(&coalesced_string(record, &["updated_at", "updatedAt"])),
        raw_payload: serde_json::to_string(record).unwrap_or_default(),
    })
}

/// Flattens strings, lists and `{name|title|label|slug}` objects into distinct labels.
pub fn normalize_term_input(value: &JsonValue) -> Vec<String> {
    let raw: Vec<String> = match value {
        JsonValue::String(s) => split_terms(s),
        JsonValue::Array(items) => items
            .iter()
            .flat_map(|item| match item {
                JsonValue::String(s) => split_terms(s),
                JsonValue::Object(_) => split_terms(&extract_term_label(item)),
                _ => Vec::new(),
            })
            .collect(),
        JsonValue::Object(_) => split_terms(&extract_term_label(value)),
        _ => Vec::new(),
    };

    let mut terms: Vec<String> = Vec::with_capacity(raw.len());
    for term in raw.iter().map(|t| sanitize_text(t)) {
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

pub fn split_terms(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }
    if !value.contains([',', '|']) {
        return vec![value.to_string()];
    }
    value
        .split([',', '|'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn extract_term_label(value: &JsonValue) -> String {
    LABEL_KEYS
        .iter()
        .find_map(|key| {
            value
                .get(*key)
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty() && *s != "0")
        })
        .unwrap_or_default()
        .to_string()
}

/// Single-line plain text: script/style blocks and tags removed, whitespace runs collapsed.
pub fn sanitize_text(input: &str) -> String {
    let input = strip_element_blocks(&strip_element_blocks(input, "script"), "style");
    let mut stripped = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        let opens_tag = c == '<'
            && chars
                .peek()
                .is_some_and(|next| next.is_ascii_alphabetic() || matches!(next, '/' | '!' | '?'));
        if opens_tag {
            for skipped in chars.by_ref() {
                if skipped == '>' {
                    break;
                }
            }
            continue;
        }
        stripped.push(c);
    }
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_element_blocks(input: &str, tag: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find(&open) {
        let start = cursor + found;
        let Some(end) = lower[start..].find(&close) else {
            break;
        };
        out.push_str(&input[cursor..start]);
        cursor = start + end + close.len();
    }
    out.push_str(&input[cursor..]);
    out
}

/// Keeps http(s) and relative URLs; scheme-less hosts get `http://`; other schemes are dropped.
pub fn sanitize_url(input: &str) -> String {
    let url: String = input
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    if url.is_empty() {
        return url;
    }
    if url.starts_with(['/', '#', '?']) {
        return url;
    }

    let scheme_end = url.find(':');
    let path_start = url.find(['/', '?', '#']);
    match scheme_end {
        Some(colon) if path_start.map_or(true, |slash| colon < slash) => {
            let scheme = url[..colon].to_ascii_lowercase();
            if matches!(scheme.as_str(), "http" | "https") {
                url
            } else if url[colon + 1..].starts_with(|c: char| c.is_ascii_digit()) {
                format!("http://{url}")
            } else {
                String::new()
            }
        }
        _ => format!("http://{url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_keeps_markup_but_drops_scripts_and_styles() {
        let mapped = map_video_fields(&json!({
            "id": "v",
            "description": " <p>ok</p><script>x()</script><STYLE>a{}</STYLE> ",
        }))
        .unwrap();
        assert_eq!(mapped.description, "<p>ok</p>");
    }

    #[test]
    fn maps_snake_case_record() {
        let mapped = map_video_fields(&json!({
            "id": "vid-1",
            "title": "  Sunrise <b>Over</b>\n Bangkok ",
            "description": " <p>Morning</p> ",
            "playback_url": "https://stream.example.com/vid-1.m3u8",
            "video_url": "https://cdn.example.com/vid-1.mp4",
            "thumbnail_url": "https://cdn.example.com/vid-1.jpg",
            "duration": "-184",
            "categories": "Travel, City|Timelapse",
            "tags": ["morning", "skyline", "morning"],
            "cast": [{"name": "Jane Doe"}, {"label": "John Roe"}],
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(mapped.external_id, "vid-1");
        assert_eq!(mapped.title, "Sunrise Over Bangkok");
        assert_eq!(mapped.description, "<p>Morning</p>");
        assert_eq!(mapped.video_url, "https://stream.example.com/vid-1.m3u8");
        assert_eq!(mapped.playback_url, "https://stream.example.com/vid-1.m3u8");
        assert_eq!(mapped.duration, 184);
        assert_eq!(mapped.categories, vec!["Travel", "City", "Timelapse"]);
        assert_eq!(mapped.tags, vec!["morning", "skyline"]);
        assert_eq!(mapped.actors, vec!["Jane Doe", "John Roe"]);
        assert_eq!(mapped.created_at, "2026-01-01T00:00:00Z");
        assert_eq!(mapped.updated_at, "");
    }

    #[test]
    fn maps_camel_case_record_inside_video_wrapper() {
        let mapped = map_video_fields(&json!({
            "video": {
                "videoId": 42,
                "name": "Wrapped",
                "videoUrl": "https://cdn.example.com/42.mp4",
                "thumbUrl": "https://cdn.example.com/42.png",
                "updatedAt": "yesterday",
                "performers": "A | B"
            }
        }))
        .unwrap();

        assert_eq!(mapped.external_id, "42");
        assert_eq!(mapped.title, "Wrapped");
        assert_eq!(mapped.video_url, "https://cdn.example.com/42.mp4");
        assert_eq!(mapped.playback_url, "");
        assert_eq!(mapped.thumbnail_url, "https://cdn.example.com/42.png");
        assert_eq!(mapped.actors, vec!["A", "B"]);
        assert!(mapped.raw_payload.contains("\"videoId\":42"));
        assert!(!mapped.raw_payload.contains("\"video\""));
    }

    #[test]
    fn missing_or_empty_ids_are_rejected() {
        for raw in [json!({}), json!({"id": ""}), json!({"id": 0}), json!({"id": "0"}), json!({"id": null, "video_id": false})] {
            let err = map_video_fields(&raw).unwrap_err();
            assert_eq!(err.to_string(), "Video ID is required");
        }
    }

    #[test]
    fn defaults_fill_absent_fields() {
        let mapped = map_video_fields(&json!({"id": "x", "url": "cdn.example.com/x.mp4", "duration": "abc"})).unwrap();
        assert_eq!(mapped.title, "Untitled Video");
        assert_eq!(mapped.video_url, "http://cdn.example.com/x.mp4");
        assert_eq!(mapped.duration, 0);
        assert!(mapped.categories.is_empty());
    }

    #[test]
    fn mapping_is_idempotent() {
        let raw = json!({"id": "v", "tags": "a,b", "title": "T"});
        assert_eq!(map_video_fields(&raw).unwrap(), map_video_fields(&raw).unwrap());
    }

    #[test]
    fn term_input_shapes() {
        assert_eq!(normalize_term_input(&json!(" solo ")), vec!["solo"]);
        assert_eq!(normalize_term_input(&json!("a,,b||c")), vec!["a", "b", "c"]);
        assert_eq!(normalize_term_input(&json!({"title": "Drama"})), vec!["Drama"]);
        assert_eq!(
            normalize_term_input(&json!([{"name": "0", "slug": "fallback"}, 7, ["nested"], "x"])),
            vec!["fallback", "x"]
        );
        assert!(normalize_term_input(&json!(12)).is_empty());
        assert!(normalize_term_input(&json!([])).is_empty());
    }

    #[test]
    fn urls_are_restricted_to_web_schemes() {
        assert_eq!(sanitize_url(" https://a.example/x y "), "https://a.example/xy");
        assert_eq!(sanitize_url("/relative/path.mp4"), "/relative/path.mp4");
        assert_eq!(sanitize_url("javascript:alert(1)"), "");
        assert_eq!(sanitize_url("localhost:8080/v.mp4"), "http://localhost:8080/v.mp4");
        assert_eq!(sanitize_url(""), "");
    }

    #[test]
    fn text_sanitizing_strips_markup() {
        assert_eq!(sanitize_text("a < b"), "a < b");
        assert_eq!(sanitize_text("<SCRIPT>x()</script>Name\t\tHere"), "Name Here");
        assert_eq!(sanitize_text("Jane <em>Doe</em>"), "Jane Doe");
    }
}
