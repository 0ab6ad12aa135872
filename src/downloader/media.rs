//! Binary payload source selection and checksums
//!
//! Selection prefers the highest quality direct file. Videos, documents and
//! stories fall back to a reference-only record when no direct link is
//! available to this credential, which is common for embedded or protected
//! videos.

use crate::MediaSource;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Direct video file keys, best first
pub const VIDEO_QUALITY_ORDER: [&str; 6] = [
    "mp4_2160", "mp4_1440", "mp4_1080", "mp4_720", "mp4_480", "mp4_360",
];

/// Photo size letters, largest first, used when sizes carry no dimensions
const PHOTO_SIZE_ORDER: [&str; 10] = ["w", "z", "y", "x", "r", "q", "p", "o", "m", "s"];

/// Default extension of unknown documents
const DEFAULT_DOC_EXTENSION: &str = "bin";

/// Hex encoded SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// URL of the largest size of a photo object
pub fn best_photo_url(photo: &Value) -> Option<String> {
    let sizes = photo.get("sizes")?.as_array()?;
    let area = |size: &Value| {
        let width = size.get("width").and_then(Value::as_u64).unwrap_or(0);
        let height = size.get("height").and_then(Value::as_u64).unwrap_or(0);
        width.saturating_mul(height)
    };
    let rank = |size: &Value| {
        size.get("type")
            .and_then(Value::as_str)
            .and_then(|t| PHOTO_SIZE_ORDER.iter().position(|known| *known == t))
            .map_or(0, |pos| PHOTO_SIZE_ORDER.len() - pos)
    };
    sizes
        .iter()
        .filter(|size| non_empty_str(size, "url").is_some())
        .max_by_key(|size| (area(size), rank(size)))
        .and_then(|size| non_empty_str(size, "url"))
        .map(str::to_string)
}

/// Downloadable photo attached to a wall post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPhoto {
    /// `{owner_id}_{id}` of the photo
    pub id: String,
    /// Largest size URL
    pub url: String,
}

/// Photos attached to a post, or to the post it reposts
///
/// Attachments without an id or without a downloadable size are left out;
/// the raw post in the record still lists them.
pub fn post_photos(post: &Value) -> Vec<PostPhoto> {
    let reposted = post
        .get("copy_history")
        .and_then(Value::as_array)
        .and_then(|history| history.first());
    [Some(post), reposted]
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("attachments").and_then(Value::as_array))
        .flatten()
        .filter(|attachment| attachment.get("type").and_then(Value::as_str) == Some("photo"))
        .filter_map(|attachment| {
            let photo = attachment.get("photo")?;
            let id = photo.get("id").and_then(Value::as_i64)?;
            let owner = photo.get("owner_id").and_then(Value::as_i64).unwrap_or(0);
            Some(PostPhoto {
                id: format!("{owner}_{id}"),
                url: best_photo_url(photo)?,
            })
        })
        .collect()
}

/// Best direct file of a video object
pub fn best_video_url(video: &Value) -> Option<String> {
    let files = video
        .get("files")
        .or_else(|| video.get("video_files"))
        .and_then(Value::as_object);
    if let Some(files) = files {
        let preferred = VIDEO_QUALITY_ORDER
            .iter()
            .find_map(|key| files.get(*key).and_then(Value::as_str).filter(|u| !u.is_empty()));
        if let Some(url) = preferred {
            return Some(url.to_string());
        }
        let any_mp4 = files
            .iter()
            .filter(|(key, _)| key.starts_with("mp4_"))
            .find_map(|(_, url)| url.as_str().filter(|u| u.starts_with("http")));
        if let Some(url) = any_mp4 {
            return Some(url.to_string());
        }
    }
    non_empty_str(video, "url").map(str::to_string)
}

/// Payload source of a photo
pub fn select_photo_source(photo: &Value) -> MediaSource {
    match best_photo_url(photo) {
        Some(url) => {
            let extension = extension_from_url(&url, "jpg");
            MediaSource::Direct { url, extension }
        }
        None => MediaSource::Reference {
            url: None,
            reason: "photo has no downloadable sizes".to_string(),
        },
    }
}

/// Payload source of a video, falling back to its player link
pub fn select_video_source(video: &Value) -> MediaSource {
    if let Some(url) = best_video_url(video) {
        return MediaSource::Direct {
            url,
            extension: "mp4".to_string(),
        };
    }
    let external = video
        .get("files")
        .and_then(|files| non_empty_str(files, "external"));
    let player = external.or_else(|| non_empty_str(video, "player"));
    MediaSource::Reference {
        url: player.map(str::to_string),
        reason: if player.is_some() {
            "no direct file, player link only".to_string()
        } else {
            "video files not available to this credential".to_string()
        },
    }
}

/// Payload source of a document
pub fn select_document_source(doc: &Value) -> MediaSource {
    match non_empty_str(doc, "url") {
        Some(url) => MediaSource::Direct {
            url: url.to_string(),
            extension: document_extension(doc),
        },
        None => MediaSource::Reference {
            url: None,
            reason: "document has no download link".to_string(),
        },
    }
}

/// Payload source of a story, by its media type
pub fn select_story_source(story: &Value) -> MediaSource {
    let story_type = story.get("type").and_then(Value::as_str).unwrap_or_default();
    match story_type {
        "photo" => match story.get("photo") {
            Some(photo) => select_photo_source(photo),
            None => MediaSource::Reference {
                url: None,
                reason: "photo story without photo".to_string(),
            },
        },
        "video" => match story.get("video") {
            Some(video) => match best_video_url(video) {
                Some(url) => {
                    let extension = extension_from_url(&url, "mp4");
                    MediaSource::Direct { url, extension }
                }
                None => select_video_source(video),
            },
            None => MediaSource::Reference {
                url: None,
                reason: "video story without video".to_string(),
            },
        },
        other => MediaSource::Reference {
            url: non_empty_str(story, "link").map(str::to_string),
            reason: format!("unsupported story type '{other}'"),
        },
    }
}

/// Lowercase extension of a document, `bin` when missing or implausible
pub fn document_extension(doc: &Value) -> String {
    non_empty_str(doc, "ext")
        .filter(|ext| ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_lowercase)
        .unwrap_or_else(|| DEFAULT_DOC_EXTENSION.to_string())
}

/// Extension of the last path segment of `url`, or `default`
pub fn extension_from_url(url: &str, default: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    last_segment
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| {
            (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(str::to_lowercase)
        .unwrap_or_else(|| default.to_string())
}
