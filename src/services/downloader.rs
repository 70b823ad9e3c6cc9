use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::services::media::sanitize_file_name;

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
    "www.youtu.be",
];

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Failed to download file from URL: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Failed to download file from URL: the server answered {0}")]
    Status(StatusCode),

    #[error("Failed to download file from URL: no Google Drive file id in {0}")]
    DriveFileId(String),

    #[error("Downloaded file exceeds the {limit} byte upload limit")]
    TooLarge { limit: u64 },

    #[error("Failed to download file from URL: the response was empty")]
    Empty,

    #[error("Failed to store downloaded file: {0}")]
    Io(#[from] std::io::Error),
}

/// Media fetched from a submitted URL into the upload directory.
#[derive(Debug)]
pub struct Downloaded {
    pub path: PathBuf,
    pub bytes: u64,
    /// Audio or video Content-Type reported by the server
    pub mime_type: Option<String>,
}

/// Links the analysis service reads directly, so they are never downloaded.
pub fn is_youtube(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| YOUTUBE_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
}

fn is_google_drive(url: &Url) -> bool {
    url.host_str() == Some("drive.google.com")
}

/// File id from `/file/d/<id>/...`, `open?id=<id>` or `uc?id=<id>` links.
pub fn drive_file_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    if segments.next() == Some("file") && segments.next() == Some("d") {
        if let Some(id) = segments.next().filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
    }
    url.query_pairs()
        .find(|(key, value)| key == "id" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Direct download link for a Drive file. `confirm=t` skips the interstitial
/// page Drive serves for files it cannot virus-scan.
pub fn drive_download_url(drive_url: &Url, file_id: &str) -> Url {
    let mut url = drive_url.clone();
    url.set_path("/uc");
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair("export", "download")
        .append_pair("id", file_id)
        .append_pair("confirm", "t");
    url
}

/// `filename="..."` from a Content-Disposition header.
fn disposition_file_name(header: &str) -> Option<&str> {
    let start = header.find("filename=\"")? + "filename=\"".len();
    let len = header[start..].find('"')?;
    Some(&header[start..start + len]).filter(|name| !name.is_empty())
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        t if t.starts_with("audio/mpeg") => "mp3",
        t if t.starts_with("audio/mp4") => "m4a",
        t if t.starts_with("audio/wav") || t.starts_with("audio/x-wav") => "wav",
        t if t.starts_with("video/quicktime") => "mov",
        t if t.starts_with("video/x-msvideo") => "avi",
        t if t.starts_with("video/x-matroska") => "mkv",
        t if t.starts_with("video/webm") => "webm",
        t if t.starts_with("audio/") => "mp3",
        _ => "mp4",
    }
}

async fn copy_body(
    response: &mut Response,
    file: &mut tokio::fs::File,
    limit: u64,
) -> Result<u64, DownloadError> {
    let mut bytes: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        bytes += chunk.len() as u64;
        if bytes > limit {
            return Err(DownloadError::TooLarge { limit });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(bytes)
}

/// Fetches submitted media URLs into the upload directory.
pub struct MediaDownloader {
    http: Client,
    timeout: Duration,
    max_bytes: u64,
}

impl MediaDownloader {
    pub fn new(max_bytes: u64, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            timeout,
            max_bytes,
        }
    }

    /// Stream `url` to `dir`, named after the job. A partial file is removed
    /// on any failure.
    pub async fn fetch(&self, url: &Url, dir: &Path, job_id: Uuid) -> Result<Downloaded, DownloadError> {
        let target = if is_google_drive(url) {
            let id = drive_file_id(url).ok_or_else(|| DownloadError::DriveFileId(url.to_string()))?;
            drive_download_url(url, &id)
        } else {
            url.clone()
        };

        tracing::info!(job_id = %job_id, url = %url, "Downloading submitted media");
        let mut response = self.http.get(target.clone()).timeout(self.timeout).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(DownloadError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        let named = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_file_name)
            .map(str::to_string)
            .or_else(|| {
                target
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|name| name.contains('.'))
                    .map(str::to_string)
            });
        let file_name = match named {
            Some(name) if name.contains('.') => sanitize_file_name(&name),
            _ => format!("download.{}", extension_for(&content_type)),
        };

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}_{}", job_id, file_name));
        let mut file = tokio::fs::File::create(&path).await?;

        let bytes = match copy_body(&mut response, &mut file, self.max_bytes).await {
            Ok(0) => Err(DownloadError::Empty),
            other => other,
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        tracing::info!(job_id = %job_id, path = %path.display(), bytes = bytes, "Submitted media downloaded");
        let mime_type = content_type
            .split(';')
            .next()
            .map(str::trim)
            .filter(|t| t.starts_with("audio/") || t.starts_with("video/"))
            .map(str::to_string);

        Ok(Downloaded {
            path,
            bytes,
            mime_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_youtube_links_are_recognised() {
        assert!(is_youtube(&url("https://www.youtube.com/watch?v=abc123")));
        assert!(is_youtube(&url("https://youtu.be/abc123")));
        assert!(is_youtube(&url("https://M.YouTube.com/watch?v=abc123")));
        assert!(!is_youtube(&url("https://cdn.example.com/youtube.com/talk.mp4")));
    }

    #[test]
    fn test_drive_file_ids() {
        assert_eq!(
            drive_file_id(&url("https://drive.google.com/file/d/1AbC_d-9/view?usp=sharing")).as_deref(),
            Some("1AbC_d-9")
        );
        assert_eq!(
            drive_file_id(&url("https://drive.google.com/open?id=XyZ")).as_deref(),
            Some("XyZ")
        );
        assert_eq!(
            drive_file_id(&url("https://drive.google.com/uc?export=download&id=Q1")).as_deref(),
            Some("Q1")
        );
        assert!(drive_file_id(&url("https://drive.google.com/drive/folders")).is_none());
        assert_eq!(
            drive_download_url(&url("https://drive.google.com/open?id=Q1#x"), "Q1").as_str(),
            "https://drive.google.com/uc?export=download&id=Q1&confirm=t"
        );
    }

    #[test]
    fn test_file_name_sources() {
        assert_eq!(
            disposition_file_name("attachment; filename=\"talk.mp3\""),
            Some("talk.mp3")
        );
        assert_eq!(disposition_file_name("inline"), None);
        assert_eq!(extension_for("audio/mpeg"), "mp3");
        assert_eq!(extension_for("video/quicktime; charset=binary"), "mov");
        assert_eq!(extension_for("application/octet-stream"), "mp4");
    }
}
