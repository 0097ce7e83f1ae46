//! Source audio acquisition: remote download, local lookup and fingerprinting.

use crate::error::{classify_http_status, AppError};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub fn is_remote(episode_ref: &str) -> bool {
    episode_ref.starts_with("http://") || episode_ref.starts_with("https://")
}

/// Filesystem-safe stem for an episode reference, unique per reference.
pub fn safe_file_stem(episode_ref: &str) -> String {
    let tail = episode_ref
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(episode_ref);
    let tail = tail.split(['?', '#']).next().unwrap_or(tail);
    let tail = Path::new(tail)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let safe: String = tail
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(60)
        .collect();

    let digest = Sha256::digest(episode_ref.as_bytes());
    let short = format!("{:x}", digest);
    let short = &short[..10];
    if safe.is_empty() {
        short.to_string()
    } else {
        format!("{}-{}", safe, short)
    }
}

/// Lowercased extension of a URL or path, ignoring query strings.
pub fn source_extension(episode_ref: &str) -> Option<String> {
    let path = episode_ref.split(['?', '#']).next().unwrap_or(episode_ref);
    let name = path.rsplit('/').next().unwrap_or(path);
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.len() <= 5)
}

/// Streams remote sources into the episodes directory.
pub struct Downloader {
    client: reqwest::Client,
    backoff: Vec<Duration>,
}

impl Downloader {
    pub fn new() -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            backoff: vec![
                Duration::from_secs(2),
                Duration::from_secs(8),
                Duration::from_secs(30),
            ],
        })
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Download `url` to `dest`, retrying transient failures.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, AppError> {
        let attempts = self.backoff.len().max(1);
        let partial = dest.with_extension("partial");

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            match self.try_fetch(url, &partial).await {
                Ok(size) => {
                    tokio::fs::rename(&partial, dest).await?;
                    return Ok(size);
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    if !e.is_transient() {
                        return Err(e);
                    }
                    if attempt + 1 < attempts {
                        let delay = self.backoff[attempt];
                        log::warn!(
                            "Download attempt {} failed, retrying in {:?}: {}",
                            attempt + 1,
                            delay,
                            e
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(AppError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        return Err(AppError::RetriesExhausted {
                            attempts: attempts as u32,
                            last_error: e.to_string(),
                        });
                    }
                }
            }
        }

        Err(AppError::Other(format!("Download of {} never attempted", url)))
    }

    /// Single attempt with streaming and length validation
    async fn try_fetch(&self, url: &str, file_path: &Path) -> Result<u64, AppError> {
        log::info!("Downloading {} to {:?}", url, file_path);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(classify_http_status(status, "download refused"));
        }

        let content_length = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(file_path).await?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = content_length {
            if downloaded != expected {
                return Err(AppError::Transient(format!(
                    "Download incomplete: got {} bytes, expected {}",
                    downloaded, expected
                )));
            }
        }
        if downloaded == 0 {
            return Err(AppError::InputData(format!("{} returned an empty body", url)));
        }

        log::info!("Download complete: {} bytes", downloaded);
        Ok(downloaded)
    }
}

/// SHA-256 of a file's contents as lowercase hex.
pub async fn fingerprint_file(path: &Path) -> Result<String, AppError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok::<_, AppError>(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| AppError::Other(format!("Fingerprint task failed: {}", e)))?
}
