//! HTTP fetch + archive extraction utilities for the ANS ingest.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use zip::ZipArchive;

pub const CRATE_NAME: &str = "ans-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    fn request(url: &str, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.to_string(),
            source,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Archive written to disk by [`HttpFetcher::download`].
#[derive(Debug, Clone)]
pub struct DownloadedArchive {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Fetch a small text resource (directory listing pages).
    #[instrument(skip(self))]
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::InvalidArgument("url must not be empty".into()));
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::request(url, err))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        resp.text().await.map_err(|err| FetchError::request(url, err))
    }

    /// Stream `url` into `destination`, creating parent directories as needed.
    ///
    /// The body goes chunk by chunk into a temporary sibling file which is
    /// renamed over `destination` once complete, so a failed transfer never
    /// leaves a truncated archive behind.
    #[instrument(skip(self, destination), fields(destination = %destination.display()))]
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadedArchive, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::InvalidArgument("download url must not be empty".into()));
        }
        if destination.as_os_str().is_empty() || destination.file_name().is_none() {
            return Err(FetchError::InvalidArgument(format!(
                "download destination must name a file, got {:?}",
                destination
            )));
        }

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .map_err(|err| FetchError::io(parent, err))?;

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::request(url, err))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let temp_path = parent.join(format!(".{}.part", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|err| FetchError::io(&temp_path, err))?;

        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        let streamed: Result<(), FetchError> = async {
            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|err| FetchError::request(url, err))?
            {
                hasher.update(&chunk);
                bytes += chunk.len() as u64;
                file.write_all(&chunk)
                    .await
                    .map_err(|err| FetchError::io(&temp_path, err))?;
            }
            file.flush()
                .await
                .map_err(|err| FetchError::io(&temp_path, err))
        }
        .await;
        drop(file);

        if let Err(err) = streamed {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, destination).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(FetchError::io(destination, err));
        }

        let downloaded = DownloadedArchive {
            path: destination.to_path_buf(),
            bytes,
            sha256: hex::encode(hasher.finalize()),
            fetched_at: Utc::now(),
        };
        info!(bytes = downloaded.bytes, sha256 = %downloaded.sha256, "download complete");
        Ok(downloaded)
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("archive entry escapes the output directory: {0}")]
    InvalidArchiveEntry(String),
    #[error("reading archive {}: {source}", path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionSummary {
    pub files: Vec<PathBuf>,
    pub directories: usize,
}

/// Extract every entry of a zip archive below `output_dir`, keeping entry paths.
///
/// Entries whose path would resolve outside `output_dir` (absolute paths,
/// `..` components) abort the extraction with
/// [`ArchiveError::InvalidArchiveEntry`].
pub fn extract_archive(
    archive_path: &Path,
    output_dir: &Path,
) -> Result<ExtractionSummary, ArchiveError> {
    if !archive_path.is_file() {
        return Err(ArchiveError::InvalidArgument(format!(
            "archive {} does not exist",
            archive_path.display()
        )));
    }
    if output_dir.as_os_str().is_empty() {
        return Err(ArchiveError::InvalidArgument(
            "output directory must not be empty".into(),
        ));
    }

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ArchiveError::Io { path, source }
    };
    let zip_err = |source| ArchiveError::Zip {
        path: archive_path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(output_dir).map_err(io_err(output_dir))?;
    let file = File::open(archive_path).map_err(io_err(archive_path))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;

    let mut summary = ExtractionSummary::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_err)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ArchiveError::InvalidArchiveEntry(entry.name().to_string()));
        };
        let target = output_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err(&target))?;
            summary.directories += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut out = File::create(&target).map_err(io_err(&target))?;
        std::io::copy(&mut entry, &mut out).map_err(io_err(&target))?;
        debug!(entry = %target.display(), "extracted archive entry");
        summary.files.push(target);
    }

    info!(
        archive = %archive_path.display(),
        files = summary.files.len(),
        "archive extracted"
    );
    Ok(summary)
}
