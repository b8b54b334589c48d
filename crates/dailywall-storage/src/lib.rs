//! HTTP fetch, image download and record persistence for dailywall.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dailywall_core::ImageRecord;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dailywall-storage";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const LOG_DELIMITER: u8 = b';';

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Network(#[from] FetchError),
    #[error("writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedImage {
    pub path: PathBuf,
    pub byte_size: u64,
    pub sha256: String,
}

/// Fetches image bytes by URL and writes them to a destination path.
#[async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadedImage, DownloadError>;
}

#[async_trait]
impl<T: ImageDownloader + ?Sized> ImageDownloader for Arc<T> {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadedImage, DownloadError> {
        (**self).download(url, destination).await
    }
}

/// Single shared HTTP client. Requests are issued one at a time and never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.send(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl ImageDownloader for HttpFetcher {
    /// Streams the body into `destination`, truncating any existing file.
    /// A transfer that fails midway leaves the partial file in place.
    async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadedImage, DownloadError> {
        let span = info_span!("image_download", url, destination = %destination.display());
        async {
            let mut resp = self.send(url).await?;

            let io_err = |source: std::io::Error| DownloadError::Io {
                path: destination.to_path_buf(),
                source,
            };
            let mut file = fs::File::create(destination).await.map_err(io_err)?;
            let mut hasher = Sha256::new();
            let mut byte_size = 0u64;

            while let Some(chunk) = resp.chunk().await.map_err(FetchError::from)? {
                hasher.update(&chunk);
                file.write_all(&chunk).await.map_err(io_err)?;
                byte_size += chunk.len() as u64;
            }
            file.flush().await.map_err(io_err)?;

            Ok::<_, DownloadError>(DownloadedImage {
                path: destination.to_path_buf(),
                byte_size,
                sha256: hex::encode(hasher.finalize()),
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("delimited log: {0}")]
    Csv(#[from] csv::Error),
    #[error("json store: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only persistence of previously downloaded records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All persisted records in write order. A store that does not exist yet is empty.
    async fn load(&self) -> Result<Vec<ImageRecord>, StoreError>;

    async fn append(&self, records: &[ImageRecord]) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn load(&self) -> Result<Vec<ImageRecord>, StoreError> {
        (**self).load().await
    }

    async fn append(&self, records: &[ImageRecord]) -> Result<(), StoreError> {
        (**self).append(records).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFormat {
    #[default]
    Delimited,
    Json,
}

impl StoreFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Delimited => "hpimages.dat",
            Self::Json => "hpimages.json",
        }
    }

    pub fn open(self, folder: &Path) -> Box<dyn RecordStore> {
        let path = folder.join(self.file_name());
        match self {
            Self::Delimited => Box::new(DelimitedLogStore::new(path)),
            Self::Json => Box::new(JsonArrayStore::new(path)),
        }
    }
}

impl FromStr for StoreFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delimited" | "csv" | "dat" => Ok(Self::Delimited),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown store format {other:?} (expected delimited or json)")),
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// `;`-delimited log, one row per record, UTF-8 BOM at the start of the file.
#[derive(Debug, Clone)]
pub struct DelimitedLogStore {
    path: PathBuf,
}

impl DelimitedLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse(bytes: &[u8]) -> Result<Vec<ImageRecord>, StoreError> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(LOG_DELIMITER)
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let fields: Vec<&str> = row.iter().collect();
            // short rows are leftovers of interrupted writes
            if let Some(record) = ImageRecord::from_row(&fields) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn render(records: &[ImageRecord]) -> Result<Vec<u8>, StoreError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(LOG_DELIMITER)
            .has_headers(false)
            .from_writer(Vec::new());
        for record in records {
            writer.write_record(record.to_row())?;
        }
        writer
            .into_inner()
            .map_err(|err| StoreError::Csv(csv::Error::from(err.into_error())))
    }
}

#[async_trait]
impl RecordStore for DelimitedLogStore {
    async fn load(&self) -> Result<Vec<ImageRecord>, StoreError> {
        match read_optional(&self.path).await? {
            Some(bytes) => Self::parse(&bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn append(&self, records: &[ImageRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = Self::render(records)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| StoreError::io(&self.path, err))?;
        let existing = file
            .metadata()
            .await
            .map_err(|err| StoreError::io(&self.path, err))?
            .len();

        let mut out = Vec::with_capacity(rows.len() + UTF8_BOM.len());
        if existing == 0 {
            out.extend_from_slice(UTF8_BOM);
        }
        out.extend_from_slice(&rows);
        file.write_all(&out)
            .await
            .map_err(|err| StoreError::io(&self.path, err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::io(&self.path, err))?;
        debug!(path = %self.path.display(), rows = records.len(), "appended to record log");
        Ok(())
    }
}

/// JSON array of records. Appends rewrite the array through a temp file + rename.
#[derive(Debug, Clone)]
pub struct JsonArrayStore {
    path: PathBuf,
}

impl JsonArrayStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonArrayStore {
    async fn load(&self) -> Result<Vec<ImageRecord>, StoreError> {
        match read_optional(&self.path).await? {
            Some(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn append(&self, records: &[ImageRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut all = self.load().await?;
        all.extend_from_slice(records);
        let bytes = serde_json::to_vec_pretty(&all)?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.json.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|err| StoreError::io(&temp_path, err))?;
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }
        Ok(())
    }
}

/// In-process store; nothing touches the filesystem.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ImageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ImageRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub async fn snapshot(&self) -> Vec<ImageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(self.snapshot().await)
    }

    async fn append(&self, records: &[ImageRecord]) -> Result<(), StoreError> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }
}
