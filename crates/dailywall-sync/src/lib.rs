//! Sync job orchestration: load prior records, fetch markets, dedupe, download, persist.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dailywall_adapters::{ArchiveClient, ImageSource, SourceError};
use dailywall_core::{
    parse_resolution, resolve_host, ImageRecord, CANONICAL_RESOLUTION, HOST_GLOBAL, MARKET_CODES,
};
use dailywall_storage::{
    HttpClientConfig, HttpFetcher, ImageDownloader, RecordStore, StoreError, StoreFormat,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dailywall-sync";

pub const LOG_FILE_NAME: &str = "hpsync.log";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub folder: PathBuf,
    pub host: String,
    pub markets: Vec<String>,
    pub day_offset: i32,
    pub count: u32,
    pub resolution: (u32, u32),
    pub store_format: StoreFormat,
    /// Images whose URL contains any of these substrings (e.g. `_ROW`) are dropped after fetch.
    pub exclude: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            host: HOST_GLOBAL.to_string(),
            markets: MARKET_CODES.iter().map(|m| m.to_string()).collect(),
            day_offset: 7,
            count: 7,
            resolution: (1920, 1080),
            store_format: StoreFormat::default(),
            exclude: Vec::new(),
            user_agent: format!("dailywall/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
        }
    }
}

fn default_folder() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("pictures"))
        .unwrap_or_else(|| PathBuf::from("./pictures"))
}

/// Optional YAML overrides; every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub folder: Option<PathBuf>,
    pub host: Option<String>,
    pub markets: Option<Vec<String>>,
    pub days: Option<i32>,
    pub num: Option<u32>,
    pub resolution: Option<String>,
    pub store: Option<String>,
    pub exclude: Option<Vec<String>>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            folder: std::env::var("DAILYWALL_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(defaults.folder),
            host: std::env::var("DAILYWALL_HOST")
                .map(|v| resolve_host(&v))
                .unwrap_or(defaults.host),
            markets: defaults.markets,
            day_offset: std::env::var("DAILYWALL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.day_offset),
            count: std::env::var("DAILYWALL_NUM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.count),
            resolution: std::env::var("DAILYWALL_RESOLUTION")
                .ok()
                .and_then(|v| parse_resolution(&v))
                .unwrap_or(defaults.resolution),
            store_format: std::env::var("DAILYWALL_STORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.store_format),
            exclude: std::env::var("DAILYWALL_EXCLUDE")
                .map(|v| split_patterns(&v))
                .unwrap_or(defaults.exclude),
            user_agent: std::env::var("DAILYWALL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("DAILYWALL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
        }
    }

    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        self.apply(file)
    }

    pub fn apply(&mut self, file: ConfigFile) -> Result<()> {
        if let Some(folder) = file.folder {
            self.folder = folder;
        }
        if let Some(host) = file.host {
            self.host = resolve_host(&host);
        }
        if let Some(markets) = file.markets {
            anyhow::ensure!(!markets.is_empty(), "markets list must not be empty");
            self.markets = markets;
        }
        if let Some(days) = file.days {
            self.day_offset = days;
        }
        if let Some(num) = file.num {
            self.count = num;
        }
        if let Some(resolution) = file.resolution {
            self.resolution = parse_resolution(&resolution)
                .with_context(|| format!("invalid resolution {resolution:?}, expected WxH"))?;
        }
        if let Some(store) = file.store {
            self.store_format = store.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(exclude) = file.exclude {
            self.exclude = exclude.into_iter().filter(|p| !p.is_empty()).collect();
        }
        if let Some(user_agent) = file.user_agent {
            self.user_agent = user_agent;
        }
        if let Some(secs) = file.http_timeout_secs {
            self.http_timeout_secs = secs;
        }
        Ok(())
    }

    /// Creates the destination folder (and parents) if missing.
    pub fn ensure_folder(&self) -> Result<()> {
        std::fs::create_dir_all(&self.folder)
            .with_context(|| format!("creating {}", self.folder.display()))
    }

    pub fn resolution_token(&self) -> String {
        format!("{}x{}", self.resolution.0, self.resolution.1)
    }

    pub fn store_path(&self) -> PathBuf {
        self.folder.join(self.store_format.file_name())
    }

    pub fn log_path(&self) -> PathBuf {
        self.folder.join(LOG_FILE_NAME)
    }

    pub fn is_excluded(&self, image: &ImageRecord) -> bool {
        self.exclude.iter().any(|pattern| image.url.contains(pattern.as_str()))
    }
}

/// Comma-separated list, blanks dropped.
pub fn split_patterns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drops images whose artwork name was already persisted or appeared earlier in `fresh`.
/// Order of `fresh` is kept. Images with an empty name never count as duplicates.
pub fn dedupe(fresh: &[ImageRecord], prior: &[ImageRecord]) -> Vec<ImageRecord> {
    let mut seen: HashSet<String> = prior
        .iter()
        .map(ImageRecord::name)
        .filter(|name| !name.is_empty())
        .collect();

    let mut kept = Vec::new();
    for image in fresh {
        let name = image.name();
        if name.is_empty() {
            kept.push(image.clone());
            continue;
        }
        if seen.insert(name) {
            kept.push(image.clone());
        }
    }
    kept
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("loading persisted records: {0}")]
    Load(#[source] StoreError),
    #[error("fetching market images: {0}")]
    Fetch(#[source] SourceError),
    #[error("persisting downloaded records: {0}")]
    Persist(#[source] StoreError),
}

impl SyncError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Fetch(_) => "fetch",
            Self::Persist(_) => "persist",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub prior: usize,
    pub fetched: usize,
    pub excluded: usize,
    pub deduplicated: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub persisted: usize,
}

pub struct SyncJob {
    config: SyncConfig,
    source: Box<dyn ImageSource>,
    downloader: Box<dyn ImageDownloader>,
    store: Box<dyn RecordStore>,
}

impl SyncJob {
    pub fn new(
        config: SyncConfig,
        source: Box<dyn ImageSource>,
        downloader: Box<dyn ImageDownloader>,
        store: Box<dyn RecordStore>,
    ) -> Self {
        Self {
            config,
            source,
            downloader,
            store,
        }
    }

    /// Live archive client, HTTP downloader and the configured on-disk store.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let store = config.store_format.open(&config.folder);
        Ok(Self::new(
            config,
            Box::new(ArchiveClient::new(http.clone())),
            Box::new(http),
            store,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();

        let prior = self.store.load().await.map_err(SyncError::Load)?;
        info!(prior = prior.len(), "loaded persisted records");

        let fetched = self
            .source
            .fetch_all_markets(
                &self.config.host,
                &self.config.markets,
                self.config.day_offset,
                self.config.count,
            )
            .await
            .map_err(SyncError::Fetch)?;

        let wanted: Vec<ImageRecord> = fetched
            .iter()
            .filter(|image| !self.config.is_excluded(image))
            .cloned()
            .collect();
        let excluded = fetched.len() - wanted.len();

        let fresh = dedupe(&wanted, &prior);
        info!(
            fetched = fetched.len(),
            excluded,
            deduplicated = fresh.len(),
            "deduplicated market images"
        );

        let mut downloaded = Vec::with_capacity(fresh.len());
        let mut failed = 0usize;
        for (index, image) in fresh.iter().enumerate() {
            if self.download_one(index, image).await {
                downloaded.push(image.clone());
            } else {
                failed += 1;
            }
        }

        self.store
            .append(&downloaded)
            .await
            .map_err(SyncError::Persist)?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Completed,
            prior: prior.len(),
            fetched: fetched.len(),
            excluded,
            deduplicated: fresh.len(),
            downloaded: downloaded.len(),
            failed,
            persisted: downloaded.len(),
        };
        info!(
            fetched = summary.fetched,
            deduplicated = summary.deduplicated,
            downloaded = summary.downloaded,
            failed = summary.failed,
            "sync run completed"
        );
        Ok(summary)
    }

    /// Per-image failures are logged and reported as `false`; they never abort the run.
    /// Images without an artwork name are refused; no later run could match them.
    async fn download_one(&self, index: usize, image: &ImageRecord) -> bool {
        if image.name().is_empty() {
            warn!(index, url = %image.url, "image url carries no artwork name; skipping");
            return false;
        }
        let (width, height) = self.config.resolution;
        let variant = image.resolution_variant(width, height);
        if !is_safe_file_name(&variant.filename) {
            warn!(index, url = %image.url, "image file name is unsafe; skipping");
            return false;
        }
        if variant.filename == image.filename()
            && self.config.resolution_token() != CANONICAL_RESOLUTION
        {
            warn!(
                index,
                filename = %variant.filename,
                "no canonical resolution token; keeping original size"
            );
        }

        let host = if image.host.is_empty() {
            &self.config.host
        } else {
            &image.host
        };
        let url = ImageRecord::absolute_url(host, &variant.url);
        let destination = self.config.folder.join(&variant.filename);

        match self.downloader.download(&url, &destination).await {
            Ok(file) => {
                info!(
                    index,
                    name = %image.name(),
                    market = %image.market,
                    path = %file.path.display(),
                    bytes = file.byte_size,
                    sha256 = %file.sha256,
                    "downloaded image"
                );
                true
            }
            Err(err) => {
                error!(index, url = %url, error = %err, "download failed");
                false
            }
        }
    }
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let job = SyncJob::from_config(config)?;
    Ok(job.run_once().await?)
}
