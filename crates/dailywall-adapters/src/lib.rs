//! Image source contract + the homepage image archive client.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dailywall_core::ImageRecord;
use dailywall_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dailywall-adapters";

/// Provider accepts day offsets in `[-1, 7]`.
pub const DAY_OFFSET_RANGE: std::ops::RangeInclusive<i32> = -1..=7;
/// Provider returns at most 7 images per request.
pub const COUNT_RANGE: std::ops::RangeInclusive<u32> = 0..=7;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching market {market}: {source}")]
    Network {
        market: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding market {market} response: {source}")]
    Decode {
        market: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no fixture for market {market}")]
    MissingFixture { market: String },
}

impl SourceError {
    pub fn market(&self) -> &str {
        match self {
            Self::Network { market, .. }
            | Self::Decode { market, .. }
            | Self::MissingFixture { market } => market,
        }
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Images for one market, newest first, as the provider orders them.
    async fn fetch(
        &self,
        host: &str,
        market: &str,
        day_offset: i32,
        count: u32,
    ) -> Result<Vec<ImageRecord>, SourceError>;

    /// Concatenates [`ImageSource::fetch`] over `markets` in order. The first failing
    /// market aborts the whole call.
    async fn fetch_all_markets(
        &self,
        host: &str,
        markets: &[String],
        day_offset: i32,
        count: u32,
    ) -> Result<Vec<ImageRecord>, SourceError> {
        let mut images = Vec::new();
        for market in markets {
            let batch = self.fetch(host, market, day_offset, count).await?;
            debug!(market = %market, images = batch.len(), "fetched market");
            images.extend(batch);
        }
        Ok(images)
    }
}

#[async_trait]
impl<T: ImageSource + ?Sized> ImageSource for Arc<T> {
    fn source_id(&self) -> &'static str {
        (**self).source_id()
    }

    async fn fetch(
        &self,
        host: &str,
        market: &str,
        day_offset: i32,
        count: u32,
    ) -> Result<Vec<ImageRecord>, SourceError> {
        (**self).fetch(host, market, day_offset, count).await
    }
}

pub fn archive_url(host: &str, market: &str, day_offset: i32, count: u32) -> String {
    format!(
        "{}/HPImageArchive.aspx?format=js&setmkt={market}&idx={day_offset}&n={count}",
        host.trim_end_matches('/')
    )
}

pub fn day_offset_in_range(day_offset: i32) -> bool {
    DAY_OFFSET_RANGE.contains(&day_offset)
}

pub fn count_in_range(count: u32) -> bool {
    COUNT_RANGE.contains(&count)
}

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    #[serde(default)]
    images: Vec<ImageRecord>,
}

/// Decode an archive response body and stamp every image with its market and host.
pub fn parse_archive_response(
    body: &[u8],
    market: &str,
    host: &str,
) -> Result<Vec<ImageRecord>, serde_json::Error> {
    let response: ArchiveResponse = serde_json::from_slice(body)?;
    Ok(response
        .images
        .into_iter()
        .map(|mut image| {
            image.market = market.to_string();
            image.host = host.to_string();
            image
        })
        .collect())
}

/// Live client for `<host>/HPImageArchive.aspx`.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    http: HttpFetcher,
}

impl ArchiveClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageSource for ArchiveClient {
    fn source_id(&self) -> &'static str {
        "hp-image-archive"
    }

    async fn fetch(
        &self,
        host: &str,
        market: &str,
        day_offset: i32,
        count: u32,
    ) -> Result<Vec<ImageRecord>, SourceError> {
        if !day_offset_in_range(day_offset) || !count_in_range(count) {
            warn!(
                day_offset,
                count, "request outside provider limits; passing through unchanged"
            );
        }
        let url = archive_url(host, market, day_offset, count);
        let response = self
            .http
            .fetch_bytes(&url)
            .await
            .map_err(|source| SourceError::Network {
                market: market.to_string(),
                source,
            })?;
        parse_archive_response(&response.body, market, host).map_err(|source| {
            SourceError::Decode {
                market: market.to_string(),
                source,
            }
        })
    }
}

/// Serves canned archive bodies per market instead of calling the provider.
#[derive(Debug, Default)]
pub struct FixtureSource {
    bodies: HashMap<String, Vec<u8>>,
    fallback: Option<Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same body for every market.
    pub fn uniform(body: impl Into<Vec<u8>>) -> Self {
        Self {
            fallback: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn with_market(mut self, market: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(market.into(), body.into());
        self
    }

    /// Loads every `<market>.json` file in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut source = Self::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry.with_context(|| format!("listing {}", dir.display()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(market) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            source.bodies.insert(market.to_string(), body);
        }
        Ok(source)
    }

    /// Markets requested so far, in call order.
    pub fn requested_markets(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImageSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        host: &str,
        market: &str,
        _day_offset: i32,
        _count: u32,
    ) -> Result<Vec<ImageRecord>, SourceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(market.to_string());
        }
        let body = self
            .bodies
            .get(market)
            .or(self.fallback.as_ref())
            .ok_or_else(|| SourceError::MissingFixture {
                market: market.to_string(),
            })?;
        parse_archive_response(body, market, host).map_err(|source| SourceError::Decode {
            market: market.to_string(),
            source,
        })
    }
}
