use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dailywall_adapters::FixtureSource;
use dailywall_core::ImageRecord;
use dailywall_storage::{
    DelimitedLogStore, DownloadError, DownloadedImage, FetchError, ImageDownloader, JsonArrayStore,
    MemoryStore, RecordStore, StoreError,
};
use dailywall_sync::{RunStatus, SyncConfig, SyncError, SyncJob};
use tempfile::tempdir;

const SINGLE_IMAGE: &str =
    r#"{"images":[{"url":"/th?id=OHR.Test_EN-US1234567890_1920x1080.jpg","copyright":"c"}]}"#;

/// Writes a fixed payload to the destination, or fails for URLs containing a marked name.
#[derive(Default)]
struct FakeDownloader {
    failing: HashSet<String>,
    urls: Mutex<Vec<String>>,
}

impl FakeDownloader {
    fn failing_on(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ImageDownloader for FakeDownloader {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadedImage, DownloadError> {
        self.urls.lock().expect("urls lock").push(url.to_string());
        if self.failing.iter().any(|name| url.contains(name.as_str())) {
            return Err(DownloadError::Network(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            }));
        }
        tokio::fs::write(destination, b"jpeg")
            .await
            .map_err(|source| DownloadError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        Ok(DownloadedImage {
            path: destination.to_path_buf(),
            byte_size: 4,
            sha256: "stub".into(),
        })
    }
}

struct BrokenStore;

#[async_trait]
impl RecordStore for BrokenStore {
    async fn load(&self) -> Result<Vec<ImageRecord>, StoreError> {
        Err(StoreError::Io {
            path: "hpimages.dat".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        })
    }

    async fn append(&self, _records: &[ImageRecord]) -> Result<(), StoreError> {
        unreachable!("append must not run after a failed load")
    }
}

fn config_for(folder: &Path, markets: &[&str]) -> SyncConfig {
    SyncConfig {
        folder: folder.to_path_buf(),
        host: "http://archive.test".into(),
        markets: markets.iter().map(|m| m.to_string()).collect(),
        day_offset: 0,
        count: 1,
        ..SyncConfig::default()
    }
}

fn count_jpgs(folder: &Path) -> usize {
    std::fs::read_dir(folder)
        .expect("read_dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".jpg"))
        .count()
}

#[tokio::test]
async fn single_image_is_downloaded_and_logged_once() {
    let dir = tempdir().expect("tempdir");
    let store_path = dir.path().join("hpimages.dat");

    let job = SyncJob::new(
        config_for(dir.path(), &["en-US"]),
        Box::new(FixtureSource::uniform(SINGLE_IMAGE)),
        Box::new(FakeDownloader::default()),
        Box::new(DelimitedLogStore::new(&store_path)),
    );

    let first = job.run_once().await.expect("first run");
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!((first.fetched, first.deduplicated, first.downloaded, first.failed), (1, 1, 1, 0));
    assert!(dir
        .path()
        .join("OHR.Test_EN-US1234567890_1920x1080.jpg")
        .exists());

    let logged = DelimitedLogStore::new(&store_path).load().await.expect("load log");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].copyright, "c");
    assert_eq!(logged[0].market, "en-US");

    let second = job.run_once().await.expect("second run");
    assert_eq!(second.prior, 1);
    assert_eq!((second.deduplicated, second.downloaded), (0, 0));
    assert_eq!(DelimitedLogStore::new(&store_path).load().await.expect("reload").len(), 1);
    assert_eq!(count_jpgs(dir.path()), 1);
}

#[tokio::test]
async fn same_artwork_across_markets_downloads_once() {
    let dir = tempdir().expect("tempdir");
    let source = FixtureSource::new()
        .with_market("en-US", r#"{"images":[{"url":"/th?id=OHR.Owl_EN-US1_1920x1080.jpg"}]}"#)
        .with_market(
            "zh-CN",
            r#"{"images":[
                {"url":"/th?id=OHR.Owl_ZH-CN2_1920x1080.jpg"},
                {"url":"/th?id=OHR.Fox_ZH-CN3_1920x1080.jpg"}
            ]}"#,
        );
    let store = JsonArrayStore::new(dir.path().join("hpimages.json"));

    let job = SyncJob::new(
        config_for(dir.path(), &["en-US", "zh-CN"]),
        Box::new(source),
        Box::new(FakeDownloader::default()),
        Box::new(store.clone()),
    );
    let summary = job.run_once().await.expect("run");

    assert_eq!((summary.fetched, summary.deduplicated, summary.downloaded), (3, 2, 2));
    let names: Vec<String> = store
        .load()
        .await
        .expect("load")
        .iter()
        .map(ImageRecord::name)
        .collect();
    assert_eq!(names, vec!["OHR.Owl", "OHR.Fox"]);
    assert!(dir.path().join("OHR.Owl_EN-US1_1920x1080.jpg").exists());
    assert!(!dir.path().join("OHR.Owl_ZH-CN2_1920x1080.jpg").exists());
}

#[tokio::test]
async fn failed_downloads_are_skipped_and_not_persisted() {
    let dir = tempdir().expect("tempdir");
    let source = FixtureSource::uniform(
        r#"{"images":[
            {"url":"/th?id=OHR.Good_EN-US1_1920x1080.jpg"},
            {"url":"/th?id=OHR.Flaky_EN-US2_1920x1080.jpg"},
            {"url":"/az/hprichbg/rb/NoId.jpg"}
        ]}"#,
    );
    let store = Arc::new(MemoryStore::new());

    let job = SyncJob::new(
        config_for(dir.path(), &["en-US"]),
        Box::new(source),
        Box::new(FakeDownloader::failing_on(&["OHR.Flaky"])),
        Box::new(store.clone()),
    );
    let summary = job.run_once().await.expect("partial failures still complete");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!((summary.deduplicated, summary.downloaded, summary.failed), (3, 1, 2));
    let persisted: Vec<String> = store.snapshot().await.iter().map(ImageRecord::name).collect();
    assert_eq!(persisted, vec!["OHR.Good"]);
}

#[tokio::test]
async fn resolution_variant_drives_url_and_file_name() {
    let dir = tempdir().expect("tempdir");
    let downloader = Arc::new(FakeDownloader::default());

    let mut config = config_for(dir.path(), &["en-US"]);
    config.resolution = (480, 640);
    let job = SyncJob::new(
        config,
        Box::new(FixtureSource::uniform(SINGLE_IMAGE)),
        Box::new(downloader.clone()),
        Box::new(MemoryStore::new()),
    );
    job.run_once().await.expect("run");

    assert_eq!(
        downloader.urls.lock().expect("urls lock").clone(),
        vec!["http://archive.test/th?id=OHR.Test_EN-US1234567890_480x640.jpg"]
    );
    assert!(dir.path().join("OHR.Test_EN-US1234567890_480x640.jpg").exists());
}

#[tokio::test]
async fn store_load_failure_aborts_before_fetching() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(FixtureSource::uniform(SINGLE_IMAGE));

    let job = SyncJob::new(
        config_for(dir.path(), &["en-US"]),
        Box::new(source.clone()),
        Box::new(FakeDownloader::default()),
        Box::new(BrokenStore),
    );
    let err = job.run_once().await.expect_err("load failure is fatal");

    assert!(matches!(err, SyncError::Load(_)));
    assert_eq!(err.stage(), "load");
    assert!(source.requested_markets().is_empty());
    assert_eq!(count_jpgs(dir.path()), 0);
}

#[tokio::test]
async fn fetch_failure_aborts_without_downloading_or_persisting() {
    let dir = tempdir().expect("tempdir");
    let store_path = dir.path().join("hpimages.dat");
    let source = FixtureSource::new().with_market("en-US", SINGLE_IMAGE);

    let job = SyncJob::new(
        config_for(dir.path(), &["en-US", "fr-FR"]),
        Box::new(source),
        Box::new(FakeDownloader::default()),
        Box::new(DelimitedLogStore::new(&store_path)),
    );
    let err = job.run_once().await.expect_err("missing market aborts");

    assert_eq!(err.stage(), "fetch");
    assert_eq!(count_jpgs(dir.path()), 0);
    assert!(!store_path.exists());
}

#[tokio::test]
async fn image_without_artwork_name_is_never_downloaded_or_logged() {
    let dir = tempdir().expect("tempdir");
    let downloader = Arc::new(FakeDownloader::default());
    let store = Arc::new(MemoryStore::new());

    let job = SyncJob::new(
        config_for(dir.path(), &["en-US"]),
        Box::new(FixtureSource::uniform(r#"{"images":[{"url":"/th?id=Lonely.jpg"}]}"#)),
        Box::new(downloader.clone()),
        Box::new(store.clone()),
    );

    for _ in 0..2 {
        let summary = job.run_once().await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!((summary.downloaded, summary.failed, summary.persisted), (0, 1, 0));
    }
    assert!(downloader.urls.lock().expect("urls lock").is_empty());
    assert!(store.snapshot().await.is_empty());
    assert_eq!(count_jpgs(dir.path()), 0);
}

#[tokio::test]
async fn excluded_urls_are_dropped_before_dedup() {
    let dir = tempdir().expect("tempdir");
    let source = FixtureSource::uniform(
        r#"{"images":[
            {"url":"/th?id=OHR.World_ROW9_1920x1080.jpg"},
            {"url":"/th?id=OHR.Local_EN-US1_1920x1080.jpg"}
        ]}"#,
    );
    let store = Arc::new(MemoryStore::new());

    let mut config = config_for(dir.path(), &["en-US"]);
    config.exclude = vec!["_ROW".into()];
    let job = SyncJob::new(
        config,
        Box::new(source),
        Box::new(FakeDownloader::default()),
        Box::new(store.clone()),
    );
    let summary = job.run_once().await.expect("run");

    assert_eq!((summary.fetched, summary.excluded, summary.deduplicated), (2, 1, 1));
    let persisted: Vec<String> = store.snapshot().await.iter().map(ImageRecord::name).collect();
    assert_eq!(persisted, vec!["OHR.Local"]);
    assert!(!dir.path().join("OHR.World_ROW9_1920x1080.jpg").exists());
}
