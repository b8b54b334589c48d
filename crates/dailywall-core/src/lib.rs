//! Core domain model for dailywall: the homepage image record and its derived fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::form_urlencoded;

pub const CRATE_NAME: &str = "dailywall-core";

pub const HOST_GLOBAL: &str = "https://global.bing.com";
pub const HOST_CN: &str = "https://cn.bing.com";

/// Resolution token every archive URL carries for the default wallpaper size.
pub const CANONICAL_RESOLUTION: &str = "1920x1080";

const NAME_SEPARATOR: char = '_';

/// Microsoft market codes, in the order markets are fetched.
pub const MARKET_CODES: &[&str] = &[
    "es-AR", "en-AU", "de-AT", "nl-BE", "fr-BE", "pt-BR", "en-CA", "fr-CA", "es-CL", "da-DK",
    "fi-FI", "fr-FR", "de-DE", "zh-HK", "en-IN", "en-ID", "it-IT", "ja-JP", "ko-KR", "en-MY",
    "es-MX", "nl-NL", "en-NZ", "no-NO", "zh-CN", "pl-PL", "en-PH", "ru-RU", "en-ZA", "es-ES",
    "sv-SE", "fr-CH", "de-CH", "zh-TW", "tr-TR", "en-GB", "en-US", "es-US",
];

/// Resolve a host alias (`global`, `cn`) to its base URL; anything else is taken verbatim.
pub fn resolve_host(value: &str) -> String {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "global" => HOST_GLOBAL.to_string(),
        "cn" | "china" => HOST_CN.to_string(),
        _ => value.trim().trim_end_matches('/').to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("image url is empty")]
    EmptyUrl,
    #[error("image url has no id query parameter")]
    MissingId,
    #[error("image url has a malformed percent-escape")]
    InvalidEscape,
}

/// One day's homepage image for one market, as returned by the archive API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "urlbase")]
    pub url_base: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub quiz: String,
    #[serde(default)]
    pub copyright: String,
    #[serde(default, rename = "copyrightlink")]
    pub copyright_link: String,
    #[serde(default, rename = "hsh")]
    pub hash: String,
    #[serde(default, rename = "fullstartdate")]
    pub full_start_date: String,
    #[serde(default, rename = "startdate")]
    pub start_date: String,
    #[serde(default, rename = "enddate")]
    pub end_date: String,
}

/// Download URL and on-disk filename for one resolution of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionVariant {
    pub url: String,
    pub filename: String,
}

impl ImageRecord {
    /// Image id carried by the URL query, e.g. `OHR.RootBridge_ZH-CN5173953292_1920x1080.jpg`
    /// for `/th?id=OHR.RootBridge_ZH-CN5173953292_1920x1080.jpg&rf=LaDigue_1920x1080.jpg&pid=hp`.
    ///
    /// Returns an empty string when the id cannot be found or the URL has a malformed
    /// percent-escape.
    pub fn filename(&self) -> String {
        self.try_filename().unwrap_or_default()
    }

    /// Strict variant of [`ImageRecord::filename`].
    pub fn try_filename(&self) -> Result<String, ParseError> {
        if self.url.is_empty() {
            return Err(ParseError::EmptyUrl);
        }
        if has_invalid_escape(&self.url) {
            return Err(ParseError::InvalidEscape);
        }
        form_urlencoded::parse(self.url.as_bytes())
            .find(|(key, _)| is_id_key(key))
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or(ParseError::MissingId)
    }

    /// Artwork name, e.g. `OHR.RootBridge`. Identical across markets and resolutions.
    pub fn name(&self) -> String {
        self.filename_segment(0)
    }

    /// Market part of the filename, e.g. `ZH-CN5173953292`.
    pub fn market_id(&self) -> String {
        self.filename_segment(1)
    }

    fn filename_segment(&self, index: usize) -> String {
        let filename = self.filename();
        let segments: Vec<&str> = filename.split(NAME_SEPARATOR).collect();
        if segments.len() < 2 {
            return String::new();
        }
        segments[index].to_string()
    }

    pub fn content(&self) -> &str {
        if self.title.is_empty() {
            &self.copyright
        } else {
            &self.title
        }
    }

    /// Swap the canonical `1920x1080` token for `WxH` in both the URL and the filename.
    /// Strings without the token come back unchanged.
    pub fn resolution_variant(&self, width: u32, height: u32) -> ResolutionVariant {
        ResolutionVariant {
            url: substitute_resolution(&self.url, width, height),
            filename: substitute_resolution(&self.filename(), width, height),
        }
    }

    /// Absolute URL for `path`, which is usually relative to the archive host.
    pub fn absolute_url(host: &str, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let host = host.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{host}{path}")
        } else {
            format!("{host}/{path}")
        }
    }

    pub fn image_url(&self, host: &str) -> String {
        Self::absolute_url(host, &self.url)
    }

    /// Columns in [`LOG_COLUMNS`] order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.url.clone(),
            self.url_base.clone(),
            self.market.clone(),
            self.title.clone(),
            self.copyright.clone(),
            self.full_start_date.clone(),
            self.start_date.clone(),
            self.end_date.clone(),
            self.host.clone(),
            self.quiz.clone(),
            self.copyright_link.clone(),
            self.hash.clone(),
        ]
    }

    /// Inverse of [`ImageRecord::to_row`]. Rows written before the host/quiz/link/hash
    /// columns existed are accepted; anything shorter is rejected.
    pub fn from_row(row: &[&str]) -> Option<Self> {
        if row.len() < LEGACY_COLUMN_COUNT {
            return None;
        }
        let col = |i: usize| row.get(i).map(|v| v.to_string()).unwrap_or_default();
        Some(Self {
            url: col(0),
            url_base: col(1),
            market: col(2),
            title: col(3),
            copyright: col(4),
            full_start_date: col(5),
            start_date: col(6),
            end_date: col(7),
            host: col(8),
            quiz: col(9),
            copyright_link: col(10),
            hash: col(11),
        })
    }
}

impl fmt::Display for ImageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Startdate: {} | Copyright: {} | Filename: {}",
            self.full_start_date,
            self.copyright,
            self.filename()
        )
    }
}

fn is_id_key(key: &str) -> bool {
    key == "id" || key.ends_with("?id")
}

/// `%` must be followed by two hex digits.
fn has_invalid_escape(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        let valid = bytes
            .get(i + 1..i + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !valid {
            return true;
        }
        i += 3;
    }
    false
}

pub fn substitute_resolution(text: &str, width: u32, height: u32) -> String {
    text.replace(CANONICAL_RESOLUTION, &format!("{width}x{height}"))
}

/// Parse a `WxH` token such as `1920x1080`.
pub fn parse_resolution(token: &str) -> Option<(u32, u32)> {
    let (w, h) = token.trim().split_once(['x', 'X'])?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Bumped whenever [`LOG_COLUMNS`] changes shape.
pub const LOG_SCHEMA_VERSION: u32 = 1;

/// On-disk column order of the delimited record log.
pub const LOG_COLUMNS: &[&str] = &[
    "url",
    "urlbase",
    "market",
    "title",
    "copyright",
    "fullstartdate",
    "startdate",
    "enddate",
    "host",
    "quiz",
    "copyrightlink",
    "hsh",
];

/// Column count of the first log layout (url through enddate).
pub const LEGACY_COLUMN_COUNT: usize = 8;
