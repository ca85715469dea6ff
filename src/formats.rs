#![forbid(unsafe_code)]

//! Shapes the resolver's `--dump-single-json` output into the compact summary
//! returned by `/info`.
//!
//! Only a handful of the resolver's fields are consumed. Every one of them is
//! optional on the wire, so absent values default instead of failing the
//! whole request.

use serde::{Deserialize, Serialize};

/// Codec marker the resolver uses for "this stream has no video track".
const NO_CODEC: &str = "none";

/// Subset of the resolver's info document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVideoInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

/// One entry of the resolver's `formats` array.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
}

impl RawFormat {
    fn quality_label(&self) -> Option<&str> {
        self.format_note.as_deref().filter(|note| !note.is_empty())
    }

    fn is_audio_only(&self) -> bool {
        self.vcodec.as_deref() == Some(NO_CODEC)
    }

    /// Only entries explicitly marked as having no video track and carrying
    /// no quality label are dropped. A missing or empty codec still counts.
    fn is_listed(&self) -> bool {
        self.quality_label().is_some() || !self.is_audio_only()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub quality: String,
    pub ext: String,
    pub url: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
}

impl FormatDescriptor {
    fn from_raw(raw: &RawFormat) -> Self {
        let media_type = if raw.is_audio_only() {
            MediaType::Audio
        } else {
            MediaType::Video
        };
        Self {
            quality: raw.quality_label().unwrap_or_default().to_string(),
            ext: raw.ext.clone().unwrap_or_default(),
            url: raw.url.clone().unwrap_or_default(),
            media_type,
        }
    }
}

/// Body of a successful `/info` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoSummary {
    pub title: String,
    pub thumbnail: String,
    pub formats: Vec<FormatDescriptor>,
}

impl VideoSummary {
    pub fn from_info(info: &RawVideoInfo) -> Self {
        Self {
            title: info.title.clone().unwrap_or_default(),
            thumbnail: info.thumbnail.clone().unwrap_or_default(),
            formats: info
                .formats
                .iter()
                .filter(|format| format.is_listed())
                .map(FormatDescriptor::from_raw)
                .collect(),
        }
    }
}
