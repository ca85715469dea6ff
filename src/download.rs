#![forbid(unsafe_code)]

//! Delivery strategies for the `/download` endpoint.
//!
//! A long-running server proxies the resolver's byte stream itself, while a
//! short-lived deployment only has time to point the client at the resolved
//! format URL. Both share the same request validation and differ only here.

use std::fmt;

/// `Content-Disposition` sent with every proxied stream. The filename is fixed
/// regardless of the real container the resolver hands back.
pub const STREAM_CONTENT_DISPOSITION: &str = "attachment; filename=video.mp4";
/// `Content-Type` sent with every proxied stream, same caveat as above.
pub const STREAM_CONTENT_TYPE: &str = "video/mp4";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownloadMode {
    /// Pipe the resolver's stdout into the response body.
    #[default]
    Streaming,
    /// Answer with `302 Found` pointing at the format URL.
    Redirect,
}

impl DownloadMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stream" | "streaming" | "proxy" => Some(Self::Streaming),
            "redirect" | "302" => Some(Self::Redirect),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Redirect => "redirect",
        }
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
