#![forbid(unsafe_code)]

//! Building blocks of the `vidproxy` HTTP service: runtime configuration, the
//! resolver process wrapper, response shaping and download strategies.

pub mod config;
pub mod download;
pub mod formats;
pub mod resolver;
