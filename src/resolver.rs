#![forbid(unsafe_code)]

//! Thin wrapper around the external resolver executable (`yt-dlp`).
//!
//! The resolver does all of the extraction work. This module only launches it,
//! bounds how long we wait for it and makes sure the child process never
//! outlives the request that spawned it: every command is built with
//! `kill_on_drop`, and the streaming variant hands ownership of the child to
//! the response body.

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, future, stream};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::formats::RawVideoInfo;

/// Byte stream of a single resolved format. Dropping it terminates whatever
/// produces the bytes.
pub type MediaStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("resolver exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },

    #[error("resolver returned malformed metadata: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("resolver timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("resolver stdout was not captured")]
    MissingStdout,

    #[error("resolver stream failed: {0}")]
    Stream(#[from] io::Error),
}

impl ResolveError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Anything able to turn a URL into metadata or media bytes. The HTTP layer
/// only ever talks to this trait, so tests can swap in an in-process fake.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Fetches the full info document for a page URL.
    async fn fetch_info(&self, url: &str) -> Result<RawVideoInfo, ResolveError>;

    /// Starts streaming the media behind an already-resolved format URL.
    ///
    /// Returns once the first chunk is available (or the stream finished), so
    /// a resolver that fails straight away is reported as an error instead of
    /// an empty body.
    async fn open_stream(&self, url: &str) -> Result<MediaStream, ResolveError>;
}

const INFO_ARGS: [&str; 4] = [
    "--dump-single-json",
    "--no-warnings",
    "--no-playlist",
    "--no-progress",
];
const STREAM_ARGS: [&str; 6] = ["-f", "best", "-o", "-", "--no-warnings", "--no-progress"];

/// Resolver backed by the `yt-dlp` command line tool.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    /// Bounds the metadata dump and the wait for the first streamed chunk.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: io::Error) -> ResolveError {
        ResolveError::Spawn {
            program: self.program.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl Resolver for YtDlp {
    async fn fetch_info(&self, url: &str) -> Result<RawVideoInfo, ResolveError> {
        let mut command = self.command();
        // `--` keeps a URL starting with a dash from being read as an option.
        command.args(INFO_ARGS).arg("--").arg(url);

        let output = with_deadline(self.timeout, async {
            command
                .output()
                .await
                .map_err(|err| self.spawn_error(err))
        })
        .await?;

        if !output.status.success() {
            return Err(ResolveError::Exit {
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn open_stream(&self, url: &str) -> Result<MediaStream, ResolveError> {
        let mut child = self
            .command()
            .args(STREAM_ARGS)
            .arg("--")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| self.spawn_error(err))?;

        let stdout = child.stdout.take().ok_or(ResolveError::MissingStdout)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, url.to_string()));
        }

        let mut body = Box::pin(child_stream(child, stdout));
        let first = with_deadline(self.timeout, async { Ok(body.next().await) }).await?;
        match first {
            Some(Ok(chunk)) => Ok(Box::pin(
                stream::once(future::ready(Ok(chunk))).chain(body),
            )),
            Some(Err(err)) => Err(ResolveError::Stream(err)),
            None => Ok(Box::pin(stream::empty())),
        }
    }
}

async fn with_deadline<T, F>(limit: Option<Duration>, work: F) -> Result<T, ResolveError>
where
    F: Future<Output = Result<T, ResolveError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| ResolveError::Timeout(limit))?,
        None => work.await,
    }
}

/// Chains the child's stdout with a final check of its exit status. A non-zero
/// exit becomes a trailing error so the HTTP body aborts instead of ending as
/// if the file was complete. The child lives inside the trailing future, which
/// means dropping the stream at any point kills it.
fn child_stream(
    mut child: Child,
    stdout: ChildStdout,
) -> impl Stream<Item = io::Result<Bytes>> + Send {
    let exit = stream::once(async move {
        match child.wait().await {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(io::Error::other(format!(
                "resolver exited with {status}"
            )))),
            Err(err) => Some(Err(err)),
        }
    })
    .filter_map(future::ready);

    ReaderStream::new(stdout).chain(exit)
}

/// Drains stderr until EOF. Lines are decoded lossily: closing the pipe early
/// would make the resolver's next write fail and abort the download.
async fn log_stderr(stderr: ChildStderr, url: String) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.starts_with("ERROR") {
                    warn!(%url, "resolver: {line}");
                } else {
                    debug!(%url, "resolver: {line}");
                }
            }
            Err(err) => {
                warn!(%url, "reading resolver stderr failed: {err}");
                break;
            }
        }
    }
}

/// Last meaningful stderr line, which is where yt-dlp puts its error.
fn stderr_tail(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("no diagnostic output")
        .to_string()
}
