// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Positioned reads over the payload being applied.
//!
//! Two source kinds: a local file (with a base offset, for payloads embedded
//! in a larger package) and an HTTP(S) URL list fetched with `Range`
//! requests so a resumed attempt re-reads only what it needs. Network reads
//! retry transient failures with exponential backoff before surfacing a
//! transfer error.

use std::fmt;
use std::os::unix::fs::FileExt as _;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use update_types::ErrorCode;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("payload read of {len} bytes at {offset} is out of bounds (payload size {size})")]
    OutOfBounds { offset: u64, len: usize, size: u64 },
    #[error("error reading payload file {path}")]
    File { path: Utf8PathBuf, #[source] err: std::io::Error },
    #[error("payload read timed out after {0:?}")]
    IdleTimeout(Duration),
    #[error("all payload URLs failed, last error: {last_error}")]
    AllUrlsFailed { last_error: String },
    #[error("server returned HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("server returned {got} bytes for a {want}-byte range of {url}")]
    ShortRead { url: String, want: usize, got: usize },
}

impl FetchError {
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::DownloadTransferError
    }
}

/// Positioned, chunked reads over one payload.
#[async_trait]
pub trait PayloadSource: Send + Sync + fmt::Debug {
    /// Total payload size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes at `offset`. The range must lie within the
    /// payload.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, FetchError>;
}

fn check_bounds(offset: u64, len: usize, size: u64) -> Result<(), FetchError> {
    if offset.saturating_add(len as u64) > size {
        return Err(FetchError::OutOfBounds { offset, len, size });
    }
    Ok(())
}

/// A payload stored in a local file, possibly at an interior offset.
#[derive(Debug)]
pub struct FilePayloadSource {
    path: Utf8PathBuf,
    file: std::fs::File,
    base_offset: u64,
    size: u64,
}

impl FilePayloadSource {
    /// Open `path`; the payload occupies `size` bytes starting at
    /// `base_offset` (0 size means "through end of file").
    pub fn open(
        path: &Utf8Path,
        base_offset: u64,
        size: u64,
    ) -> Result<Self, FetchError> {
        let file = std::fs::File::open(path).map_err(|err| FetchError::File {
            path: path.to_owned(),
            err,
        })?;
        let file_len = file
            .metadata()
            .map_err(|err| FetchError::File { path: path.to_owned(), err })?
            .len();
        let size = if size == 0 {
            file_len.saturating_sub(base_offset)
        } else {
            size
        };
        Ok(Self { path: path.to_owned(), file, base_offset, size })
    }
}

#[async_trait]
impl PayloadSource for FilePayloadSource {
    fn len(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, FetchError> {
        check_bounds(offset, len, self.size)?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, self.base_offset + offset)
            .map_err(|err| FetchError::File { path: self.path.clone(), err })?;
        Ok(Bytes::from(buf))
    }
}

/// A payload served over HTTP(S), fetched with `Range` requests.
#[derive(Debug)]
pub struct HttpPayloadSource {
    client: reqwest::Client,
    urls: Vec<String>,
    size: u64,
    idle_timeout: Duration,
    retry_initial: Duration,
    retry_max_elapsed: Duration,
    log: Logger,
}

impl HttpPayloadSource {
    /// `size` comes from the `FILE_SIZE` request header; range math needs it
    /// up front.
    pub fn new(
        urls: Vec<String>,
        size: u64,
        user_agent: Option<&str>,
        config: &Config,
        log: &Logger,
    ) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(agent) = user_agent {
            builder = builder.user_agent(agent.to_owned());
        }
        let client = builder.build().map_err(|err| FetchError::AllUrlsFailed {
            last_error: err.to_string(),
        })?;
        Ok(Self {
            client,
            urls,
            size,
            idle_timeout: config.download_idle_timeout(),
            retry_initial: config.download_retry_initial(),
            retry_max_elapsed: config.download_retry_max_elapsed(),
            log: log.new(slog::o!("component" => "HttpPayloadSource")),
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, FetchError> {
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let request = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, range)
            .send();

        let response = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| FetchError::IdleTimeout(self.idle_timeout))?
            .map_err(|err| FetchError::AllUrlsFailed {
                last_error: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        let body = tokio::time::timeout(self.idle_timeout, response.bytes())
            .await
            .map_err(|_| FetchError::IdleTimeout(self.idle_timeout))?
            .map_err(|err| FetchError::AllUrlsFailed {
                last_error: err.to_string(),
            })?;

        if body.len() != len {
            return Err(FetchError::ShortRead {
                url: url.to_owned(),
                want: len,
                got: body.len(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl PayloadSource for HttpPayloadSource {
    fn len(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, FetchError> {
        check_bounds(offset, len, self.size)?;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_initial)
            .with_max_elapsed_time(Some(self.retry_max_elapsed))
            .build();

        let fetch = || {
            let this = self;
            async move {
                let mut last_error = "no URLs configured".to_owned();
                for url in &this.urls {
                    match this.fetch_range(url, offset, len).await {
                        Ok(bytes) => return Ok(bytes),
                        Err(err) => {
                            slog::debug!(
                                this.log,
                                "payload range fetch failed, trying next URL";
                                "url" => url,
                                "offset" => offset,
                                "error" => %err,
                            );
                            // Client errors won't improve with retries.
                            if let FetchError::HttpStatus { status, .. } = &err {
                                if (400..500).contains(status)
                                    && *status != 408
                                    && *status != 429
                                {
                                    return Err(backoff::Error::permanent(err));
                                }
                            }
                            last_error = err.to_string();
                        }
                    }
                }
                Err(backoff::Error::transient(FetchError::AllUrlsFailed {
                    last_error,
                }))
            }
        };

        backoff::future::retry(policy, fetch).await
    }
}
