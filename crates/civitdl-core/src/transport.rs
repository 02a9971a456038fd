//! Byte-range transport used by the transfer workers

use crate::error::CivitdlError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

pub type ByteStream = BoxStream<'static, Result<Bytes, CivitdlError>>;

/// An open transfer
pub struct RangeResponse {
    /// Offset of the first byte in `stream`. Equals the requested start when
    /// the range was honored, 0 when the server sent the whole file instead.
    pub offset: u64,
    /// Total length of the resource, when the server reported it
    pub total: Option<u64>,
    pub stream: ByteStream,
}

impl RangeResponse {
    pub fn resumed(&self) -> bool {
        self.offset > 0
    }
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("offset", &self.offset)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Opens resumable downloads
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start streaming `url` from byte `start`. Implementations that cannot
    /// resume return a stream starting at offset 0.
    async fn open_range(&self, url: &str, start: u64) -> Result<RangeResponse, CivitdlError>;
}

/// `reqwest` backed transport
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, CivitdlError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CivitdlError::InvalidConfig(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_range(&self, url: &str, start: u64) -> Result<RangeResponse, CivitdlError> {
        let mut request = self.client.get(url);
        if start > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", start));
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // "bytes */total": the partial file may already hold everything
            let total = headers
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            return match total {
                Some(total) if total == start => Ok(RangeResponse {
                    offset: start,
                    total: Some(total),
                    stream: stream::empty().boxed(),
                }),
                _ => Err(CivitdlError::Integrity(format!(
                    "range starting at {} not satisfiable (total {:?})",
                    start, total
                ))),
            };
        }

        if !status.is_success() {
            return Err(CivitdlError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed"),
            ));
        }

        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let (offset, total) = if status == StatusCode::PARTIAL_CONTENT {
            let total = headers
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or(content_length.map(|len| start + len));
            (start, total)
        } else {
            if start > 0 {
                debug!("Server ignored range request for {}, restarting from 0", url);
            }
            (0, content_length)
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CivitdlError::from))
            .boxed();

        Ok(RangeResponse {
            offset,
            total,
            stream,
        })
    }
}

/// Total length from a `Content-Range` value such as `bytes 0-99/1234`
fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}
