//! Opening the global event stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::debug;

use super::discovery::ServerEndpoint;
use crate::error::TransportError;

/// Body chunks of one event stream, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Path of the multiplexed event stream on an opencode server.
pub const EVENT_PATH: &str = "/global/event";

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Open the stream. Resolves once the server has accepted it.
    async fn open(&self, endpoint: &ServerEndpoint) -> Result<ByteStream, TransportError>;
}

/// `GET {base}/global/event` over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        // No overall timeout: the stream is meant to stay open. Silence is
        // caught by the heartbeat deadline instead.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

pub fn event_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), EVENT_PATH)
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn open(&self, endpoint: &ServerEndpoint) -> Result<ByteStream, TransportError> {
        let url = event_url(&endpoint.base_url);
        debug!("Connecting to event stream at {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| TransportError::Connect {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::Body))
            .boxed())
    }
}
