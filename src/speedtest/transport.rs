//! Network seam between the engine and the actual endpoints.
//!
//! The engine only ever talks to a [`Transport`]; [`HttpTransport`] is the
//! production implementation over `reqwest`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;

use super::coordinator::StreamReporter;
use super::error::{Result, SpeedTestError};
use crate::settings::Settings;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WARM_UP_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[async_trait]
pub trait Transport: Send + Sync {
    /// One round trip to the ping target. Any response at all counts as
    /// completion; its content is never inspected.
    async fn probe(&self, nonce: u64) -> Result<()>;

    /// Fetches `bytes` bytes, reporting the running total after every chunk.
    async fn download(&self, bytes: u64, reporter: StreamReporter) -> Result<u64>;

    /// Sends `payload`, reporting bytes handed to the connection so far.
    async fn upload(&self, payload: Bytes, reporter: StreamReporter) -> Result<u64>;

    /// Trivial POST to the upload endpoint to wake a cold server.
    async fn warm_up(&self) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    ping_url: String,
    download_url: String,
    upload_url: String,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let probe_client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            probe_client,
            ping_url: settings.ping_url.clone(),
            download_url: settings.download_url.clone(),
            upload_url: settings.upload_url.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, nonce: u64) -> Result<()> {
        let url = with_query(&self.ping_url, "t", nonce);
        self.probe_client
            .get(&url)
            .send()
            .await
            .map_err(|e| SpeedTestError::Probe(e.to_string()))?;
        Ok(())
    }

    async fn download(&self, bytes: u64, reporter: StreamReporter) -> Result<u64> {
        let url = with_query(&self.download_url, "bytes", bytes);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| reporter.failure(e))?;

        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| reporter.failure(e))?;
            received += chunk.len() as u64;
            reporter.report(received);
        }

        Ok(received)
    }

    async fn upload(&self, payload: Bytes, reporter: StreamReporter) -> Result<u64> {
        let total = payload.len() as u64;
        let chunks: Vec<Bytes> = (0..payload.len())
            .step_by(UPLOAD_CHUNK_SIZE)
            .map(|at| payload.slice(at..(at + UPLOAD_CHUNK_SIZE).min(payload.len())))
            .collect();

        let progress = reporter.clone();
        let mut sent: u64 = 0;
        let body = futures::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            progress.report(sent);
            Ok::<Bytes, std::io::Error>(chunk)
        });

        self.client
            .post(&self.upload_url)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| reporter.failure(e))?;

        Ok(total)
    }

    async fn warm_up(&self) -> Result<()> {
        self.client
            .post(&self.upload_url)
            .timeout(WARM_UP_TIMEOUT)
            .body("wake")
            .send()
            .await?;
        Ok(())
    }
}

fn with_query(base: &str, key: &str, value: u64) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}{key}={value}")
}
