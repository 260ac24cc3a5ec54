// THEORY:
// The `FrameSource` is the producer end of the kiosk pipeline. It holds one
// long-lived HTTP GET against the camera's MJPEG endpoint, splits the multipart
// body into JPEG frames and hands them to the display loop.
//
// Key architectural principles:
// 1.  **Freshness over completeness**: The hand-off channel has capacity one and
//     is fed with `try_send`. If the display is still busy with the previous
//     frame, the new one is dropped on the spot and its buffer goes back to the
//     pool. The viewer therefore never shows a frame older than the newest one
//     waiting, no matter how slow decoding is.
// 2.  **Pooled buffers**: Every section is read into a buffer from the shared
//     `BufferPool`. A buffer leaves this module either through the channel or
//     through `release`, never both.
// 3.  **Raw bytes on the wire**: Content-encoding negotiation is switched off.
//     Multipart boundaries are located in the bytes exactly as the camera sends
//     them.
// 4.  **Self-healing**: Each connection is one attempt under
//     `run_with_reconnect`. A bad status, a malformed content type, a truncated
//     section or a stall (before or after the headers) ends the attempt and
//     leads to a fresh connection.

use crate::core_modules::buffer_pool::{BufferPool, RawFrameBuffer};
use crate::core_modules::multipart::{MultipartReader, PartLimits, boundary_from_content_type};
use crate::core_modules::reconnect::{
    AttemptOutcome, ConnectionState, ReconnectPolicy, run_with_reconnect,
};
use crate::error::StreamError;
use futures::TryStreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_TYPE};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Capacity of the frame hand-off channel. One slot means at most one stale
/// frame can ever be waiting for the display.
pub const FRAME_CHANNEL_CAPACITY: usize = 1;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct FrameSourceConfig {
    /// The camera's MJPEG endpoint.
    pub url: String,
    pub reconnect: ReconnectPolicy,
    pub limits: PartLimits,
    /// TCP connect (and TLS handshake) timeout for each attempt.
    pub connect_timeout: Duration,
    /// How long an idle pooled connection is kept around.
    pub pool_idle_timeout: Duration,
}

impl FrameSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            limits: PartLimits::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
        }
    }
}

/// Counters published by a running `FrameSource`.
#[derive(Debug, Default)]
pub struct SourceStats {
    connect_attempts: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SourceStats {
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn frames_forwarded(&self) -> u64 {
        self.frames_forwarded.load(Ordering::Relaxed)
    }

    /// Frames discarded because the display had not taken the previous one yet.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

pub struct FrameSource {
    config: FrameSourceConfig,
    client: Client,
    pool: Arc<BufferPool>,
    stats: Arc<SourceStats>,
    state: watch::Sender<ConnectionState>,
}

impl FrameSource {
    pub fn new(config: FrameSourceConfig, pool: Arc<BufferPool>) -> Result<Self, StreamError> {
        let client = Client::builder()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            config,
            client,
            pool,
            stats: Arc::new(SourceStats::default()),
            state,
        })
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts the source on its own task.
    ///
    /// The returned receiver yields frames until the source stops. The source
    /// stops on cancellation or when the receiver is dropped.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<RawFrameBuffer>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move { self.run(tx, cancel).await });
        (rx, handle)
    }

    pub async fn run(self, tx: mpsc::Sender<RawFrameBuffer>, cancel: CancellationToken) {
        let this = &self;
        let tx = &tx;
        run_with_reconnect(
            "mjpeg",
            &self.config.url,
            self.config.reconnect,
            &cancel,
            &self.state,
            || this.stream_once(tx),
        )
        .await;
    }

    /// One connection: request, validate, then forward sections until the body
    /// ends or fails.
    async fn stream_once(
        &self,
        tx: &mpsc::Sender<RawFrameBuffer>,
    ) -> Result<AttemptOutcome, StreamError> {
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        // A peer that accepts the connection but never answers would otherwise
        // hold the attempt forever.
        let stall = self.config.limits.stall_timeout;
        let request = self
            .client
            .get(&self.config.url)
            .header(ACCEPT_ENCODING, "identity")
            .send();
        let response = timeout(stall, request)
            .await
            .map_err(|_| StreamError::HeadersTimeout(stall))??;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = boundary_from_content_type(&content_type)?;
        debug!(boundary = %boundary, "MJPEG stream content type accepted");

        let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
        let mut reader = MultipartReader::new(body, &boundary, self.config.limits);
        self.state.send_replace(ConnectionState::Connected);
        info!(source = "mjpeg", "Connected to {}", self.config.url);

        loop {
            let mut buffer = self.pool.acquire();
            match reader.next_part(&mut buffer).await {
                Ok(true) => {}
                Ok(false) => {
                    self.pool.release(buffer);
                    return Ok(AttemptOutcome::Reconnect);
                }
                Err(e) => {
                    self.pool.release(buffer);
                    return Err(e.into());
                }
            }

            if buffer.is_empty() {
                self.pool.release(buffer);
                continue;
            }

            match tx.try_send(buffer) {
                Ok(()) => {
                    self.stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(buffer)) => {
                    self.pool.release(buffer);
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Display busy, dropping frame");
                }
                Err(TrySendError::Closed(buffer)) => {
                    self.pool.release(buffer);
                    return Ok(AttemptOutcome::Stop);
                }
            }
        }
    }
}
