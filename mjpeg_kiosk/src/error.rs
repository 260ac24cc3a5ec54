// THEORY:
// Every failure in the kiosk falls into one of four families, and each family
// has exactly one place where it is handled:
//
// 1.  **Stream errors** (`StreamError`, `NotifyError`): raised inside a single
//     connection attempt of a network source. They never leave the source task;
//     the reconnect wrapper logs them and starts a new attempt after the backoff.
// 2.  **Decode errors** (`DecodeError`): raised per frame by the decode stage. The
//     frame is skipped and the display loop carries on.
// 3.  **Setup errors** (`ConfigError`, `SystemError` from screen blanking): only
//     produced before the pipeline starts. The binary exits on them.
// 4.  **Side-effect errors** (`SystemError` from the alert command): logged and
//     ignored by the alert consumer.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that end one connection attempt of the MJPEG frame source.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The HTTP client could not be built or the request could not be sent.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No response headers arrived within the stall timeout.
    #[error("no response headers within {0:?}")]
    HeadersTimeout(std::time::Duration),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The response did not declare a usable multipart boundary.
    #[error("bad multipart content type {content_type:?}: {reason}")]
    ContentType {
        content_type: String,
        reason: &'static str,
    },

    /// The multipart body was malformed, truncated or stalled.
    #[error("multipart read failed: {0}")]
    Multipart(#[from] MultipartError),
}

/// Errors raised while splitting a multipart body into sections.
#[derive(Error, Debug)]
pub enum MultipartError {
    /// The underlying byte stream failed.
    #[error("body read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The body ended in the middle of a section or its headers.
    #[error("stream ended inside a multipart section")]
    UnexpectedEof,

    /// The first boundary line did not match the declared boundary.
    #[error("expected boundary line, found {0:?}")]
    MissingBoundary(String),

    /// A section header block exceeded the header size limit.
    #[error("section headers larger than {0} bytes")]
    HeadersTooLarge(usize),

    /// A section body exceeded the configured size limit.
    #[error("section larger than {0} bytes")]
    PartTooLarge(usize),

    /// No bytes arrived within the stall timeout.
    #[error("no data received for {0:?}")]
    Stalled(std::time::Duration),
}

/// Errors that end one connection attempt of the notification source.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The websocket handshake or a read failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// No pong arrived before the read deadline.
    #[error("no pong received within {0:?}")]
    PongTimeout(std::time::Duration),

    /// The server closed the websocket.
    #[error("socket closed by peer")]
    Closed,
}

/// Errors from decoding one JPEG frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The buffer was empty.
    #[error("empty frame")]
    Empty,

    /// The image crate rejected the data.
    #[error("jpeg decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Errors loading or validating the kiosk configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from the external commands the kiosk runs (alert sound, xset).
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
    },
}
