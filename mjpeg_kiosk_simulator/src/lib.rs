// THEORY:
// A stand-in for the kiosk's camera. It serves the two endpoints the kiosk
// consumes: an endless `multipart/x-mixed-replace` MJPEG stream and a websocket
// that pushes a message on every motion event. Frames and motion events travel
// over a `FrameBus` of broadcast channels, so any number of clients see the same
// stream and a slow client only loses its own frames.
//
// The frame generator renders a moving gradient and encodes it with the `image`
// crate, so the kiosk decodes real JPEG data end to end.

use axum::body::Body;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FramePacket {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    /// Encoded JPEG.
    pub data: Bytes,
}

/// Payload pushed to notification clients.
#[derive(Debug, Clone, Serialize)]
pub struct MotionEvent {
    pub id: u64,
    pub ts_millis: u64,
}

#[derive(Clone)]
pub struct FrameBus {
    pub frames_tx: broadcast::Sender<FramePacket>,
    pub motion_tx: broadcast::Sender<MotionEvent>,
    stats: Arc<BusStats>,
}

#[derive(Debug, Default)]
struct BusStats {
    frames_published: AtomicU64,
    motion_events: AtomicU64,
    stream_clients: AtomicU64,
    notify_clients: AtomicU64,
    last_seq: AtomicU64,
    last_width: AtomicU64,
    last_height: AtomicU64,
}

/// Sequence number and size of the most recently published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameInfo {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub frames_published: u64,
    pub motion_events: u64,
    /// Stream connections accepted since start.
    pub stream_clients: u64,
    /// Notification connections accepted since start.
    pub notify_clients: u64,
    pub last_frame: Option<FrameInfo>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (motion_tx, _) = broadcast::channel::<MotionEvent>(capacity.max(1));
        Self {
            frames_tx,
            motion_tx,
            stats: Arc::new(BusStats::default()),
        }
    }

    pub fn publish_frame(&self, packet: FramePacket) {
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        self.stats.last_width.store(packet.width.into(), Ordering::Relaxed);
        self.stats.last_height.store(packet.height.into(), Ordering::Relaxed);
        self.stats.last_seq.store(packet.seq, Ordering::Relaxed);
        // No receivers is fine: nobody is watching right now.
        let _ = self.frames_tx.send(packet);
    }

    pub fn trigger_motion(&self) -> MotionEvent {
        let id = self.stats.motion_events.fetch_add(1, Ordering::Relaxed) + 1;
        let event = MotionEvent {
            id,
            ts_millis: now_millis(),
        };
        let _ = self.motion_tx.send(event.clone());
        event
    }

    pub fn stats(&self) -> StatsSnapshot {
        let seq = self.stats.last_seq.load(Ordering::Relaxed);
        let last_frame = (seq > 0).then(|| FrameInfo {
            seq,
            width: self.stats.last_width.load(Ordering::Relaxed) as u32,
            height: self.stats.last_height.load(Ordering::Relaxed) as u32,
        });
        StatsSnapshot {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            motion_events: self.stats.motion_events.load(Ordering::Relaxed),
            stream_clients: self.stats.stream_clients.load(Ordering::Relaxed),
            notify_clients: self.stats.notify_clients.load(Ordering::Relaxed),
            last_frame,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Boundary token used between parts.
    pub boundary: String,
    /// Declare the boundary as `--token` in the header, as some cameras do.
    pub dashed_boundary_header: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8081".to_string(),
            boundary: "frame".to_string(),
            dashed_boundary_header: false,
        }
    }
}

#[derive(Clone)]
pub struct ControlHandle {
    pub play_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct AppState {
    bus: FrameBus,
    cfg: ServerConfig,
    control: ControlHandle,
}

pub fn router(bus: FrameBus, cfg: ServerConfig, control: ControlHandle) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .route("/notify", get(notify_handler))
        .route("/control/play", post(play_handler))
        .route("/control/pause", post(pause_handler))
        .route("/control/motion", post(motion_handler))
        .route("/stats", get(stats_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(AppState { bus, cfg, control })
}

/// Binds `cfg.bind_addr` and serves in the background. Returns the bound address,
/// which matters when binding port 0.
pub async fn start_server(
    bus: FrameBus,
    cfg: ServerConfig,
    control: ControlHandle,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    let addr = listener.local_addr()?;
    let app = router(bus, cfg, control);
    info!("Camera simulator listening on http://{addr}");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Simulator server stopped: {e}");
        }
    });
    Ok((addr, server))
}

async fn stream_handler(State(state): State<AppState>) -> Response {
    state.bus.stats.stream_clients.fetch_add(1, Ordering::Relaxed);
    let mut rx = state.bus.frames_tx.subscribe();
    let boundary = state.cfg.boundary.clone();
    let declared = if state.cfg.dashed_boundary_header {
        format!("--{boundary}")
    } else {
        boundary.clone()
    };

    let body = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(packet) => {
                    let head = format!(
                        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        packet.data.len()
                    );
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(head));
                    yield Ok(packet.data);
                    yield Ok(Bytes::from_static(b"\r\n"));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Stream client lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={declared}"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

async fn notify_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    state.bus.stats.notify_clients.fetch_add(1, Ordering::Relaxed);
    // Subscribe before the handshake completes so no event is missed.
    let events = state.bus.motion_tx.subscribe();
    ws.on_upgrade(move |socket| notify_conn(socket, events))
}

async fn notify_conn(mut socket: WebSocket, mut events: broadcast::Receiver<MotionEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // Keep reading so pings get their pongs.
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Notification client gone");
}

async fn play_handler(State(state): State<AppState>) -> StatusCode {
    let _ = state.control.play_tx.send(true);
    StatusCode::NO_CONTENT
}

async fn pause_handler(State(state): State<AppState>) -> StatusCode {
    let _ = state.control.play_tx.send(false);
    StatusCode::NO_CONTENT
}

async fn motion_handler(State(state): State<AppState>) -> Json<MotionEvent> {
    Json(state.bus.trigger_motion())
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.bus.stats())
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            quality: 75,
        }
    }
}

/// Publishes synthetic frames at `cfg.fps` while `play` is true.
pub fn spawn_generator(
    bus: FrameBus,
    cfg: GeneratorConfig,
    play: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(1) / cfg.fps.max(1);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut seq = 0u64;
        loop {
            ticker.tick().await;
            if !*play.borrow() {
                continue;
            }
            seq += 1;
            match synthetic_jpeg(cfg.width, cfg.height, seq, cfg.quality) {
                Ok(data) => bus.publish_frame(FramePacket {
                    seq,
                    width: cfg.width,
                    height: cfg.height,
                    data,
                }),
                Err(e) => warn!("Failed to encode frame {seq}: {e}"),
            }
        }
    })
}

/// A diagonal gradient that scrolls with `seq`.
pub fn synthetic_jpeg(width: u32, height: u32, seq: u64, quality: u8) -> anyhow::Result<Bytes> {
    let shift = (seq * 4) as u32;
    let image = RgbImage::from_fn(width, height, |x, y| {
        let v = (x + y + shift) % 256;
        Rgb([v as u8, (255 - v) as u8, ((x * 255) / width.max(1)) as u8])
    });
    let mut out = Vec::with_capacity((width * height / 4) as usize);
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        image.as_raw(),
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(Bytes::from(out))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
