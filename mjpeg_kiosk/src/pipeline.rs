// THEORY:
// The `pipeline` module is the top-level API of the kiosk. It wires the network
// sources, the decode stage, the display state machine and the renderer into a
// single running system, and is the only place that knows about all of them.
//
// Key architectural principles:
// 1.  **One owner of the screen**: The display loop is the only caller of the
//     renderer and the only mutator of the display state. Sources communicate
//     with it through channels and never touch either.
// 2.  **One select loop**: Frames, the idle timer and cancellation are handled by
//     a single `tokio::select!`, biased towards cancellation. Once cancellation
//     is observed no further renderer call is made.
// 3.  **Structured shutdown**: Every spawned task shares the same cancellation
//     token and is awaited before `run` returns. Nothing outlives the pipeline.
// 4.  **Testable core**: `run_display_loop` takes any frame channel, decoder and
//     renderer, so the whole display path can be exercised without a network.

use crate::config::KioskConfig;
use crate::core_modules::buffer_pool::{BufferPool, RawFrameBuffer};
use crate::core_modules::decoder::FrameDecoder;
use crate::core_modules::display_state::{DisplayCommand, DisplayStateMachine};
use crate::core_modules::frame_source::{FrameSource, FrameSourceConfig};
use crate::core_modules::multipart::PartLimits;
use crate::core_modules::notify_source::{Notification, NotifySource, NotifyTiming};
use crate::core_modules::raster::DoubleBuffer;
use crate::core_modules::reconnect::ReconnectPolicy;
use crate::core_modules::renderer::Renderer;
use crate::error::StreamError;
use crate::system::Alert;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Configuration for the `KioskPipeline`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub mjpeg_url: String,
    pub notify_url: String,
    /// Idle time after the last frame before the placeholder comes back.
    pub blank_after: Duration,
    pub reconnect: ReconnectPolicy,
    pub part_limits: PartLimits,
    pub notify_timing: NotifyTiming,
}

impl From<&KioskConfig> for PipelineConfig {
    fn from(config: &KioskConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            mjpeg_url: config.mjpeg_url.clone(),
            notify_url: config.notify_url.clone(),
            blank_after: config.blank_after(),
            reconnect: ReconnectPolicy {
                backoff: config.reconnect_backoff(),
            },
            part_limits: PartLimits {
                stall_timeout: config.stall_timeout(),
                ..PartLimits::default()
            },
            notify_timing: NotifyTiming::default(),
        }
    }
}

/// Display-side settings for `run_display_loop`.
#[derive(Debug, Clone, Copy)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
    pub blank_after: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayLoopStats {
    pub frames_presented: u64,
    pub decode_failures: u64,
}

/// What a pipeline run did, reported once it has shut down.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub frames_presented: u64,
    pub decode_failures: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub connect_attempts: u64,
    pub notifications: u64,
    pub buffers_allocated: usize,
}

/// The whole kiosk: sources, decode stage, display and alerts.
pub struct KioskPipeline<D, R, A> {
    config: PipelineConfig,
    pool: Arc<BufferPool>,
    decoder: D,
    renderer: R,
    alert: A,
}

impl<D, R, A> KioskPipeline<D, R, A>
where
    D: FrameDecoder,
    R: Renderer,
    A: Alert,
{
    pub fn new(config: PipelineConfig, decoder: D, renderer: R, alert: A) -> Self {
        Self {
            config,
            pool: Arc::new(BufferPool::default()),
            decoder,
            renderer,
            alert,
        }
    }

    /// Runs until `cancel` fires, then waits for every task and reports.
    ///
    /// Only fails if the HTTP client cannot be constructed; every runtime
    /// failure is handled inside the stage that raised it.
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineSummary, StreamError> {
        let KioskPipeline {
            config,
            pool,
            mut decoder,
            mut renderer,
            alert,
        } = self;
        // Stops the sources even if the display loop ends on its own.
        let cancel = cancel.child_token();

        let frame_source = FrameSource::new(
            FrameSourceConfig {
                reconnect: config.reconnect,
                limits: config.part_limits,
                ..FrameSourceConfig::new(config.mjpeg_url.clone())
            },
            Arc::clone(&pool),
        )?;
        let source_stats = frame_source.stats();
        let (frames, frame_task) = frame_source.spawn(cancel.clone());

        let notify_source = NotifySource::new(
            config.notify_url.clone(),
            config.notify_timing,
            config.reconnect,
        );
        let (notifications, notify_task) = notify_source.spawn(cancel.clone());
        let alert_task = tokio::spawn(play_alerts(notifications, alert, cancel.clone()));

        info!(
            width = config.width,
            height = config.height,
            "Kiosk pipeline running"
        );
        let display = run_display_loop(
            frames,
            &mut decoder,
            &mut renderer,
            &pool,
            DisplaySettings {
                width: config.width,
                height: config.height,
                blank_after: config.blank_after,
            },
            &cancel,
        )
        .await;
        cancel.cancel();

        if let Err(e) = frame_task.await {
            error!("Frame source task failed: {e}");
        }
        if let Err(e) = notify_task.await {
            error!("Notify source task failed: {e}");
        }
        let notifications = match alert_task.await {
            Ok(count) => count,
            Err(e) => {
                error!("Alert task failed: {e}");
                0
            }
        };

        let summary = PipelineSummary {
            frames_presented: display.frames_presented,
            decode_failures: display.decode_failures,
            frames_forwarded: source_stats.frames_forwarded(),
            frames_dropped: source_stats.frames_dropped(),
            connect_attempts: source_stats.connect_attempts(),
            notifications,
            buffers_allocated: pool.allocated(),
        };
        info!(?summary, "Kiosk pipeline stopped");
        Ok(summary)
    }
}

/// Decodes and presents frames until cancelled or the frame channel closes.
pub async fn run_display_loop<D, R>(
    mut frames: mpsc::Receiver<RawFrameBuffer>,
    decoder: &mut D,
    renderer: &mut R,
    pool: &BufferPool,
    settings: DisplaySettings,
    cancel: &CancellationToken,
) -> DisplayLoopStats
where
    D: FrameDecoder + ?Sized,
    R: Renderer + ?Sized,
{
    let mut buffers = DoubleBuffer::new(settings.width, settings.height);
    let mut display = DisplayStateMachine::new(settings.blank_after);
    let mut stats = DisplayLoopStats::default();

    if cancel.is_cancelled() {
        return stats;
    }
    renderer.show_placeholder();

    loop {
        let idle_deadline = display.idle_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = idle_expiry(idle_deadline) => {
                if let Some(command) = display.idle_timer_fired(Instant::now()) {
                    info!("No frames for {:?}, showing placeholder", settings.blank_after);
                    apply(renderer, command);
                }
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    warn!("Frame channel closed");
                    break;
                };
                let decoded = decoder.decode(frame.as_slice(), settings.width, settings.height);
                pool.release(frame);

                let image = match decoded {
                    Ok(image) => image,
                    Err(e) => {
                        stats.decode_failures += 1;
                        warn!("Failed to decode jpeg: {e}");
                        continue;
                    }
                };
                // Decoding may take a while; do not touch the screen once
                // shutdown has begun.
                if cancel.is_cancelled() {
                    break;
                }

                let front = buffers.present(&image);
                if let Some(command) = display.frame_presented(Instant::now()) {
                    apply(renderer, command);
                }
                renderer.present(front);
                stats.frames_presented += 1;
            }
        }
    }
    stats
}

async fn idle_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn apply<R: Renderer + ?Sized>(renderer: &mut R, command: DisplayCommand) {
    match command {
        DisplayCommand::ShowLive => renderer.show_live(),
        DisplayCommand::ShowPlaceholder => renderer.show_placeholder(),
    }
}

/// Plays the alert once per notification, one at a time. Returns the number of
/// notifications received.
async fn play_alerts<A: Alert>(
    mut notifications: mpsc::Receiver<Notification>,
    alert: A,
    cancel: CancellationToken,
) -> u64 {
    let mut received = 0;
    loop {
        let notification = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            notification = notifications.recv() => notification,
        };
        if notification.is_none() {
            break;
        }
        received += 1;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = alert.play() => {
                if let Err(e) = result {
                    error!("Failed to play notify sound: {e}");
                }
            }
        }
    }
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::raster::Raster;
    use crate::error::DecodeError;
    use image::{Rgba, RgbaImage};

    /// Decodes `[n]` into a solid image of shade `n`; anything else fails.
    struct ShadeDecoder;

    impl FrameDecoder for ShadeDecoder {
        fn decode(&mut self, data: &[u8], width: u32, height: u32) -> Result<RgbaImage, DecodeError> {
            match data {
                [shade] => Ok(RgbaImage::from_pixel(width, height, Rgba([*shade, 0, 0, 255]))),
                _ => Err(DecodeError::Empty),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Present { sequence: u64, shade: u8, at: Duration },
        ShowLive(Duration),
        ShowPlaceholder(Duration),
    }

    struct RecordingRenderer {
        start: Instant,
        calls: Vec<Call>,
    }

    impl RecordingRenderer {
        fn new() -> Self {
            Self {
                start: Instant::now(),
                calls: Vec::new(),
            }
        }
    }

    impl Renderer for RecordingRenderer {
        fn present(&mut self, frame: &Raster) {
            self.calls.push(Call::Present {
                sequence: frame.sequence(),
                shade: frame.pixel(0, 0)[0],
                at: self.start.elapsed(),
            });
        }

        fn show_live(&mut self) {
            self.calls.push(Call::ShowLive(self.start.elapsed()));
        }

        fn show_placeholder(&mut self) {
            self.calls.push(Call::ShowPlaceholder(self.start.elapsed()));
        }
    }

    const SETTINGS: DisplaySettings = DisplaySettings {
        width: 4,
        height: 4,
        blank_after: Duration::from_secs(15),
    };

    fn frame(pool: &BufferPool, bytes: &[u8]) -> RawFrameBuffer {
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(bytes);
        buffer
    }

    #[tokio::test(start_paused = true)]
    async fn blanks_fifteen_seconds_after_the_last_frame() {
        let pool = BufferPool::default();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let mut renderer = RecordingRenderer::new();

        let driver = async {
            tx.send(frame(&pool, &[1])).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            tx.send(frame(&pool, &[2])).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            cancel.cancel();
        };
        let mut decoder = ShadeDecoder;
        let (stats, ()) = tokio::join!(
            run_display_loop(rx, &mut decoder, &mut renderer, &pool, SETTINGS, &cancel),
            driver
        );

        assert_eq!(stats.frames_presented, 2);
        assert_eq!(
            renderer.calls,
            vec![
                Call::ShowPlaceholder(Duration::ZERO),
                Call::ShowLive(Duration::ZERO),
                Call::Present { sequence: 1, shade: 1, at: Duration::ZERO },
                Call::Present { sequence: 2, shade: 2, at: Duration::from_secs(5) },
                Call::ShowPlaceholder(Duration::from_secs(20)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failures_are_skipped_and_buffers_recycled() {
        let pool = BufferPool::default();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let mut renderer = RecordingRenderer::new();

        let driver = async {
            tx.send(frame(&pool, b"corrupt")).await.unwrap();
            tx.send(frame(&pool, &[7])).await.unwrap();
            drop(tx);
        };
        let mut decoder = ShadeDecoder;
        let (stats, ()) = tokio::join!(
            run_display_loop(rx, &mut decoder, &mut renderer, &pool, SETTINGS, &cancel),
            driver
        );

        assert_eq!(stats, DisplayLoopStats { frames_presented: 1, decode_failures: 1 });
        assert_eq!(renderer.calls.len(), 3);
        assert!(matches!(renderer.calls[2], Call::Present { shade: 7, .. }));
        assert_eq!(pool.idle(), pool.allocated());
    }

    #[tokio::test(start_paused = true)]
    async fn no_renderer_calls_after_cancellation() {
        let pool = BufferPool::default();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let mut renderer = RecordingRenderer::new();

        let driver = async {
            tx.send(frame(&pool, &[1])).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
            // Queued before the loop gets to observe cancellation.
            tx.send(frame(&pool, &[2])).await.unwrap();
        };
        let mut decoder = ShadeDecoder;
        let (stats, ()) = tokio::join!(
            run_display_loop(rx, &mut decoder, &mut renderer, &pool, SETTINGS, &cancel),
            driver
        );

        assert_eq!(stats.frames_presented, 1);
        assert!(renderer.calls.iter().all(|call| !matches!(call, Call::Present { shade: 2, .. })));
    }

    #[tokio::test]
    async fn already_cancelled_loop_never_renders() {
        let pool = BufferPool::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_tx, rx) = mpsc::channel(1);
        let mut renderer = RecordingRenderer::new();

        let mut decoder = ShadeDecoder;
        run_display_loop(rx, &mut decoder, &mut renderer, &pool, SETTINGS, &cancel).await;
        assert!(renderer.calls.is_empty());
    }
}
