// THEORY:
// The renderer is the seam between the pipeline and whatever actually lights up
// pixels. The display loop is its only caller, so implementations need no
// synchronisation of their own.

use crate::core_modules::raster::Raster;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const RATE_REPORT_INTERVAL: Duration = Duration::from_secs(10);

pub trait Renderer {
    /// Shows a freshly presented frame.
    fn present(&mut self, frame: &Raster);
    /// Hides the placeholder and shows the live view.
    fn show_live(&mut self);
    /// Hides the live view and shows the "Connecting..." placeholder.
    fn show_placeholder(&mut self);
}

/// A headless renderer that logs visibility changes and the presentation rate.
pub struct LogRenderer {
    presented: u64,
    window_start: Instant,
    window_frames: u64,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self {
            presented: 0,
            window_start: Instant::now(),
            window_frames: 0,
        }
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl Default for LogRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for LogRenderer {
    fn present(&mut self, frame: &Raster) {
        self.presented += 1;
        self.window_frames += 1;

        let elapsed = self.window_start.elapsed();
        if elapsed >= RATE_REPORT_INTERVAL {
            let fps = self.window_frames as f64 / elapsed.as_secs_f64();
            info!(
                frame = frame.sequence(),
                fps = %format!("{fps:.1}"),
                "Presenting {}x{}",
                frame.width(),
                frame.height()
            );
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
    }

    fn show_live(&mut self) {
        info!("Live view shown");
    }

    fn show_placeholder(&mut self) {
        info!("Connecting... placeholder shown");
    }
}
