use anyhow::Context;
use clap::Parser;
use mjpeg_kiosk::system::disable_screen_blanking;
use mjpeg_kiosk::{
    CommandAlert, JpegFrameDecoder, KioskConfig, KioskPipeline, LogRenderer, PipelineConfig,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Full-screen viewer for an MJPEG camera.
///
/// This binary runs the kiosk headless: frames are decoded and counted, and
/// visibility changes are logged, but no window is opened. Embedders get a
/// screen by implementing `mjpeg_kiosk::Renderer` and passing it to
/// `KioskPipeline::new` in place of `LogRenderer`.
#[derive(Parser, Debug)]
#[command(author, version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = KioskConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    if config.disable_blanking {
        disable_screen_blanking(&config.x_display)
            .await
            .context("Failed to disable screen blanking")?;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let pipeline = KioskPipeline::new(
        PipelineConfig::from(&config),
        JpegFrameDecoder::default(),
        LogRenderer::new(),
        CommandAlert::new(config.alert_command.clone()),
    );
    info!("Starting kiosk with the headless log renderer");
    let summary = pipeline.run(cancel).await?;

    info!(
        presented = summary.frames_presented,
        dropped = summary.frames_dropped,
        notifications = summary.notifications,
        "Exit"
    );
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    warn!("Shutting down...");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
