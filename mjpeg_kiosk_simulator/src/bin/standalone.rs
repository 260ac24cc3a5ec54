use clap::Parser;
use mjpeg_kiosk_simulator::{
    ControlHandle, FrameBus, GeneratorConfig, ServerConfig, spawn_generator, start_server,
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Synthetic MJPEG camera for the kiosk viewer", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8081")]
    bind: String,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(long, default_value_t = 15)]
    fps: u32,

    /// Multipart boundary token
    #[arg(long, default_value = "frame")]
    boundary: String,

    /// Declare the boundary with a leading `--` in the Content-Type header
    #[arg(long)]
    dashed_boundary_header: bool,

    /// Trigger a motion event every N seconds (0 = only via POST /control/motion)
    #[arg(long, default_value_t = 0)]
    motion_every: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let bus = FrameBus::new(2);
    let (play_tx, play_rx) = tokio::sync::watch::channel(true);
    let generator = spawn_generator(
        bus.clone(),
        GeneratorConfig {
            width: args.width,
            height: args.height,
            fps: args.fps,
            ..GeneratorConfig::default()
        },
        play_rx,
    );

    if args.motion_every > 0 {
        let bus = bus.clone();
        let period = Duration::from_secs(args.motion_every);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let event = bus.trigger_motion();
                info!(id = event.id, "Motion");
            }
        });
    }

    let cfg = ServerConfig {
        bind_addr: args.bind,
        boundary: args.boundary,
        dashed_boundary_header: args.dashed_boundary_header,
    };
    let (_addr, server) = start_server(bus, cfg, ControlHandle { play_tx }).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        _ = server => {}
    }
    generator.abort();
    Ok(())
}
