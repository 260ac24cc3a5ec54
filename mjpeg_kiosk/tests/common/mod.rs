#![allow(dead_code)]

use mjpeg_kiosk_simulator::{
    ControlHandle, FrameBus, GeneratorConfig, ServerConfig, spawn_generator, start_server,
};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Camera {
    pub addr: SocketAddr,
    pub bus: FrameBus,
    pub play_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Camera {
    pub async fn start(generator: GeneratorConfig, dashed_boundary_header: bool) -> Self {
        let bus = FrameBus::new(4);
        let (play_tx, play_rx) = watch::channel(true);
        let generator = spawn_generator(bus.clone(), generator, play_rx);
        let cfg = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            boundary: "kioskframe".into(),
            dashed_boundary_header,
        };
        let (addr, server) = start_server(bus.clone(), cfg, ControlHandle { play_tx: play_tx.clone() })
            .await
            .unwrap();
        Self {
            addr,
            bus,
            play_tx,
            tasks: vec![generator, server],
        }
    }

    pub fn stream_url(&self) -> String {
        format!("http://{}/stream", self.addr)
    }

    pub fn notify_url(&self) -> String {
        format!("ws://{}/notify", self.addr)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub fn small_frames(fps: u32) -> GeneratorConfig {
    GeneratorConfig {
        width: 64,
        height: 48,
        fps,
        quality: 70,
    }
}

/// Polls `condition` every 10 ms until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
