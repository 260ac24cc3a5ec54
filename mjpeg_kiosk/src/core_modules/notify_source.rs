// THEORY:
// The `NotifySource` listens on the camera's notification websocket. The camera
// pushes a message whenever it detects motion; the kiosk only cares *that* a
// message arrived, not what it says.
//
// Key architectural principles:
// 1.  **Liveness by heartbeat**: A websocket that silently dies looks exactly
//     like a quiet camera. A heartbeat task pings the server on a fixed interval
//     and the read side only extends its deadline when a pong comes back. No
//     pong within the deadline means the connection is dead and is rebuilt.
// 2.  **Data messages only**: Text and binary messages each become one
//     `Notification`. Control frames (ping, pong) never do.
// 3.  **No loss**: Notifications are sent with an awaited `send`, so a slow
//     consumer applies backpressure instead of losing an alert.
// 4.  **Scoped heartbeat**: The heartbeat task belongs to one connection
//     attempt. It is aborted when the attempt ends for any reason, including
//     cancellation dropping the attempt mid-flight.

use crate::core_modules::reconnect::{
    AttemptOutcome, ConnectionState, ReconnectPolicy, run_with_reconnect,
};
use crate::error::NotifyError;
use futures::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub const NOTIFY_CHANNEL_CAPACITY: usize = 1;

/// Heartbeat timing for the notification socket.
#[derive(Debug, Clone, Copy)]
pub struct NotifyTiming {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Read deadline, re-armed by every pong.
    pub pong_timeout: Duration,
    /// Upper bound for sending one ping.
    pub write_timeout: Duration,
}

impl Default for NotifyTiming {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// One motion event. The payload of the websocket message is not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification;

pub struct NotifySource {
    url: String,
    timing: NotifyTiming,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl NotifySource {
    pub fn new(url: impl Into<String>, timing: NotifyTiming, reconnect: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            timing,
            reconnect,
            state,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<Notification>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move { self.run(tx, cancel).await });
        (rx, handle)
    }

    pub async fn run(self, tx: mpsc::Sender<Notification>, cancel: CancellationToken) {
        let this = &self;
        let tx = &tx;
        run_with_reconnect(
            "notify",
            &self.url,
            self.reconnect,
            &cancel,
            &self.state,
            || this.listen_once(tx),
        )
        .await;
    }

    async fn listen_once(
        &self,
        tx: &mpsc::Sender<Notification>,
    ) -> Result<AttemptOutcome, NotifyError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        self.state.send_replace(ConnectionState::Connected);
        info!(source = "notify", "Connected to {}", self.url);

        let (sink, mut stream) = socket.split();
        let _heartbeat = AbortOnDrop(tokio::spawn(heartbeat(sink, self.timing)));

        let mut deadline = Instant::now() + self.timing.pong_timeout;
        loop {
            let message = match timeout_at(deadline, stream.next()).await {
                Err(_) => return Err(NotifyError::PongTimeout(self.timing.pong_timeout)),
                Ok(None) => return Err(NotifyError::Closed),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Pong(_) => {
                    trace!("Pong received");
                    deadline = Instant::now() + self.timing.pong_timeout;
                }
                Message::Text(_) | Message::Binary(_) => {
                    info!("Got message on notify socket");
                    if tx.send(Notification).await.is_err() {
                        return Ok(AttemptOutcome::Stop);
                    }
                }
                Message::Close(frame) => {
                    debug!(?frame, "Notify socket closed by server");
                    return Ok(AttemptOutcome::Reconnect);
                }
                Message::Ping(_) | Message::Frame(_) => {}
            }
        }
    }
}

/// Pings on every tick until a send fails or times out.
async fn heartbeat<S>(mut sink: S, timing: NotifyTiming)
where
    S: Sink<Message> + Unpin,
{
    let mut ticker = tokio::time::interval_at(
        Instant::now() + timing.ping_interval,
        timing.ping_interval,
    );
    loop {
        ticker.tick().await;
        match timeout(timing.write_timeout, sink.send(Message::Ping(Vec::new()))).await {
            Ok(Ok(())) => trace!("Ping sent"),
            _ => return,
        }
    }
}
