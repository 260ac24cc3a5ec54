mod common;

use common::{Camera, small_frames};
use futures::StreamExt;
use mjpeg_kiosk::core_modules::notify_source::{Notification, NotifySource, NotifyTiming};
use mjpeg_kiosk::core_modules::reconnect::{ConnectionState, ReconnectPolicy};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const FAST_RETRY: ReconnectPolicy = ReconnectPolicy {
    backoff: Duration::from_millis(50),
};

#[tokio::test]
async fn every_data_message_is_one_notification() {
    let camera = Camera::start(small_frames(1), false).await;
    let cancel = CancellationToken::new();
    let source = NotifySource::new(camera.notify_url(), NotifyTiming::default(), FAST_RETRY);
    let mut state = source.subscribe_state();
    let (mut notifications, handle) = source.spawn(cancel.clone());

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    camera.bus.trigger_motion();
    camera.bus.trigger_motion();
    for _ in 0..2 {
        let notification = timeout(Duration::from_secs(5), notifications.recv()).await.unwrap();
        assert_eq!(notification, Some(Notification));
    }

    cancel.cancel();
    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert_eq!(notifications.recv().await, None);
}

#[tokio::test]
async fn control_frames_are_not_notifications() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        use futures::SinkExt;
        ws.send(Message::Pong(Vec::new())).await.unwrap();
        ws.send(Message::Ping(b"hello".to_vec())).await.unwrap();
        ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        // Keep reading so the client's pings are answered.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let cancel = CancellationToken::new();
    let source = NotifySource::new(format!("ws://{addr}"), NotifyTiming::default(), FAST_RETRY);
    let (mut notifications, handle) = source.spawn(cancel.clone());

    assert_eq!(
        timeout(Duration::from_secs(5), notifications.recv()).await.unwrap(),
        Some(Notification)
    );
    assert!(matches!(
        timeout(Duration::from_millis(300), notifications.recv()).await,
        Err(_)
    ));

    cancel.cancel();
    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_pongs_force_a_reconnect() {
    // A server that completes the handshake and then never reads, so the
    // client's pings are never answered.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = accepted_tx.send(Instant::now());
            held.push(ws);
        }
    });

    let timing = NotifyTiming {
        ping_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(300),
        write_timeout: Duration::from_millis(100),
    };
    let cancel = CancellationToken::new();
    let source = NotifySource::new(format!("ws://{addr}"), timing, FAST_RETRY);
    let (_notifications, handle) = source.spawn(cancel.clone());

    let first = timeout(Duration::from_secs(5), accepted.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), accepted.recv()).await.unwrap().unwrap();
    let gap = second - first;
    assert!(gap >= Duration::from_millis(300), "reconnected after {gap:?}");
    assert!(gap < Duration::from_secs(3), "reconnected after {gap:?}");

    cancel.cancel();
    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn answered_pings_keep_the_connection_open() {
    // Reading drives tungstenite's automatic pong replies.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = accepted_tx.send(());
            tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} });
        }
    });

    let timing = NotifyTiming {
        ping_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(300),
        write_timeout: Duration::from_millis(100),
    };
    let cancel = CancellationToken::new();
    let source = NotifySource::new(format!("ws://{addr}"), timing, FAST_RETRY);
    let state = source.subscribe_state();
    let (_notifications, handle) = source.spawn(cancel.clone());

    timeout(Duration::from_secs(5), accepted.recv()).await.unwrap().unwrap();
    // Several pong timeouts' worth of time.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(accepted.try_recv().is_err(), "client reconnected while pongs were flowing");
    assert_eq!(*state.borrow(), ConnectionState::Connected);

    cancel.cancel();
    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn server_close_leads_to_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = accepted_tx.send(());
            let _ = ws.close(None).await;
        }
    });

    let cancel = CancellationToken::new();
    let source = NotifySource::new(format!("ws://{addr}"), NotifyTiming::default(), FAST_RETRY);
    let (_notifications, handle) = source.spawn(cancel.clone());

    for _ in 0..3 {
        timeout(Duration::from_secs(5), accepted.recv()).await.unwrap().unwrap();
    }

    cancel.cancel();
    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}
