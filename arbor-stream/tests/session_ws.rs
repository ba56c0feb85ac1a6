//! Session behavior against a scripted WebSocket server: subscribe
//! framing, normalization, reconnect with re-subscription.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use arbor_core::{BookDepth, MarketKind, MessagePayload, Pair, VenueId};
use arbor_stream::{SessionConfig, SessionEvent, VenueSession};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn snapshot_frame(seq: u64) -> String {
    serde_json::json!({
        "type": "book_snapshot", "market": "spot", "pair": "WETH/USDC",
        "seq": seq, "ts": 1_700_000_000_000i64,
        "bids": [["3000.5", "2"]],
        "asks": [["3001.0", "1"]]
    })
    .to_string()
}

fn delta_frame(seq: u64) -> String {
    serde_json::json!({
        "type": "book_delta", "market": "spot", "pair": "WETH/USDC",
        "seq": seq, "prev_seq": seq - 1, "ts": 1_700_000_000_100i64,
        "bids": [["3000.5", "0"]],
        "asks": []
    })
    .to_string()
}

/// Scripted server: every accepted connection reports the first frame
/// it receives, replies with a snapshot and a delta, then hangs up.
/// The last connection stays open.
async fn run_server(
    listener: TcpListener,
    frames_tx: mpsc::UnboundedSender<String>,
    drop_first: bool,
) {
    let mut connection = 0u32;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        connection += 1;
        let Ok(mut ws) = accept_async(stream).await else {
            continue;
        };
        // First inbound frame is the subscribe command.
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            let _ = frames_tx.send(text);
        }
        let _ = ws.send(Message::Text(snapshot_frame(100))).await;
        let _ = ws.send(Message::Text(delta_frame(101))).await;
        if drop_first && connection == 1 {
            let _ = ws.send(Message::Close(None)).await;
            continue;
        }
        // Keep the connection open until the test ends.
        while let Some(Ok(_)) = ws.next().await {}
    }
}

fn test_session(
    endpoint: String,
    cancel: CancellationToken,
) -> (
    VenueSession,
    mpsc::Receiver<arbor_core::NormalizedMessage>,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    let config = SessionConfig {
        endpoint,
        base_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        ..SessionConfig::new(VenueId::Dex, MarketKind::Spot)
    };
    let (out_tx, out_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = VenueSession::spawn(7, config, out_tx, events_tx, cancel);
    (session, out_rx, events_rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

#[tokio::test]
async fn session_subscribes_and_normalizes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_server(listener, frames_tx, false));

    let cancel = CancellationToken::new();
    let (session, mut out_rx, mut events_rx) = test_session(format!("ws://{addr}"), cancel.clone());
    session.subscribe(&[Pair::new("WETH", "USDC")], BookDepth::Twenty);

    assert!(matches!(
        next_event(&mut events_rx).await,
        SessionEvent::Connected { session_id: 7, .. }
    ));

    // The wire saw the venue-framed subscribe with the canonical pair.
    let frame = timeout(RECV_TIMEOUT, frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["action"], "subscribe");
    assert_eq!(value["channels"][0]["pair"], "WETH/USDC");
    assert_eq!(value["channels"][0]["depth"], 20);

    let snapshot = timeout(RECV_TIMEOUT, out_rx.recv()).await.unwrap().unwrap();
    assert_eq!(snapshot.header.venue, VenueId::Dex);
    assert_eq!(snapshot.header.venue_seq, 100);
    assert!(matches!(snapshot.payload, MessagePayload::BookSnapshot { .. }));

    let delta = timeout(RECV_TIMEOUT, out_rx.recv()).await.unwrap().unwrap();
    assert_eq!(delta.header.venue_seq, 101);
    let MessagePayload::BookDelta { prev_seq, .. } = delta.payload else {
        panic!("expected delta");
    };
    assert_eq!(prev_seq, Some(100));

    cancel.cancel();
}

#[tokio::test]
async fn session_reconnects_and_resubscribes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_server(listener, frames_tx, true));

    let cancel = CancellationToken::new();
    let (session, mut out_rx, mut events_rx) = test_session(format!("ws://{addr}"), cancel.clone());
    session.subscribe(&[Pair::new("WETH", "USDC")], BookDepth::Fifty);

    assert!(matches!(
        next_event(&mut events_rx).await,
        SessionEvent::Connected { .. }
    ));
    let first_subscribe = timeout(RECV_TIMEOUT, frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first_subscribe.contains("subscribe"));

    // Drain the first connection's two messages, then the server drops us.
    let _ = timeout(RECV_TIMEOUT, out_rx.recv()).await.unwrap().unwrap();
    let _ = timeout(RECV_TIMEOUT, out_rx.recv()).await.unwrap().unwrap();

    let mut saw_disconnect = false;
    let mut saw_reconnect = false;
    while !(saw_disconnect && saw_reconnect) {
        match next_event(&mut events_rx).await {
            SessionEvent::Disconnected { .. } => saw_disconnect = true,
            SessionEvent::Connected { .. } => {
                if saw_disconnect {
                    saw_reconnect = true;
                }
            }
            SessionEvent::Resynced { .. } => {}
        }
    }

    // The second connection received the replayed subscription before
    // Connected was surfaced.
    let second_subscribe = timeout(RECV_TIMEOUT, frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&second_subscribe).unwrap();
    assert_eq!(value["channels"][0]["pair"], "WETH/USDC");
    assert_eq!(value["channels"][0]["depth"], 50);

    // And the stream keeps flowing.
    let replayed = timeout(RECV_TIMEOUT, out_rx.recv()).await.unwrap().unwrap();
    assert_eq!(replayed.header.pair.as_str(), "WETH/USDC");

    cancel.cancel();
}
