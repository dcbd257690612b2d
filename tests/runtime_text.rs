//! Drives a text-mode session end to end against a local websocket server.

use futures_util::{SinkExt, StreamExt};
use parley::capture::WAV;
use parley::messages::Source;
use parley::ticker::SystemClock;
use parley::{
    ControllerConfig, Mode, RuntimeOptions, SessionController, SessionSnapshot, SessionStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

async fn wait_for<F>(rx: &mut watch::Receiver<SessionSnapshot>, mut pred: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if pred(&snap) {
                    return snap.clone();
                }
            }
            rx.changed().await.expect("controller stopped");
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await.expect("client hung up").expect("ws error") {
            Message::Text(t) => return serde_json::from_str(&t).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

#[tokio::test]
async fn text_turn_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let start = next_json(&mut ws).await;
        assert_eq!(start["type"], "start");
        assert_eq!(start["session_id"], "resume-1");

        let input = next_json(&mut ws).await;
        assert_eq!(input, json!({"type": "text_input", "text": "hi"}));

        for frame in [
            json!({"type": "assistant_start"}),
            json!({"type": "token", "text": "Hel"}),
            json!({"type": "token", "text": "lo"}),
            json!({"type": "done", "assistant_text": "Hello there"}),
        ] {
            ws.send(Message::Text(frame.to_string())).await.unwrap();
        }

        // client closes on disconnect
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let config = ControllerConfig {
                mode: Mode::Text,
                ..Default::default()
            };
            let controller = SessionController::new(
                config,
                Some("resume-1".into()),
                Arc::new(SystemClock::new()),
            );
            let handle = parley::spawn(
                controller,
                RuntimeOptions {
                    url: format!("ws://{}/ws/chat", addr),
                    input_device: None,
                    output_device: None,
                    volume: 1.0,
                    format: WAV,
                },
            );
            let mut rx = handle.subscribe();
            assert_eq!(handle.status(), SessionStatus::Disconnected);

            handle.connect();
            wait_for(&mut rx, |s| s.status == SessionStatus::Idle).await;

            handle.send_text_message("hi");
            let done = wait_for(&mut rx, |s| {
                s.status == SessionStatus::Idle && s.messages.len() == 2
            })
            .await;
            assert_eq!(done.messages[0].source, Source::User);
            assert_eq!(done.messages[0].text, "hi");
            assert_eq!(done.messages[1].source, Source::Assistant);
            assert_eq!(done.messages[1].text, "Hello there");
            assert_eq!(handle.messages(), done.messages);

            handle.disconnect();
            wait_for(&mut rx, |s| s.status == SessionStatus::Disconnected).await;
            handle.shutdown();
        })
        .await;

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not finish")
        .unwrap();
}

#[tokio::test]
async fn refused_connection_stays_disconnected() {
    // Bind then drop to get a port with nothing listening.
    let addr = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let controller = SessionController::new(
                ControllerConfig {
                    mode: Mode::Text,
                    ..Default::default()
                },
                None,
                Arc::new(SystemClock::new()),
            );
            let handle = parley::spawn(
                controller,
                RuntimeOptions {
                    url: format!("ws://{}/ws/chat", addr),
                    input_device: None,
                    output_device: None,
                    volume: 1.0,
                    format: WAV,
                },
            );
            handle.connect();
            handle.send_text_message("anyone there?");
            // give the connection attempt time to fail
            tokio::time::sleep(Duration::from_millis(300)).await;
            let snap = handle.snapshot();
            assert_eq!(snap.status, SessionStatus::Disconnected);
            assert!(snap.messages.is_empty());

            // retry is allowed once the failed attempt is reported
            handle.connect();
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(handle.status(), SessionStatus::Disconnected);
            handle.shutdown();
        })
        .await;
}
