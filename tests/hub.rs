use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use voice_bridge::hub::connection::READY_TEXT;
use voice_bridge::prelude::*;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

async fn started_hub() -> (BroadcastHub, SocketAddr) {
    let hub = BroadcastHub::new(Context::new(), Reconnector::new(Duration::from_millis(20)));
    let addr = hub.start(0, BindScope::Local).await.unwrap();
    (hub, addr)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    ws
}

async fn wait_for_connections(hub: &BroadcastHub, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while hub.connection_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return text.as_str().to_string();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = tokio::time::timeout(Duration::from_millis(150), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {:?}", next);
}

#[tokio::test]
async fn settings_update_reaches_every_client_exactly_once() {
    let (hub, addr) = started_hub().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_connections(&hub, 2).await;

    hub.notify(Notification::UserVoiceStateUpdate {
        mute: true,
        deaf: false,
    })
    .await;

    let expected = r#"{"cmd":"USER_VOICE_STATE_UPDATE","mute":true,"deaf":false}"#;
    assert_eq!(next_text(&mut a).await, expected);
    assert_eq!(next_text(&mut b).await, expected);
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;

    hub.stop().await;
}

#[tokio::test]
async fn initial_state_before_settings_is_unavailable_and_private() {
    let (hub, addr) = started_hub().await;
    let mut asking = connect(addr).await;
    let mut watching = connect(addr).await;
    wait_for_connections(&hub, 2).await;

    asking
        .send(Message::Text("getInitialState".into()))
        .await
        .unwrap();

    assert_eq!(next_text(&mut asking).await, r#"{"cmd":"STATE_UNAVAILABLE"}"#);
    assert_silent(&mut watching).await;

    hub.stop().await;
}

#[tokio::test]
async fn unknown_and_binary_messages_keep_the_connection_open() {
    let (hub, addr) = started_hub().await;
    let mut ws = connect(addr).await;
    wait_for_connections(&hub, 1).await;

    ws.send(Message::Text("dance".into())).await.unwrap();
    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    ws.send(Message::Text("mute".into())).await.unwrap();
    ws.send(Message::Text("getInitialState".into())).await.unwrap();

    assert_eq!(next_text(&mut ws).await, r#"{"cmd":"STATE_UNAVAILABLE"}"#);
    assert_eq!(hub.connection_count().await, 1);

    hub.stop().await;
}

#[tokio::test]
async fn closing_client_is_deregistered() {
    let (hub, addr) = started_hub().await;
    let mut ws = connect(addr).await;
    wait_for_connections(&hub, 1).await;

    ws.close(None).await.unwrap();
    wait_for_connections(&hub, 0).await;
    assert_eq!(hub.broadcast(&Notification::LeftChannel).await, 0);

    hub.stop().await;
}

#[tokio::test]
async fn stop_sends_normal_closure() {
    let (hub, addr) = started_hub().await;
    let mut ws = connect(addr).await;
    wait_for_connections(&hub, 1).await;

    hub.stop().await;

    let msg = tokio::time::timeout(WAIT, ws.next())
        .await
        .expect("no close frame")
        .expect("stream ended")
        .expect("socket error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {:?}", other),
    }
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn plain_http_gets_readiness_text() {
    let (hub, addr) = started_hub().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("text/plain"));
    assert!(response.ends_with(READY_TEXT));
    assert_eq!(hub.connection_count().await, 0);

    hub.stop().await;
}

#[tokio::test]
async fn restart_after_stop_binds_again() {
    let (hub, _) = started_hub().await;
    hub.stop().await;

    let addr = hub.start(0, BindScope::Local).await.unwrap();
    let _ws = connect(addr).await;
    wait_for_connections(&hub, 1).await;
    hub.stop().await;
}

#[tokio::test]
async fn stop_does_not_wait_on_idle_sockets() {
    let (hub, addr) = started_hub().await;

    let mut idle = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    hub.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "stop took {:?}",
        started.elapsed()
    );

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_millis(500), idle.read(&mut buf))
        .await
        .expect("idle socket left open after stop");
    assert!(matches!(read, Ok(0) | Err(_)));
}
