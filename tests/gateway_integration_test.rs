//! End-to-end tests over a real socket.
//!
//! Each test starts a gateway on an ephemeral loopback port backed by the
//! in-memory bridge and talks to it with a tokio-tungstenite client.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use bridgegate::bridge::convert::CommandConverter;
use bridgegate::bridge::memory::MemoryBridge;
use bridgegate::bridge::Attachment;
use bridgegate::config::{ConfigStore, GatewayConfig};
use bridgegate::gateway::cipher::decrypt;
use bridgegate::gateway::{Collaborators, GatewayContext, GatewayServer};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PASSWORD: &str = "s3cret pass";

struct TestGateway {
    server: GatewayServer,
    addr: SocketAddr,
    bridge: Arc<MemoryBridge>,
    dir: tempfile::TempDir,
}

async fn start_gateway(encrypt: bool) -> TestGateway {
    bridgegate::logging::init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        socket_port: 0,
        password: PASSWORD.to_string(),
        encrypt_coms: encrypt,
        data_dir: Some(dir.path().to_path_buf()),
        ..GatewayConfig::default()
    };
    let bridge = Arc::new(MemoryBridge::new());
    let collaborators =
        Collaborators::in_memory(bridge.clone(), Arc::new(CommandConverter::new("ffmpeg")));
    let ctx = GatewayContext::new(Arc::new(ConfigStore::new(config)), collaborators)
        .await
        .unwrap();
    let server = GatewayServer::new(ctx).with_bind_ip(Ipv4Addr::LOCALHOST.into());
    let addr = server.start().await.unwrap();
    TestGateway {
        server,
        addr,
        bridge,
        dir,
    }
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/?{}", addr, query))
        .await
        .expect("websocket connect failed");
    ws
}

async fn connect_authed(addr: SocketAddr) -> Client {
    connect(addr, "password=s3cret%20pass").await
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn next_message(ws: &mut Client) -> Message {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("socket error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

async fn next_json(ws: &mut Client) -> Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

/// Round-trip one acked request. Also proves the connection is registered.
async fn request(ws: &mut Client, event: &str, data: Value, ack: u64) -> Value {
    send(ws, json!({"event": event, "data": data, "ack": ack})).await;
    let frame = next_json(ws).await;
    assert_eq!(frame["ack"], ack);
    frame["data"].clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_password_is_closed() {
    let gw = start_gateway(false).await;
    let mut ws = connect(gw.addr, "password=nope").await;
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {:?}", other),
    }
    gw.server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_guid_param_authenticates() {
    let gw = start_gateway(false).await;
    let mut ws = connect(gw.addr, "guid=s3cret%20pass").await;
    let envelope = request(&mut ws, "get-chats", Value::Null, 1).await;
    assert_eq!(envelope["status"], 200);
    gw.server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ack_and_channel_replies() {
    let gw = start_gateway(false).await;
    let mut ws = connect_authed(gw.addr).await;

    let envelope = request(&mut ws, "get-chats", json!({}), 7).await;
    assert_eq!(envelope["status"], 200);
    assert_eq!(envelope["message"], "Success");
    assert_eq!(envelope["data"], json!([]));
    assert_eq!(envelope["encrypted"], false);

    // No ack: the client error comes back as an `error` event.
    send(&mut ws, json!({"event": "get-chat", "data": {}})).await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "error");
    assert_eq!(frame["data"]["status"], 400);
    assert_eq!(frame["data"]["error"]["type"], "Validation Error");
    assert_eq!(frame["data"]["error"]["message"], "No chat GUID provided");

    gw.server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encrypted_replies_except_attachment_chunks() {
    let gw = start_gateway(true).await;
    let path = gw.dir.path().join("photo.jpg");
    std::fs::write(&path, b"jpeg bytes").unwrap();
    gw.bridge.insert_attachment(Attachment {
        guid: "att-1".to_string(),
        uti: Some("public.jpeg".to_string()),
        mime_type: Some("image/jpeg".to_string()),
        transfer_name: "photo.jpg".to_string(),
        file_path: path,
        total_bytes: 10,
        blurhash: None,
    });
    let mut ws = connect_authed(gw.addr).await;

    let envelope = request(&mut ws, "get-server-config", Value::Null, 1).await;
    assert_eq!(envelope["encrypted"], true);
    let plain = decrypt(envelope["data"].as_str().unwrap(), PASSWORD).unwrap();
    let config: Value = serde_json::from_str(&plain).unwrap();
    assert_eq!(config["encrypt_coms"], true);
    assert!(config.get("password").is_none());

    let envelope = request(
        &mut ws,
        "get-attachment-chunk",
        json!({"identifier": "att-1", "start": 0, "chunkSize": 4}),
        2,
    )
    .await;
    assert_eq!(envelope["encrypted"], false);
    assert_eq!(envelope["data"], "anBlZw==");

    gw.server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_status_broadcast_reaches_all_clients() {
    let gw = start_gateway(false).await;
    let mut a = connect_authed(gw.addr).await;
    let mut b = connect_authed(gw.addr).await;
    request(&mut a, "get-chats", Value::Null, 1).await;
    request(&mut b, "get-chats", Value::Null, 1).await;

    send(
        &mut a,
        json!({
            "event": "toggle-chat-read-status",
            "data": {"chatGuid": "iMessage;-;+15550001111", "status": false}
        }),
    )
    .await;

    for ws in [&mut a, &mut b] {
        let frame = next_json(ws).await;
        assert_eq!(frame["event"], "chat-read-status-changed");
        assert_eq!(frame["data"]["chatGuid"], "iMessage;-;+15550001111");
        assert_eq!(frame["data"]["status"], false);
    }

    gw.server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_closes_clients_and_serves_again() {
    let gw = start_gateway(false).await;
    let mut ws = connect_authed(gw.addr).await;
    request(&mut ws, "get-chats", Value::Null, 1).await;

    let addr = gw.server.restart().await.unwrap();
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1012),
        other => panic!("expected close frame, got {:?}", other),
    }

    let mut again = connect_authed(addr).await;
    let envelope = request(&mut again, "get-chats", Value::Null, 2).await;
    assert_eq!(envelope["status"], 200);

    gw.server.stop().await;
}
