use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use attn_relay::{
    EventTemplate, Error, KeysSigner, PublishOptions, Publisher, RelayEndpoint, Session,
    SessionConfig, Signer, WsTransport, KIND_BLOCK, KIND_MATCH,
};

const SECRET: &str = "6b911fd37cdf5c81d4c0adb1ab7fa822ed253ab0ad9aa18d77257c88b29b718e";

type Socket = WebSocketStream<tokio::net::TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> Socket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Socket) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(_) => panic!("client closed early"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_publish_with_auth_over_websocket() {
    let (listener, url) = bind().await;

    let relay = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send(&mut ws, json!(["AUTH", "challenge-1"])).await;

        let auth = recv(&mut ws).await;
        assert_eq!(auth[0], "AUTH");
        assert_eq!(auth[1]["kind"], 22242);
        assert_eq!(auth[1]["tags"][1], json!(["challenge", "challenge-1"]));
        send(&mut ws, json!(["OK", auth[1]["id"], true, ""])).await;

        let event = recv(&mut ws).await;
        assert_eq!(event[0], "EVENT");
        send(&mut ws, json!(["OK", event[1]["id"], true, ""])).await;
        event[1]["id"].as_str().unwrap().to_string()
    });

    let signer = Arc::new(KeysSigner::parse(SECRET).unwrap());
    let publisher = Publisher::new(Arc::new(WsTransport), signer.clone());
    let event = signer
        .sign(EventTemplate::new(KIND_MATCH, "{}"))
        .await
        .unwrap();

    let result = publisher
        .publish(&event, &url, &PublishOptions::default().with_auth())
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(relay.await.unwrap(), event.id);
}

#[tokio::test]
async fn test_session_receives_blocks_over_websocket() {
    let (listener, url) = bind().await;

    let relay = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut blocks_id = None;
        for _ in 0..4 {
            let req = recv(&mut ws).await;
            assert_eq!(req[0], "REQ");
            if req[2]["kinds"] == json!([KIND_BLOCK]) {
                blocks_id = Some(req[1].clone());
            }
        }
        let blocks_id = blocks_id.unwrap();
        let block = json!({
            "id": "block-1",
            "pubkey": "node",
            "created_at": 1,
            "kind": KIND_BLOCK,
            "tags": [["t", "880000"]],
            "content": json!({ "height": 880000, "hash": "00000000abc" }).to_string(),
            "sig": "sig"
        });
        send(&mut ws, json!(["EVENT", blocks_id, block])).await;
        send(&mut ws, json!(["EOSE", blocks_id])).await;

        // Hold the socket until the client closes it.
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    let config = SessionConfig::new(vec![RelayEndpoint::new(url)], SECRET);
    let mut session = Session::new(config, Arc::new(WsTransport)).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.hooks().on_new_block(move |ctx| {
        let _ = tx.send((ctx.block_height, ctx.block_hash.clone()));
    });

    session.connect().await.unwrap();
    assert!(session.connected());

    let (height, hash) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(height, 880000);
    assert_eq!(hash.as_deref(), Some("00000000abc"));

    session.disconnect(None).await;
    assert!(!session.connected());
    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_refused_connection_fails_connect() {
    let (listener, url) = bind().await;
    drop(listener);

    let mut config = SessionConfig::new(vec![RelayEndpoint::new(url)], SECRET);
    config.auto_reconnect = false;
    let mut session = Session::new(config, Arc::new(WsTransport)).unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert!(!session.connected());
}
