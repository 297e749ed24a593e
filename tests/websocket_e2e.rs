//! End-to-end runs over real sockets: two relay instances with their public
//! and internal listeners on loopback, sharing one in-memory directory.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header};
use serde_json::{json, Value};
use session_relay::{
    api,
    auth::{CredentialGate, Environment, StaticSecretStore, TokenVerifier},
    directory::{OwnerRecord, SessionDirectory},
    routing::HttpForwarder,
    store::MemoryStore,
    RelayOptions, SessionLifecycle,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KEY: &[u8] = b"e2e-key";

fn token() -> String {
    let exp = chrono::Utc::now().timestamp() + 600;
    jsonwebtoken::encode(
        &Header::default(),
        &json!({ "sub": "e2e", "exp": exp }),
        &EncodingKey::from_secret(KEY),
    )
    .unwrap()
}

struct Instance {
    relay: Arc<SessionLifecycle>,
    public: SocketAddr,
}

async fn start(id: &str, store: &Arc<MemoryStore>) -> Instance {
    let internal_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let internal = internal_listener.local_addr().unwrap();
    let public_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let public = public_listener.local_addr().unwrap();

    let gate = CredentialGate::new(
        TokenVerifier::new(None).with_hmac_secret(Environment::Dev, KEY),
        Arc::new(StaticSecretStore::new(None)),
    );
    let relay = Arc::new(SessionLifecycle::new(
        gate,
        SessionDirectory::new(store.clone()),
        Arc::new(HttpForwarder::new(Duration::from_secs(2))),
        RelayOptions::new(OwnerRecord::new(id, "127.0.0.1", internal.port())),
    ));

    let router = api::internal_router(relay.clone());
    tokio::spawn(async move { axum::serve(internal_listener, router).await });
    let router = api::public_router(relay.clone());
    tokio::spawn(async move { axum::serve(public_listener, router).await });

    Instance { relay, public }
}

async fn connect(instance: &Instance, token: &str) -> Client {
    let url = format!(
        "ws://{}/ws?env=DEV&Authorization=Bearer%20{}",
        instance.public, token
    );
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn next_frame(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(client: &mut Client, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data });
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn register(client: &mut Client, session_id: &str) {
    send(client, "register_session", json!({ "session_id": session_id })).await;
    let frame = next_frame(client).await;
    assert_eq!(frame["event"], "session_registered");
    assert_eq!(frame["data"]["session_id"], session_id);
}

#[tokio::test]
async fn notification_posted_to_one_instance_reaches_client_on_the_other() {
    let store = Arc::new(MemoryStore::new());
    let a = start("server_a", &store).await;
    let b = start("server_b", &store).await;

    let token = token();
    let mut client = connect(&b, &token).await;
    register(&mut client, "e2e-1").await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/notify", a.public))
        .bearer_auth(&token)
        .json(&json!({ "session_id": "e2e-1", "message": "build finished" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");

    let frame = next_frame(&mut client).await;
    assert_eq!(frame["event"], "notification");
    assert_eq!(frame["data"]["message"], "build finished");
    assert!(a.relay.registry.is_empty());
    assert!(b.relay.registry.contains("e2e-1"));
}

#[tokio::test]
async fn ping_gets_pong_over_the_socket() {
    let store = Arc::new(MemoryStore::new());
    let a = start("server_a", &store).await;

    let mut client = connect(&a, &token()).await;
    register(&mut client, "e2e-2").await;
    send(&mut client, "ping", json!({ "session_id": "e2e-2", "timestamp": 42 })).await;

    let frame = next_frame(&mut client).await;
    assert_eq!(frame["event"], "pong");
    assert_eq!(frame["data"]["timestamp"], 42);
}

#[tokio::test]
async fn closing_the_socket_purges_the_session() {
    let store = Arc::new(MemoryStore::new());
    let a = start("server_a", &store).await;

    let mut client = connect(&a, &token()).await;
    register(&mut client, "e2e-3").await;
    assert!(!store.is_empty());

    client.close(None).await.unwrap();
    for _ in 0..100 {
        if store.is_empty() && a.relay.registry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session was not cleaned up after the socket closed");
}

#[tokio::test]
async fn handshake_without_credentials_is_refused_before_upgrade() {
    let store = Arc::new(MemoryStore::new());
    let a = start("server_a", &store).await;

    let err = connect_async(format!("ws://{}/ws?env=DEV", a.public))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
    assert!(a.relay.registry.is_empty());
    assert!(store.is_empty());
}
