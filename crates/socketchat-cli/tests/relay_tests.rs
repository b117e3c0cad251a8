//! Integration tests for the development relay
//!
//! Real `SocketClient`s connect to a relay on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use socketchat_cli::{Relay, RelayConfig};
use socketchat_client::{ClientConfig, Message, SocketClient};
use socketchat_core::{ClientSendMessage, FrameBuffer, RecallMessage, Uuid, WireFormat};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

async fn start_relay() -> (String, JoinHandle<()>) {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..RelayConfig::default()
    };
    let relay = Relay::bind(&config).await.unwrap();
    let addr = relay.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let _ = relay.run().await;
    });
    (addr, handle)
}

async fn connected_client(
    addr: &str,
    username: &str,
) -> (SocketClient, mpsc::UnboundedReceiver<Message>) {
    let config = ClientConfig::default()
        .with_server_addr(addr)
        .with_username(username);
    let client = SocketClient::new(config).unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    client.set_message_listener(Arc::new(move |message: &Message| {
        let _ = tx.send(message.clone());
    }));
    client.start_listening().await.unwrap();
    (client, rx)
}

async fn next_received(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(WAIT, rx.recv())
        .await
        .expect("message should arrive within timeout")
        .expect("listener channel closed")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_relay_broadcasts_echo_to_every_peer() {
    let (addr, relay) = start_relay().await;
    let (alice, mut alice_rx) = connected_client(&addr, "alice").await;
    let (_bob, mut bob_rx) = connected_client(&addr, "bob").await;

    // Let the relay register both peers before the first message
    tokio::time::sleep(Duration::from_millis(50)).await;

    let message = ClientSendMessage::new("hello everyone");
    alice.write_to_server(&message).await.unwrap();

    for rx in [&mut alice_rx, &mut bob_rx] {
        match next_received(rx).await {
            Message::ServerSend(echo) => {
                assert_eq!(echo.id(), message.id());
                assert_eq!(echo.timestamp(), message.timestamp());
                assert_eq!(echo.text(), "hello everyone");
                assert!(echo.sender_username().starts_with("peer-"));
            }
            other => panic!("expected echo, got {:?}", other),
        }
    }

    relay.abort();
}

#[tokio::test]
async fn test_relay_rejects_unexpected_variants() {
    let (addr, relay) = start_relay().await;
    let wire = WireFormat::default();

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let frame = wire
        .encode(&RecallMessage::new(Uuid::from_u128(1)).into())
        .unwrap();
    stream.write_all(&frame).await.unwrap();

    let mut frames = FrameBuffer::new(wire);
    let mut chunk = [0u8; 512];
    let reply = loop {
        if let Some(message) = frames.next_message().unwrap() {
            break message;
        }
        let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
        assert!(n > 0, "relay closed the connection");
        frames.extend(&chunk[..n]);
    };

    match reply {
        Message::Error(error) => assert!(error.error_message().contains("Recall")),
        other => panic!("expected error reply, got {:?}", other),
    }

    relay.abort();
}

#[tokio::test]
async fn test_peer_disconnect_does_not_affect_others() {
    let (addr, relay) = start_relay().await;
    let (alice, mut alice_rx) = connected_client(&addr, "alice").await;
    let (bob, _bob_rx) = connected_client(&addr, "bob").await;

    bob.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice
        .write_to_server(&ClientSendMessage::new("still here"))
        .await
        .unwrap();
    assert!(matches!(
        next_received(&mut alice_rx).await,
        Message::ServerSend(_)
    ));
    assert!(alice.is_active());

    relay.abort();
}

#[tokio::test]
async fn test_stopping_relay_closes_peer_connections() {
    let (addr, relay) = start_relay().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.abort();
    assert!(relay.await.unwrap_err().is_cancelled());

    let mut chunk = [0u8; 16];
    let n = timeout(WAIT, stream.read(&mut chunk))
        .await
        .expect("peer connection should close with the relay")
        .unwrap_or(0);
    assert_eq!(n, 0);
}
