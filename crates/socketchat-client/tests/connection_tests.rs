//! Integration tests for the connection manager
//!
//! Each test runs a scripted server on an ephemeral loopback port and drives a
//! `SocketClient` against it, checking what reaches listeners and what reaches
//! the wire.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use socketchat_client::{ClientConfig, MessageListener, SocketClient};
use socketchat_core::{
    wire::PROTOCOL_VERSION, ChatError, ClientSendMessage, ConnectionState, ErrorMessage,
    FrameBuffer, Message, RecallMessage, ServerSendMessage, TimeSource, Timestamp, TransportError,
    Uuid, WireFormat,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

async fn mock_server() -> (TcpListener, ClientConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ClientConfig::default()
        .with_server_addr(listener.local_addr().unwrap().to_string())
        .with_username("tester");
    (listener, config)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    timeout(WAIT, listener.accept())
        .await
        .expect("client should connect within timeout")
        .unwrap()
        .0
}

/// Listener forwarding every message into a channel
fn channel_listener() -> (Arc<dyn MessageListener>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |message: &Message| {
        let _ = tx.send(message.clone());
    };
    (Arc::new(listener), rx)
}

async fn next_received(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(WAIT, rx.recv())
        .await
        .expect("message should arrive within timeout")
        .expect("listener channel closed")
}

/// Read the next complete message the client wrote
async fn read_from_client(stream: &mut TcpStream, frames: &mut FrameBuffer) -> Message {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(message) = frames.next_message().unwrap() {
            return message;
        }
        let n = timeout(WAIT, stream.read(&mut chunk))
            .await
            .expect("client frame should arrive within timeout")
            .unwrap();
        assert!(n > 0, "client closed the connection");
        frames.extend(&chunk[..n]);
    }
}

async fn send_to_client(stream: &mut TcpStream, message: impl Into<Message>) {
    let frame = WireFormat::default().encode(&message.into()).unwrap();
    stream.write_all(&frame).await.unwrap();
}

fn raw_frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = ((2 + body.len()) as u32).to_be_bytes().to_vec();
    frame.push(PROTOCOL_VERSION);
    frame.push(tag);
    frame.extend_from_slice(body);
    frame
}

/// Clock replaying fixed readings, then standing at zero
struct ScriptedClock {
    readings: Mutex<VecDeque<i64>>,
}

impl ScriptedClock {
    fn new(readings: &[i64]) -> Self {
        Self {
            readings: Mutex::new(readings.iter().copied().collect()),
        }
    }
}

impl TimeSource for ScriptedClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.readings.lock().unwrap().pop_front().unwrap_or(0))
    }
}

async fn wait_until_closed(client: &SocketClient) -> ConnectionState {
    let mut states = client.state_changes();
    let state = timeout(WAIT, states.wait_for(|state| state.is_closed()))
        .await
        .expect("connection should close within timeout")
        .unwrap()
        .clone();
    state
}

// ----------------------------------------------------------------------------
// Delivery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_echo_round_trip() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();
    let (listener, mut received) = channel_listener();
    client.set_message_listener(listener);

    client.start_listening().await.unwrap();
    assert!(client.is_active());
    let mut stream = accept(&server).await;

    let outgoing = ClientSendMessage::new("hello");
    client.write_to_server(&outgoing).await.unwrap();

    let mut frames = FrameBuffer::default();
    let Message::ClientSend(sent) = read_from_client(&mut stream, &mut frames).await else {
        panic!("expected a client send message");
    };
    assert_eq!(sent, outgoing);
    send_to_client(&mut stream, ServerSendMessage::echo_of(&sent, client.username())).await;

    match next_received(&mut received).await {
        Message::ServerSend(echo) => {
            assert_eq!(echo.id(), outgoing.id());
            assert_eq!(echo.text(), "hello");
            assert_eq!(echo.sender_username(), "tester");
        }
        other => panic!("expected server echo, got {:?}", other),
    }

    let stats = client.stats();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.messages_received, 1);
}

#[tokio::test]
async fn test_messages_delivered_in_arrival_order() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();
    let (listener, mut received) = channel_listener();
    client.set_message_listener(listener);
    let mut subscription = client.subscribe().unwrap();

    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;

    // One write carrying several frames, the last one split across writes
    let wire = WireFormat::default();
    let mut bytes = Vec::new();
    for n in 0..5u128 {
        bytes.extend(wire.encode(&RecallMessage::new(Uuid::from_u128(n)).into()).unwrap());
    }
    let (head, tail) = bytes.split_at(bytes.len() - 3);
    stream.write_all(head).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    stream.write_all(tail).await.unwrap();

    for n in 0..5u128 {
        let expected = Message::from(RecallMessage::new(Uuid::from_u128(n)));
        assert_eq!(next_received(&mut received).await, expected);
        let via_subscription = timeout(WAIT, subscription.recv()).await.unwrap();
        assert_eq!(via_subscription, Some(expected));
    }
}

#[tokio::test]
async fn test_unknown_message_type_is_skipped() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();
    let (listener, mut received) = channel_listener();
    client.set_message_listener(listener);

    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;

    stream.write_all(&raw_frame(99, b"from the future")).await.unwrap();
    send_to_client(&mut stream, ErrorMessage::new("after unknown")).await;

    assert_eq!(
        next_received(&mut received).await,
        Message::from(ErrorMessage::new("after unknown"))
    );
    assert!(client.is_active());
    assert_eq!(client.stats().frames_rejected, 1);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (server, config) = mock_server().await;
    let config = ClientConfig {
        max_frame_size: 1024,
        ..config
    };
    let client = SocketClient::new(config).unwrap();
    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;

    stream.write_all(&(64 * 1024u32).to_be_bytes()).await.unwrap();

    let state = wait_until_closed(&client).await;
    assert!(state.close_reason().is_some());
    assert!(client.last_error().is_some());
}

#[tokio::test]
async fn test_listener_swap_mid_stream() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();
    let (first, mut first_rx) = channel_listener();
    let (second, mut second_rx) = channel_listener();
    client.set_message_listener(first);

    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;
    let (swapped_tx, swapped_rx) = oneshot::channel::<()>();

    let server_task = tokio::spawn(async move {
        send_to_client(&mut stream, ErrorMessage::new("one")).await;
        swapped_rx.await.unwrap();
        send_to_client(&mut stream, ErrorMessage::new("two")).await;
        stream
    });

    assert_eq!(
        next_received(&mut first_rx).await,
        Message::from(ErrorMessage::new("one"))
    );
    client.set_message_listener(second);
    swapped_tx.send(()).unwrap();

    assert_eq!(
        next_received(&mut second_rx).await,
        Message::from(ErrorMessage::new("two"))
    );
    assert!(first_rx.try_recv().is_err());
    let _stream = server_task.await.unwrap();
}

// ----------------------------------------------------------------------------
// Writes
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_composed_timestamps_never_decrease_on_the_wire() {
    let (server, config) = mock_server().await;
    let clock = Arc::new(ScriptedClock::new(&[5_000, 7_000, 3_000, 6_000, 9_000]));
    let client = SocketClient::new(config).unwrap().with_time_source(clock);
    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;

    for n in 0..5 {
        let message = client.compose(format!("tick {}", n));
        client.write_to_server(&message).await.unwrap();
    }

    let mut frames = FrameBuffer::default();
    let mut stamps = Vec::new();
    for n in 0..5 {
        match read_from_client(&mut stream, &mut frames).await {
            Message::ClientSend(message) => {
                assert_eq!(message.text(), format!("tick {}", n));
                stamps.push(message.timestamp().as_millis());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    // The wall clock stepped back to 3000 and 6000; the sender never does
    assert_eq!(stamps, vec![5_000, 7_000, 7_000, 7_000, 9_000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_never_interleave() {
    let (server, config) = mock_server().await;
    let client = Arc::new(SocketClient::new(config).unwrap());
    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;

    let messages: Vec<ClientSendMessage> = (0..32)
        .map(|n| ClientSendMessage::new(format!("message {} {}", n, "x".repeat(n * 97))))
        .collect();

    let writes = messages.iter().cloned().map(|message| {
        let client = client.clone();
        tokio::spawn(async move { client.write_to_server(&message).await })
    });
    for result in join_all(writes).await {
        result.unwrap().unwrap();
    }

    let mut frames = FrameBuffer::default();
    let mut seen = HashSet::new();
    for _ in 0..messages.len() {
        match read_from_client(&mut stream, &mut frames).await {
            Message::ClientSend(message) => {
                assert!(messages.contains(&message));
                seen.insert(message.id());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert_eq!(seen.len(), messages.len());
    assert_eq!(client.stats().messages_sent, 32);
}

#[tokio::test]
async fn test_write_before_start_is_not_connected() {
    let (_server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();

    let err = client
        .write_to_server(&ClientSendMessage::new("too early"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Transport(TransportError::NotConnected)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_server_eof_closes_connection() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();
    client.start_listening().await.unwrap();
    drop(accept(&server).await);

    let state = wait_until_closed(&client).await;
    assert!(state.close_reason().is_some());

    let err = client
        .write_to_server(&ClientSendMessage::new("too late"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::Transport(TransportError::ConnectionClosed { reason: Some(_) })
    ));
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_start_listening_is_idempotent() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();

    let (first, second) = tokio::join!(client.start_listening(), client.start_listening());
    first.unwrap();
    second.unwrap();
    client.start_listening().await.unwrap();

    let _stream = accept(&server).await;
    assert!(
        timeout(Duration::from_millis(200), server.accept()).await.is_err(),
        "only one socket should be opened"
    );
}

#[tokio::test]
async fn test_no_callbacks_after_disconnect() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();
    let (listener, mut received) = channel_listener();
    client.set_message_listener(listener);

    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;

    send_to_client(&mut stream, ErrorMessage::new("before")).await;
    next_received(&mut received).await;

    client.disconnect();
    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Closed { reason: None });

    // The socket is shut down promptly
    let mut chunk = [0u8; 16];
    let n = timeout(WAIT, stream.read(&mut chunk))
        .await
        .expect("client should close the socket")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let frame = WireFormat::default()
        .encode(&ErrorMessage::new("after").into())
        .unwrap();
    let _ = stream.write_all(&frame).await;
    sleep(Duration::from_millis(100)).await;
    assert!(received.try_recv().is_err());
    assert!(client.last_error().is_none());
}

#[tokio::test]
async fn test_disconnect_from_inside_callback() {
    let (server, config) = mock_server().await;
    let client = Arc::new(SocketClient::new(config).unwrap());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let handle: Weak<SocketClient> = Arc::downgrade(&client);
    client.set_message_listener(Arc::new(move |_: &Message| {
        if let Some(client) = handle.upgrade() {
            client.disconnect();
        }
        let _ = done_tx.send(());
    }));

    client.start_listening().await.unwrap();
    let mut stream = accept(&server).await;
    send_to_client(&mut stream, ErrorMessage::new("first")).await;
    send_to_client(&mut stream, ErrorMessage::new("second")).await;

    timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Closed { reason: None });

    sleep(Duration::from_millis(100)).await;
    assert!(done_rx.try_recv().is_err(), "no callback after disconnect");
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let (server, config) = mock_server().await;
    let client = SocketClient::new(config).unwrap();
    let (listener, mut received) = channel_listener();
    client.set_message_listener(listener);

    client.start_listening().await.unwrap();
    drop(accept(&server).await);
    wait_until_closed(&client).await;

    client.start_listening().await.unwrap();
    assert!(client.is_active());
    let mut stream = accept(&server).await;

    send_to_client(&mut stream, ErrorMessage::new("welcome back")).await;
    assert_eq!(
        next_received(&mut received).await,
        Message::from(ErrorMessage::new("welcome back"))
    );
    assert!(client.last_error().is_none());
}

#[tokio::test]
async fn test_connect_failure_reports_reason() {
    let (server, config) = mock_server().await;
    drop(server);
    let client = SocketClient::new(config).unwrap();

    let err = client.start_listening().await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::Transport(TransportError::ConnectFailed { .. })
    ));
    assert!(client.state().is_closed());
    assert!(client.last_error().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_racing_frame_flood() {
    let (server, config) = mock_server().await;
    let wire = WireFormat::default();
    let mut burst = Vec::new();
    for _ in 0..64 {
        burst.extend(wire.encode(&ErrorMessage::new("flood").into()).unwrap());
    }
    let burst = Arc::new(burst);

    for round in 0..200 {
        let client = Arc::new(SocketClient::new(config.clone()).unwrap());
        let returned = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let listener = {
            let returned = returned.clone();
            let late = late.clone();
            move |_: &Message| {
                if returned.load(Ordering::SeqCst) {
                    late.fetch_add(1, Ordering::SeqCst);
                }
                let _ = started_tx.send(());
            }
        };
        client.set_message_listener(Arc::new(listener));
        client.start_listening().await.unwrap();

        let mut stream = accept(&server).await;
        let burst = burst.clone();
        let flood = tokio::spawn(async move {
            while stream.write_all(&burst).await.is_ok() {}
        });

        timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();
        let disconnecting = client.clone();
        let flag = returned.clone();
        tokio::task::spawn_blocking(move || {
            disconnecting.disconnect();
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();

        sleep(Duration::from_millis(5)).await;
        flood.abort();
        assert_eq!(
            late.load(Ordering::SeqCst),
            0,
            "callback started after disconnect returned in round {}",
            round
        );
    }
}
