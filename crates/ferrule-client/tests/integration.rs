//! End-to-end tests: a real channel on a temp-dir socket, driven
//! through the typed client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use ferrule_client::{Client, ClientError};
use ferrule_core::proto::{CMD_INVOKE, HANDSHAKE_MAGIC, ORDER_BIG};
use ferrule_core::{Event, InvokeReply, InvokeRequest, Message};
use ferrule_test_utils::channel::{open_test_channel, open_test_channel_with};
use ferrule_test_utils::tracing_setup::init_test_tracing;

/// Give the server a beat to apply listener-side state (mask updates
/// carry no acknowledgement).
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn payload(bytes: &'static [u8]) -> Message {
    let mut msg = Message::new();
    msg.push(Bytes::from_static(bytes));
    msg
}

#[tokio::test]
async fn test_ping_round_trip() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("ping");
    let mut client = Client::connect(channel.socket_path()).await.unwrap();
    client.ping(0xDEAD_BEEF).await.unwrap();
    client.ping(0).await.unwrap();
    channel.shutdown();
}

#[tokio::test]
async fn test_invoke_scenario() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("invoke");

    let calls = Arc::new(AtomicU32::new(0));
    let calls_handler = Arc::clone(&calls);
    channel
        .handlers()
        .add("svcA", 2, move |req: InvokeRequest| {
            let calls = Arc::clone(&calls_handler);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut reply = InvokeReply::with_output(req.args);
                reply.result = req.id as i32;
                reply
            }
        })
        .unwrap();

    let mut client = Client::connect(channel.socket_path()).await.unwrap();

    // Valid service ID: handler runs, result and payload come back.
    let args = payload(b"ping-pong");
    let reply = client.invoke("svcA", 1, &args).await.unwrap();
    assert_eq!(reply.result, 1);
    assert_eq!(reply.output, args);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Out-of-range service ID: distinguished response, handler not
    // called, invalid counter bumped.
    let err = client.invoke("svcA", 5, &args).await.unwrap_err();
    assert!(matches!(err, ClientError::NoSuchService(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = channel.handlers().stats("svcA").unwrap();
    assert_eq!(stats.invalid, 1);
    assert_eq!(stats.succeeded, 1);

    // Unknown name: same distinguished response.
    let err = client.invoke("ghost", 0, &args).await.unwrap_err();
    assert!(matches!(err, ClientError::NoSuchService(_)));

    // The session survived all of it.
    client.ping(7).await.unwrap();
    channel.shutdown();
}

#[tokio::test]
async fn test_fatal_result_suppresses_output() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("fatal");
    channel
        .handlers()
        .add("boom", 1, |_req: InvokeRequest| async {
            InvokeReply::fatal()
        })
        .unwrap();

    let mut client = Client::connect(channel.socket_path()).await.unwrap();
    let reply = client.invoke("boom", 0, &Message::new()).await.unwrap();
    assert_eq!(reply.result, -1);
    assert!(reply.output.is_empty());
    // No trailing output bytes were streamed; the session is still in
    // sync.
    client.ping(1).await.unwrap();

    let stats = channel.handlers().stats("boom").unwrap();
    assert_eq!(stats.failed, 1);
    channel.shutdown();
}

#[tokio::test]
async fn test_max_clients_enforced() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel_with("limits", |c| {
        c.max_clients = 2;
        c.max_sessions = 2;
    });

    let mut a = Client::connect(channel.socket_path()).await.unwrap();
    let mut b = Client::connect(channel.socket_path()).await.unwrap();
    a.ping(1).await.unwrap();
    b.ping(2).await.unwrap();

    // The third client gets a clean "too many" reply, not a reset.
    let err = Client::connect(channel.socket_path()).await.unwrap_err();
    assert!(matches!(err, ClientError::TooManyClients));

    // Admitted sessions are unaffected.
    a.ping(3).await.unwrap();

    // A released slot can be reused.
    drop(b);
    settle().await;
    let mut c = Client::connect(channel.socket_path()).await.unwrap();
    c.ping(4).await.unwrap();
    channel.shutdown();
}

#[tokio::test]
async fn test_event_mask_filtering_and_fifo() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("events");

    let client = Client::connect(channel.socket_path()).await.unwrap();
    let mut listener = client.into_event_listener().await.unwrap();
    listener.mask_add("svcA", 1 << 3).await.unwrap();
    settle().await;
    assert_eq!(channel.event_queue_count(), 1);

    // Two matching events arrive in post order.
    channel
        .post_event(Event::new("svcA", 3, payload(b"one")).unwrap(), None)
        .unwrap();
    channel
        .post_event(Event::new("svcA", 3, payload(b"two")).unwrap(), None)
        .unwrap();

    let first = listener.next_event().await.unwrap();
    let second = listener.next_event().await.unwrap();
    assert_eq!(first.name, "svcA");
    assert_eq!(first.evtype, 3);
    assert_eq!(first.payload, payload(b"one"));
    assert_eq!(second.payload, payload(b"two"));
    assert!(second.serial > first.serial);

    // A non-matching type is never delivered.
    channel
        .post_event(Event::new("svcA", 4, payload(b"skip")).unwrap(), None)
        .unwrap();
    // A non-matching name is never delivered.
    channel
        .post_event(Event::new("svcB", 3, payload(b"skip")).unwrap(), None)
        .unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(200), listener.next_event()).await;
    assert!(silent.is_err(), "unexpected delivery of masked-out event");

    // Still live for matching events after the misses.
    channel
        .post_event(Event::new("svcA", 3, payload(b"three")).unwrap(), None)
        .unwrap();
    assert_eq!(listener.next_event().await.unwrap().payload, payload(b"three"));
    channel.shutdown();
}

#[tokio::test]
async fn test_mask_del_restores_silence() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("maskdel");

    let client = Client::connect(channel.socket_path()).await.unwrap();
    let mut listener = client.into_event_listener().await.unwrap();
    listener.mask_add("svcA", 1 << 2).await.unwrap();
    listener.mask_del("svcA", 1 << 2).await.unwrap();
    settle().await;

    channel
        .post_event(Event::new("svcA", 2, payload(b"x")).unwrap(), None)
        .unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(200), listener.next_event()).await;
    assert!(silent.is_err(), "mask_del did not restore pre-add behavior");
    channel.shutdown();
}

#[tokio::test]
async fn test_mask_reset_replaces_subscriptions() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("maskreset");

    let client = Client::connect(channel.socket_path()).await.unwrap();
    let mut listener = client.into_event_listener().await.unwrap();
    listener.mask_add("svcA", u32::MAX).await.unwrap();
    listener
        .mask_reset(&[("svcB", 1 << 1)])
        .await
        .unwrap();
    settle().await;

    channel
        .post_event(Event::new("svcA", 0, payload(b"old")).unwrap(), None)
        .unwrap();
    channel
        .post_event(Event::new("svcB", 1, payload(b"new")).unwrap(), None)
        .unwrap();

    let notice = listener.next_event().await.unwrap();
    assert_eq!(notice.name, "svcB");
    channel.shutdown();
}

#[tokio::test]
async fn test_targeted_post_matches_pid() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("target");

    let client = Client::connect(channel.socket_path()).await.unwrap();
    let mut listener = client.into_event_listener().await.unwrap();
    listener.mask_add("svcA", 1).await.unwrap();
    settle().await;

    let own_pid = std::process::id() as i32;
    // A post targeted at some other process skips our listener.
    channel
        .post_event(
            Event::new("svcA", 0, payload(b"other")).unwrap(),
            Some(own_pid + 1),
        )
        .unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(200), listener.next_event()).await;
    assert!(silent.is_err());

    // A post targeted at our pid is delivered.
    channel
        .post_event(
            Event::new("svcA", 0, payload(b"mine")).unwrap(),
            Some(own_pid),
        )
        .unwrap();
    assert_eq!(listener.next_event().await.unwrap().payload, payload(b"mine"));
    channel.shutdown();
}

#[tokio::test]
async fn test_evdesc_completes_after_listener_receives() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("evdesc");

    let client = Client::connect(channel.socket_path()).await.unwrap();
    let mut listener = client.into_event_listener().await.unwrap();
    listener.mask_add("svcA", 1).await.unwrap();
    settle().await;

    let event = Event::new("svcA", 0, payload(b"tracked")).unwrap();
    let desc = channel.evdesc_create(&event).unwrap();
    channel.post_event(event, None).unwrap();

    listener.next_event().await.unwrap();
    channel
        .evdesc_wait(desc, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    channel.shutdown();
}

#[tokio::test]
async fn test_shutdown_drains_active_sessions() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("drain");

    let mut clients = Vec::new();
    for i in 0..3u32 {
        let mut client = Client::connect(channel.socket_path()).await.unwrap();
        client.ping(i).await.unwrap();
        clients.push(client);
    }
    assert_eq!(channel.session_count(), 3);

    channel.fini().await.unwrap();
    assert_eq!(channel.session_count(), 0);
    assert_eq!(channel.client_count(), 0);
    assert_eq!(channel.event_queue_count(), 0);

    // The server side is gone; clients observe closed connections.
    for client in &mut clients {
        assert!(client.ping(99).await.is_err());
    }
}

#[tokio::test]
async fn test_session_timeout_tears_down() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel_with("slow", |c| {
        c.timeout_secs = 1;
    });
    channel
        .handlers()
        .add("sleepy", 1, |_req: InvokeRequest| async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            InvokeReply::with_result(0)
        })
        .unwrap();

    let mut client = Client::connect(channel.socket_path()).await.unwrap();
    // The handler outlives the session deadline; the server tears the
    // session down instead of answering.
    let err = client.invoke("sleepy", 0, &Message::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Io(_) | ClientError::Protocol(_)));
    settle().await;
    assert_eq!(channel.session_count(), 0);
    channel.shutdown();
}

#[tokio::test]
async fn test_reset_callback_fires_during_invoke() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("reset");

    let resets = Arc::new(AtomicU32::new(0));
    let resets_handler = Arc::clone(&resets);
    channel
        .handlers()
        .add("linger", 1, move |req: InvokeRequest| {
            let resets = Arc::clone(&resets_handler);
            async move {
                req.session.set_callback(
                    ferrule_core::SessionCallbackKind::ConnectionReset,
                    Arc::new(move || {
                        let resets = Arc::clone(&resets);
                        async move {
                            resets.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                );
                tokio::time::sleep(Duration::from_millis(500)).await;
                InvokeReply::with_result(0)
            }
        })
        .unwrap();

    // Fire an INVOKE by hand, then vanish while the handler is still
    // running.
    let mut stream = UnixStream::connect(channel.socket_path()).await.unwrap();
    stream
        .write_all(&[HANDSHAKE_MAGIC, ORDER_BIG, ORDER_BIG])
        .await
        .unwrap();
    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], HANDSHAKE_MAGIC);

    stream.write_u8(CMD_INVOKE).await.unwrap();
    stream.write_u8(b"linger".len() as u8).await.unwrap();
    stream.write_u32(0).await.unwrap(); // service ID
    stream.write_all(b"linger").await.unwrap();
    stream.write_u32(0).await.unwrap(); // empty argument message
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(stream);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(channel.session_count(), 0);
    channel.shutdown();
}

// ── Raw-socket protocol checks ─────────────────────────────────────────

#[tokio::test]
async fn test_bad_handshake_magic_closes_connection() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("badmagic");

    let mut stream = UnixStream::connect(channel.socket_path()).await.unwrap();
    stream.write_all(&[0x00, ORDER_BIG, ORDER_BIG]).await.unwrap();
    stream.flush().await.unwrap();

    // The server closes without replying.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
    assert_eq!(channel.session_count(), 0);
    channel.shutdown();
}

#[tokio::test]
async fn test_unknown_command_closes_connection() {
    init_test_tracing();
    let (_dir, channel) = open_test_channel("badcmd");

    let mut stream = UnixStream::connect(channel.socket_path()).await.unwrap();
    stream
        .write_all(&[HANDSHAKE_MAGIC, ORDER_BIG, ORDER_BIG])
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], HANDSHAKE_MAGIC);

    stream.write_all(&[0xEE]).await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
    channel.shutdown();
}
