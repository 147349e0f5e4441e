//! Integration tests for TransportSession over the in-memory connector.
//!
//! Each test plays the server through `ServerEnd`, so ordering and
//! reconnect behaviour are observable without a network.

use futures::StreamExt;
use serde::Serialize;
use shc_transport::{
    MemoryConnector, OutboundPacket, ReconnectPolicy, Request, ServerEnd, SessionState,
    Termination, TransportSession,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn fast_retry(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::RetryThenStop {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    }
}

async fn start(
    policy: ReconnectPolicy,
) -> (
    TransportSession,
    MemoryConnector,
    futures::channel::mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (connector, incoming) = MemoryConnector::new();
    let session = TransportSession::new(Arc::new(connector.clone()), policy);
    (session, connector, incoming)
}

async fn accept(incoming: &mut futures::channel::mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(WAIT, incoming.next())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

async fn wait_for_state(session: &TransportSession, want: SessionState) {
    let mut rx = session.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

async fn next_frame(server: &mut ServerEnd) -> String {
    tokio::time::timeout(WAIT, server.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("client closed")
}

#[derive(Serialize)]
struct Say<'a> {
    text: &'a str,
}

impl Request for Say<'_> {
    const KIND: &'static str = "say";
}

#[tokio::test]
async fn queued_sends_flush_in_fifo_order() {
    let (session, _connector, mut incoming) = start(fast_retry(3)).await;
    session.connect().unwrap();
    let mut server = accept(&mut incoming).await;
    wait_for_state(&session, SessionState::ConnectedUnauthenticated).await;

    session.send_packet(&Say { text: "first" }).unwrap();
    session.send_packet(&Say { text: "second" }).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(server.drain().is_empty(), "nothing may leave before authentication");
    assert_eq!(session.pending_len(), 2);

    assert_eq!(session.notify_authenticated().unwrap(), 2);
    assert_eq!(session.state(), SessionState::ConnectedAuthenticated);
    assert_eq!(next_frame(&mut server).await, "say\n{\"text\":\"first\"}");
    assert_eq!(next_frame(&mut server).await, "say\n{\"text\":\"second\"}");

    // Once authenticated, sends go straight out
    session.send(OutboundPacket::bare("get_chats"));
    assert_eq!(next_frame(&mut server).await, "get_chats");
    assert_eq!(session.pending_len(), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn send_direct_bypasses_the_queue() {
    let (session, _connector, mut incoming) = start(fast_retry(3)).await;
    assert!(session.send_direct(OutboundPacket::bare("login")).is_err());
    assert!(session.notify_authenticated().is_err());

    session.connect().unwrap();
    let mut server = accept(&mut incoming).await;
    wait_for_state(&session, SessionState::ConnectedUnauthenticated).await;

    session.send(OutboundPacket::bare("get_chats"));
    session.send_direct(OutboundPacket::bare("login")).unwrap();
    assert_eq!(next_frame(&mut server).await, "login");
    assert_eq!(session.pending_len(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn inbound_dispatch_is_serialized() {
    let (session, _connector, mut incoming) = start(fast_retry(3)).await;
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    let l = log.clone();
    session.on("slow", move |_| {
        let l = l.clone();
        async move {
            l.lock().unwrap().push("slow:start");
            tokio::time::sleep(Duration::from_millis(50)).await;
            l.lock().unwrap().push("slow:end");
            Ok(())
        }
    });
    let l = log.clone();
    session.on("fast", move |_| {
        let l = l.clone();
        let done = done_tx.clone();
        async move {
            l.lock().unwrap().push("fast:start");
            let _ = done.send(());
            Ok(())
        }
    });

    session.connect().unwrap();
    let server = accept(&mut incoming).await;
    server.push(r#"{"packet":"slow"}"#);
    server.push(r#"{"packet":"fast"}"#);

    tokio::time::timeout(WAIT, done_rx.recv()).await.unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["slow:start", "slow:end", "fast:start"],
        "the second packet must wait for the first packet's handler to finish"
    );

    session.shutdown().await;
}

#[tokio::test]
async fn all_handlers_for_a_type_run_and_unknown_types_are_ignored() {
    let (session, _connector, mut incoming) = start(fast_retry(3)).await;
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    for name in ["a", "b"] {
        let l = log.clone();
        session.on("chats", move |packet| {
            let l = l.clone();
            async move {
                l.lock().unwrap().push(format!("{name}:{}", packet.payload["n"]));
                Ok(())
            }
        });
    }
    let removed = session.on("chats", |_| async { Ok(()) });
    assert_eq!(session.off("chats", Some(removed)), 1);
    session.on("end", move |_| {
        let done = done_tx.clone();
        async move {
            let _ = done.send(());
            Ok(())
        }
    });

    session.connect().unwrap();
    let server = accept(&mut incoming).await;
    server.push(r#"{"packet":"chats","n":1}"#);
    server.push(r#"{"packet":"mystery","n":2}"#);
    server.push("not json at all");
    server.push(r#"{"packet":"chats","n":3}"#);
    server.push(r#"{"packet":"end"}"#);

    tokio::time::timeout(WAIT, done_rx.recv()).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "a:3", "b:3"]);
    assert_eq!(session.state(), SessionState::ConnectedUnauthenticated);

    session.shutdown().await;
}

#[tokio::test]
async fn reconnect_refires_connect_callback_and_requires_reauth() {
    let (session, _connector, mut incoming) = start(fast_retry(3)).await;
    let opens = Arc::new(AtomicU32::new(0));
    let o = opens.clone();
    let s = session.clone();
    session.on_connect(move || {
        o.fetch_add(1, Ordering::SeqCst);
        s.send_direct(OutboundPacket::bare("login")).unwrap();
    });

    session.connect().unwrap();
    let mut server = accept(&mut incoming).await;
    assert_eq!(next_frame(&mut server).await, "login");
    session.notify_authenticated().unwrap();

    server.close();
    wait_for_state(&session, SessionState::Disconnected).await;
    session.send(OutboundPacket::bare("get_chats"));

    let mut server = accept(&mut incoming).await;
    assert_eq!(next_frame(&mut server).await, "login");
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert_eq!(session.state(), SessionState::ConnectedUnauthenticated);
    assert_eq!(session.pending_len(), 1);

    session.notify_authenticated().unwrap();
    assert_eq!(next_frame(&mut server).await, "get_chats");

    session.shutdown().await;
}

#[tokio::test]
async fn retries_exhaust_then_discard_queue_and_stop() {
    let (session, connector, _incoming) = start(fast_retry(2)).await;
    connector.refuse_next(10);
    let (term_tx, mut term_rx) = mpsc::unbounded_channel();
    session.on_terminated(move |t| {
        let _ = term_tx.send(t);
    });

    session.send(OutboundPacket::bare("get_chats"));
    session.connect().unwrap();

    let termination = tokio::time::timeout(WAIT, term_rx.recv()).await.unwrap().unwrap();
    assert_eq!(termination, Termination::Stopped { attempts: 2 });
    assert_eq!(session.pending_len(), 0);
    wait_for_state(&session, SessionState::Disconnected).await;
}

#[tokio::test]
async fn reload_policy_terminates_on_first_drop() {
    let (session, _connector, mut incoming) = start(ReconnectPolicy::ReloadClient).await;
    let (term_tx, mut term_rx) = mpsc::unbounded_channel();
    session.on_terminated(move |t| {
        let _ = term_tx.send(t);
    });

    session.connect().unwrap();
    let server = accept(&mut incoming).await;
    wait_for_state(&session, SessionState::ConnectedUnauthenticated).await;
    server.fail("reset by peer");

    let termination = tokio::time::timeout(WAIT, term_rx.recv()).await.unwrap().unwrap();
    assert_eq!(termination, Termination::Reload);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), incoming.next())
            .await
            .is_err(),
        "reload policy must not reconnect on its own"
    );
}
