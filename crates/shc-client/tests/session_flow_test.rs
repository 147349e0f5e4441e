//! End-to-end login and chat-key flow over the in-memory connector.
//!
//! The test plays the server: it answers the login packet with the user's
//! wrapped private key and then lists conversations.

use futures::StreamExt;
use secrecy::SecretString;
use shc_client::protocol::GetChatDetails;
use shc_client::{
    ChatClient, ChatKeyRegistry, ClientEvent, IdentityManager, RegistrationBundle, SavedLogin,
};
use shc_core::config::CryptoConfig;
use shc_crypto::{generate_chat_key, import_public_key, wrap_key_for_recipient, SymmetricKey};
use shc_transport::{MemoryConnector, ReconnectPolicy, ServerEnd, SessionState, TransportSession};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);
const SERVER_KEY: &str = "server-auth-key";

fn crypto() -> CryptoConfig {
    CryptoConfig {
        pbkdf2_iterations: 1000,
        rsa_bits: 1024,
    }
}

async fn provision(username: &str, password: &str) -> RegistrationBundle {
    IdentityManager::new(&crypto())
        .register(username, &SecretString::from(password), SERVER_KEY)
        .await
        .unwrap()
}

struct Harness {
    client: ChatClient,
    incoming: futures::channel::mpsc::UnboundedReceiver<ServerEnd>,
    events: broadcast::Receiver<ClientEvent>,
}

fn harness(credentials: &Path) -> Harness {
    let (connector, incoming) = MemoryConnector::new();
    let transport = TransportSession::new(
        Arc::new(connector),
        ReconnectPolicy::RetryThenStop {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
    );
    let client = ChatClient::with_credentials_file(
        transport,
        Arc::new(IdentityManager::new(&crypto())),
        Arc::new(ChatKeyRegistry::new()),
        credentials.to_path_buf(),
    );
    let events = client.subscribe();
    Harness {
        client,
        incoming,
        events,
    }
}

async fn accept(h: &mut Harness) -> ServerEnd {
    tokio::time::timeout(WAIT, h.incoming.next())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

async fn next_frame(server: &mut ServerEnd) -> String {
    tokio::time::timeout(WAIT, server.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("client closed")
}

async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

fn login_success(bundle: &RegistrationBundle) -> String {
    serde_json::json!({
        "packet": "login_success",
        "user": {
            "id": 7,
            "username": bundle.username,
            "publicKey": bundle.public_key,
            "privateKey": bundle.private_key,
        }
    })
    .to_string()
}

fn chats(entries: &[(i64, String)]) -> String {
    let chats: Vec<_> = entries
        .iter()
        .map(|(id, key)| serde_json::json!({"chatId": id, "name": null, "isPrivate": true, "key": key}))
        .collect();
    serde_json::json!({"packet": "chats", "chats": chats}).to_string()
}

#[tokio::test]
async fn login_unlocks_keys_and_flushes_queue() {
    let tmp = TempDir::new().unwrap();
    let credentials = tmp.path().join("session.json");
    let bundle = provision("alice", "hunter22").await;
    let alice_pub = import_public_key(&bundle.public_key).unwrap();

    let mut h = harness(&credentials);
    h.client
        .login("alice", &SecretString::from("hunter22"), SERVER_KEY)
        .await
        .unwrap();
    h.client.connect().unwrap();
    let mut server = accept(&mut h).await;

    let login = next_frame(&mut server).await;
    assert_eq!(
        login,
        format!(
            "login\n{{\"username\":\"alice\",\"password\":\"{}\"}}",
            bundle.password
        )
    );

    // Sent before authentication, so it waits in the queue
    h.client.send(&GetChatDetails { chat_id: 42 }).unwrap();
    server.push(login_success(&bundle));

    match next_event(&mut h.events).await {
        ClientEvent::Authenticated { username, flushed } => {
            assert_eq!(username, "alice");
            assert_eq!(flushed, 1);
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }
    assert_eq!(next_frame(&mut server).await, "get_chat_details\n{\"chatId\":42}");
    assert_eq!(next_frame(&mut server).await, "get_chats");
    assert_eq!(h.client.transport().state(), SessionState::ConnectedAuthenticated);

    // Conversation 42 shares key K with alice; 43 carries garbage
    let k: SymmetricKey = generate_chat_key();
    let w = wrap_key_for_recipient(&k, &alice_pub).unwrap();
    server.push(chats(&[(42, w), (43, "Z2FyYmFnZQ==".into())]));

    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::ChatKeys {
            added: vec![42],
            failed: vec![43],
        }
    );
    let k_prime = h.client.registry().get(42).unwrap();
    assert_eq!(k.export_raw(), k_prime.export_raw());

    let saved = SavedLogin::load(&credentials).unwrap().unwrap();
    assert_eq!(saved.username, "alice");
    assert_eq!(saved.auth_token, bundle.password);

    h.client.logout().await.unwrap();
    assert!(SavedLogin::load(&credentials).unwrap().is_none());
    assert!(h.client.registry().is_empty());
}

#[tokio::test]
async fn wrong_password_stays_unauthenticated() {
    let tmp = TempDir::new().unwrap();
    let bundle = provision("bob", "correct").await;

    let mut h = harness(&tmp.path().join("session.json"));
    h.client
        .login("bob", &SecretString::from("incorrect"), SERVER_KEY)
        .await
        .unwrap();
    h.client.connect().unwrap();
    let mut server = accept(&mut h).await;
    next_frame(&mut server).await;

    h.client.send(&GetChatDetails { chat_id: 1 }).unwrap();
    // The server would refuse a wrong token; feed the success path anyway to
    // exercise the local unwrap failure
    server.push(login_success(&bundle));

    assert!(matches!(
        next_event(&mut h.events).await,
        ClientEvent::AuthFailed { .. }
    ));
    assert_eq!(
        h.client.transport().state(),
        SessionState::ConnectedUnauthenticated
    );
    assert_eq!(h.client.transport().pending_len(), 1);
    assert!(!h.client.identity().is_unlocked());
    assert!(!tmp.path().join("session.json").exists());

    h.client.transport().shutdown().await;
}

#[tokio::test]
async fn reconnect_sends_login_again_and_auto_login_restores() {
    let tmp = TempDir::new().unwrap();
    let credentials = tmp.path().join("session.json");
    let bundle = provision("carol", "pw-carol").await;

    let mut h = harness(&credentials);
    h.client
        .login("carol", &SecretString::from("pw-carol"), SERVER_KEY)
        .await
        .unwrap();
    h.client.connect().unwrap();
    let mut server = accept(&mut h).await;
    let first_login = next_frame(&mut server).await;
    server.push(login_success(&bundle));
    next_event(&mut h.events).await;

    // Drop the connection; the retry policy reconnects and logs in again
    server.close();
    let mut server = accept(&mut h).await;
    assert_eq!(next_frame(&mut server).await, first_login);
    h.client.transport().shutdown().await;

    // A fresh process restores from the saved login, no password needed
    let saved = SavedLogin::load(&credentials).unwrap().unwrap();
    let mut fresh = harness(&tmp.path().join("other.json"));
    fresh.client.restore(&saved).unwrap();
    fresh.client.connect().unwrap();
    let mut server = accept(&mut fresh).await;
    assert_eq!(next_frame(&mut server).await, first_login);
    server.push(login_success(&bundle));
    assert!(matches!(
        next_event(&mut fresh.events).await,
        ClientEvent::Authenticated { .. }
    ));
    fresh.client.transport().shutdown().await;
}

#[tokio::test]
async fn chat_list_before_unlock_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let mut h = harness(&tmp.path().join("session.json"));
    h.client.connect().unwrap();
    let server = accept(&mut h).await;

    server.push(chats(&[(1, "a2V5".into())]));
    server.push(r#"{"packet":"login_failed","message":"bad credentials"}"#);

    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::AuthFailed {
            reason: "bad credentials".into()
        }
    );
    assert!(h.client.registry().is_empty());
    h.client.transport().shutdown().await;
}
