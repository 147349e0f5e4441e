//! Session wiring: login on every connect, unlock on login success, chat
//! keys from the conversation listing.

use secrecy::SecretString;
use shc_core::{ChatId, ShcResult};
use shc_transport::{InboundPacket, Request, Termination, TransportSession, WeakTransportSession};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::credentials::SavedLogin;
use crate::identity::IdentityManager;
use crate::protocol::{self, ChatsList, GetChats, LoginFailed, LoginSuccess};
use crate::registry::ChatKeyRegistry;

const EVENT_CAPACITY: usize = 64;

/// What the client reports to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Authenticated {
        username: String,
        flushed: usize,
    },
    /// The session stays connected but unauthenticated.
    AuthFailed {
        reason: String,
    },
    ChatKeys {
        added: Vec<ChatId>,
        failed: Vec<ChatId>,
    },
    Terminated(Termination),
}

/// One chat session: a transport, an identity and a key registry, wired
/// together by packet handlers.
#[derive(Clone)]
pub struct ChatClient {
    transport: TransportSession,
    identity: Arc<IdentityManager>,
    registry: Arc<ChatKeyRegistry>,
    events: broadcast::Sender<ClientEvent>,
    credentials_file: Option<PathBuf>,
}

impl ChatClient {
    pub fn new(
        transport: TransportSession,
        identity: Arc<IdentityManager>,
        registry: Arc<ChatKeyRegistry>,
    ) -> Self {
        Self::build(transport, identity, registry, None)
    }

    /// Like [`new`](Self::new), and persist the login to `path` each time
    /// the private key unlocks.
    pub fn with_credentials_file(
        transport: TransportSession,
        identity: Arc<IdentityManager>,
        registry: Arc<ChatKeyRegistry>,
        path: PathBuf,
    ) -> Self {
        Self::build(transport, identity, registry, Some(path))
    }

    fn build(
        transport: TransportSession,
        identity: Arc<IdentityManager>,
        registry: Arc<ChatKeyRegistry>,
        credentials_file: Option<PathBuf>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let client = Self {
            transport,
            identity,
            registry,
            events,
            credentials_file,
        };
        client.install_handlers();
        client
    }

    fn install_handlers(&self) {
        let weak = self.transport.downgrade();

        {
            let weak = weak.clone();
            let identity = Arc::clone(&self.identity);
            self.transport.on_connect(move || send_login(&weak, &identity));
        }

        {
            let ctx = HandlerContext {
                transport: weak.clone(),
                identity: Arc::clone(&self.identity),
                events: self.events.clone(),
                credentials_file: self.credentials_file.clone(),
            };
            self.transport
                .on(protocol::LOGIN_SUCCESS, move |packet| ctx.clone().login_success(packet));
        }

        {
            let events = self.events.clone();
            self.transport.on(protocol::LOGIN_FAILED, move |packet| {
                let events = events.clone();
                async move {
                    let failed: LoginFailed = packet.decode().unwrap_or_default();
                    let reason = failed.message.unwrap_or_else(|| "login rejected".into());
                    warn!(%reason, "login failed");
                    let _ = events.send(ClientEvent::AuthFailed { reason });
                    Ok(())
                }
            });
        }

        {
            let identity = Arc::clone(&self.identity);
            let registry = Arc::clone(&self.registry);
            let events = self.events.clone();
            self.transport.on(protocol::CHATS, move |packet| {
                let identity = Arc::clone(&identity);
                let registry = Arc::clone(&registry);
                let events = events.clone();
                async move {
                    let list: ChatsList = packet.decode()?;
                    let Some(private_key) = identity.private_key() else {
                        warn!(chats = list.chats.len(), "chat list before unlock, keys skipped");
                        return Ok(());
                    };
                    let report = registry.ingest(&list.chats, &private_key);
                    let _ = events.send(ClientEvent::ChatKeys {
                        added: report.added,
                        failed: report.failed,
                    });
                    Ok(())
                }
            });
        }

        {
            let events = self.events.clone();
            self.transport.on_terminated(move |termination| {
                let _ = events.send(ClientEvent::Terminated(termination));
            });
        }
    }

    /// Log in with a password. The login packet goes out now if connected,
    /// and again on every reconnect.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
        server_key: &str,
    ) -> ShcResult<()> {
        self.identity
            .prepare_login(username, password, server_key)
            .await?;
        self.send_login_if_open();
        Ok(())
    }

    /// Log in from a saved login (auto-login).
    pub fn restore(&self, saved: &SavedLogin) -> ShcResult<()> {
        self.identity.restore_login(saved)?;
        self.send_login_if_open();
        Ok(())
    }

    fn send_login_if_open(&self) {
        if self.transport.state().is_open() {
            send_login(&self.transport.downgrade(), &self.identity);
        }
    }

    pub fn connect(&self) -> ShcResult<()> {
        self.transport.connect()
    }

    /// Queue or send a request, subject to the authentication gate.
    pub fn send<R: Request>(&self, request: &R) -> ShcResult<()> {
        self.transport.send_packet(request)
    }

    /// Forget keys and the saved login, then close the session.
    pub async fn logout(&self) -> ShcResult<()> {
        self.identity.discard();
        self.registry.clear();
        if let Some(path) = &self.credentials_file {
            SavedLogin::clear(path)?;
        }
        self.transport.shutdown().await;
        info!("logged out");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &TransportSession {
        &self.transport
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<ChatKeyRegistry> {
        &self.registry
    }
}

fn send_login(transport: &WeakTransportSession, identity: &IdentityManager) {
    let (Some(transport), Some(login)) = (transport.upgrade(), identity.login_request()) else {
        debug!("connected without credentials, waiting for login");
        return;
    };
    match transport.send_packet_direct(&login) {
        Ok(()) => debug!(username = %login.username, "login sent"),
        Err(e) => warn!(error = %e, "could not send login"),
    }
}

#[derive(Clone)]
struct HandlerContext {
    transport: WeakTransportSession,
    identity: Arc<IdentityManager>,
    events: broadcast::Sender<ClientEvent>,
    credentials_file: Option<PathBuf>,
}

impl HandlerContext {
    async fn login_success(self, packet: InboundPacket) -> anyhow::Result<()> {
        let success: LoginSuccess = packet.decode()?;
        let user = success.user;

        if let Err(e) = self
            .identity
            .unlock(&user.private_key, &user.public_key)
            .await
        {
            warn!(error = %e, "login accepted but private key did not unlock");
            let _ = self.events.send(ClientEvent::AuthFailed {
                reason: e.to_string(),
            });
            return Ok(());
        }
        if let (Some(path), Some(saved)) = (&self.credentials_file, self.identity.saved_login()) {
            if let Err(e) = saved.save(path) {
                warn!(error = %e, "could not save login for next start");
            }
        }

        let Some(transport) = self.transport.upgrade() else {
            return Ok(());
        };
        let flushed = transport.notify_authenticated()?;
        transport.send_packet(&GetChats)?;
        info!(username = %user.username, user_id = user.id, "logged in");
        let _ = self.events.send(ClientEvent::Authenticated {
            username: user.username,
            flushed,
        });
        Ok(())
    }
}
