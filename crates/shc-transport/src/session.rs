//! TransportSession: connection supervisor, login-gated send queue, and
//! the entry point for handler registration

use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use shc_core::{ShcError, ShcResult};

use crate::connector::{Connector, FrameSink, FrameStream};
use crate::dispatch::{run_dispatcher, HandlerId, HandlerRegistry};
use crate::packet::{InboundPacket, OutboundPacket, Request};
use crate::policy::{ReconnectPolicy, Termination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ConnectedUnauthenticated,
    ConnectedAuthenticated,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::ConnectedUnauthenticated | SessionState::ConnectedAuthenticated
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::ConnectedUnauthenticated => "connected_unauthenticated",
            SessionState::ConnectedAuthenticated => "connected_authenticated",
        };
        f.write_str(s)
    }
}

type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
type TerminationCallback = Arc<dyn Fn(Termination) + Send + Sync>;

/// Outbound side of the current connection. State transitions that touch
/// it happen under its lock so a flush can never interleave with a send.
#[derive(Default)]
struct Link {
    pending: VecDeque<String>,
    writer: Option<mpsc::UnboundedSender<String>>,
    authenticated: bool,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: watch::Sender<SessionState>,
    link: Mutex<Link>,
    handlers: Arc<HandlerRegistry>,
    inbound_tx: mpsc::UnboundedSender<InboundPacket>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundPacket>>>,
    on_connect: Mutex<Vec<ConnectCallback>>,
    on_terminated: Mutex<Vec<TerminationCallback>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "session state");
        }
    }

    fn detach_link(&self) {
        let mut link = lock(&self.link);
        link.writer = None;
        link.authenticated = false;
        self.set_state(SessionState::Disconnected);
    }
}

/// One logical session over one duplex connection. Cheap to clone; clones
/// share the connection, queue and handlers.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<Inner>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                state,
                link: Mutex::new(Link::default()),
                handlers: Arc::new(HandlerRegistry::default()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                on_connect: Mutex::new(Vec::new()),
                on_terminated: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// A handle that does not keep the session alive. Handlers registered
    /// on this session should hold one of these rather than a clone.
    pub fn downgrade(&self) -> WeakTransportSession {
        WeakTransportSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a handler for an inbound packet type. Several handlers per
    /// type are allowed; they run in registration order.
    pub fn on<F, Fut>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(InboundPacket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.handlers.register(kind, handler)
    }

    /// Remove one handler by id, or all handlers for `kind`.
    pub fn off(&self, kind: &str, id: Option<HandlerId>) -> usize {
        self.inner.handlers.remove(kind, id)
    }

    /// Called each time a connection opens, before any inbound packet from
    /// it is dispatched. Typically sends the login packet.
    pub fn on_connect(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.on_connect).push(Arc::new(callback));
    }

    /// Called once when the reconnect policy gives up.
    pub fn on_terminated(&self, callback: impl Fn(Termination) + Send + Sync + 'static) {
        lock(&self.inner.on_terminated).push(Arc::new(callback));
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Start connecting in the background. A no-op while a supervisor is
    /// already running; after termination it starts a fresh one.
    pub fn connect(&self) -> ShcResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(ShcError::Contract("session has been shut down".into()));
        }

        if let Some(rx) = lock(&self.inner.inbound_rx).take() {
            let handle = tokio::spawn(run_dispatcher(
                Arc::clone(&self.inner.handlers),
                rx,
                self.inner.cancel.clone(),
            ));
            *lock(&self.inner.dispatcher) = Some(handle);
        }

        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("connect requested while already running");
            return Ok(());
        }
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
        Ok(())
    }

    /// Stop the supervisor and dispatcher and drop the connection.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let supervisor = lock(&self.inner.supervisor).take();
        let dispatcher = lock(&self.inner.dispatcher).take();
        for handle in [supervisor, dispatcher].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!("session task ended abnormally: {e}");
            }
        }
        self.inner.detach_link();
        info!("transport session shut down");
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.link).pending.len()
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Mark the session authenticated and flush queued packets in enqueue
    /// order. Returns how many were flushed.
    pub fn notify_authenticated(&self) -> ShcResult<usize> {
        let mut link = lock(&self.inner.link);
        let Some(writer) = link.writer.clone() else {
            return Err(ShcError::Transport(
                "cannot authenticate: no open connection".into(),
            ));
        };

        let mut flushed = 0usize;
        while let Some(frame) = link.pending.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = writer.send(frame) {
                link.pending.push_front(frame);
                return Err(ShcError::Transport(
                    "connection closed while flushing queue".into(),
                ));
            }
            flushed += 1;
        }
        link.authenticated = true;
        self.inner.set_state(SessionState::ConnectedAuthenticated);
        info!(flushed, "session authenticated");
        Ok(flushed)
    }

    /// Send now if authenticated and open, otherwise queue for the next flush.
    pub fn send(&self, packet: OutboundPacket) {
        let frame = packet.frame();
        let mut link = lock(&self.inner.link);
        let frame = match (&link.writer, link.authenticated) {
            (Some(writer), true) => match writer.send(frame) {
                Ok(()) => {
                    trace!(kind = %packet.kind, "sent");
                    return;
                }
                Err(mpsc::error::SendError(frame)) => frame,
            },
            _ => frame,
        };
        link.pending.push_back(frame);
        trace!(kind = %packet.kind, queued = link.pending.len(), "queued");
    }

    pub fn send_packet<R: Request>(&self, request: &R) -> ShcResult<()> {
        self.send(OutboundPacket::from_request(request)?);
        Ok(())
    }

    /// Write straight to the open connection, bypassing the queue and the
    /// authentication gate. Reserved for the login packet.
    pub fn send_direct(&self, packet: OutboundPacket) -> ShcResult<()> {
        let link = lock(&self.inner.link);
        match &link.writer {
            Some(writer) => writer
                .send(packet.frame())
                .map_err(|_| ShcError::Transport("connection closed".into())),
            None => Err(ShcError::Transport(format!(
                "cannot send {} directly: not connected",
                packet.kind
            ))),
        }
    }

    pub fn send_packet_direct<R: Request>(&self, request: &R) -> ShcResult<()> {
        self.send_direct(OutboundPacket::from_request(request)?)
    }
}

#[derive(Clone)]
pub struct WeakTransportSession {
    inner: Weak<Inner>,
}

impl WeakTransportSession {
    pub fn upgrade(&self) -> Option<TransportSession> {
        self.inner.upgrade().map(|inner| TransportSession { inner })
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

async fn supervise(inner: Arc<Inner>) {
    // Consecutive failed connect attempts; reset by every successful open
    let mut failures = 0u32;

    loop {
        inner.set_state(SessionState::Connecting);
        let connected = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            result = inner.connector.connect() => result,
        };

        match connected {
            Ok((sink, stream)) => {
                failures = 0;
                let (writer, outbound) = mpsc::unbounded_channel();
                {
                    let mut link = lock(&inner.link);
                    link.writer = Some(writer);
                    link.authenticated = false;
                    inner.set_state(SessionState::ConnectedUnauthenticated);
                }
                info!("transport connected");

                let callbacks: Vec<_> = lock(&inner.on_connect).clone();
                for callback in callbacks {
                    callback();
                }

                let outcome = pump(&inner, sink, stream, outbound).await;
                inner.detach_link();
                match outcome {
                    Ok(()) => info!("connection closed"),
                    Err(e) => warn!("connection lost: {e}"),
                }
                if inner.cancel.is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                inner.set_state(SessionState::Disconnected);
                warn!(attempt = failures, "connect failed: {e}");
            }
        }

        let Some(delay) = inner.policy.delay_for(failures + 1) else {
            let termination = match inner.policy {
                ReconnectPolicy::ReloadClient => Termination::Reload,
                ReconnectPolicy::RetryThenStop { .. } => Termination::Stopped { attempts: failures },
            };
            let discarded = {
                let mut link = lock(&inner.link);
                let n = link.pending.len();
                link.pending.clear();
                n
            };
            warn!(?termination, discarded, "transport giving up");
            let callbacks: Vec<_> = lock(&inner.on_terminated).clone();
            for callback in callbacks {
                callback(termination);
            }
            break;
        };

        debug!(attempt = failures + 1, ?delay, "reconnecting after backoff");
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.set_state(SessionState::Disconnected);
}

/// Move frames both ways until the connection ends.
async fn pump(
    inner: &Inner,
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> ShcResult<()> {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                if let Err(e) = sink.close().await {
                    debug!("closing sink on shutdown: {e}");
                }
                return Ok(());
            }
            frame = outbound.recv() => match frame {
                Some(frame) => sink.send(frame).await?,
                None => return Ok(()),
            },
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match InboundPacket::parse(&text) {
                    Ok(packet) => {
                        trace!(kind = %packet.kind, "received");
                        if inner.inbound_tx.send(packet).is_err() {
                            return Err(ShcError::Transport("dispatcher stopped".into()));
                        }
                    }
                    Err(e) => warn!("dropping malformed inbound frame: {e}"),
                },
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}
