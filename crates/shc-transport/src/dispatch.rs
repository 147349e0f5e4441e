//! Inbound dispatch
//!
//! Handlers are kept per packet type in registration order. A single
//! consumer task drains inbound packets and awaits every handler for one
//! packet before taking the next, so handler bodies never interleave.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::packet::InboundPacket;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type Handler = Arc<dyn Fn(InboundPacket) -> HandlerFuture + Send + Sync>;

/// Identifies one registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
}

impl HandlerRegistry {
    pub fn register<F, Fut>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(InboundPacket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: Handler = Arc::new(move |packet| -> HandlerFuture { Box::pin(handler(packet)) });
        self.lock().entry(kind.to_owned()).or_default().push((id, boxed));
        debug!(kind, ?id, "registered packet handler");
        id
    }

    /// Remove one handler, or every handler for `kind` when `id` is `None`.
    /// Returns how many were removed.
    pub fn remove(&self, kind: &str, id: Option<HandlerId>) -> usize {
        let mut map = self.lock();
        let removed = match (map.get_mut(kind), id) {
            (None, _) => 0,
            (Some(list), Some(id)) => {
                let before = list.len();
                list.retain(|(h, _)| *h != id);
                before - list.len()
            }
            (Some(list), None) => std::mem::take(list).len(),
        };
        if map.get(kind).is_some_and(Vec::is_empty) {
            map.remove(kind);
        }
        removed
    }

    /// Handlers for `kind` as of now, in registration order. Registrations
    /// made while a packet is being handled apply from the next packet.
    pub fn snapshot(&self, kind: &str) -> Vec<Handler> {
        self.lock()
            .get(kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<(HandlerId, Handler)>>> {
        // A poisoned map is still structurally valid
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drain `inbound` until it closes or `cancel` fires.
pub async fn run_dispatcher(
    registry: Arc<HandlerRegistry>,
    mut inbound: mpsc::UnboundedReceiver<InboundPacket>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.recv() => match next {
                Some(p) => p,
                None => break,
            },
        };

        let handlers = registry.snapshot(&packet.kind);
        if handlers.is_empty() {
            trace!(kind = %packet.kind, "no handler for packet type, ignoring");
            continue;
        }

        for (position, handler) in handlers.iter().enumerate() {
            if let Err(e) = handler(packet.clone()).await {
                warn!(kind = %packet.kind, position, "packet handler failed: {e:#}");
            }
        }
    }
    debug!("dispatcher stopped");
}
