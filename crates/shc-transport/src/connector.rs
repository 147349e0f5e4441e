//! Connection establishment
//!
//! A [`Connector`] yields one text-frame sink/stream pair per successful
//! connect; the session owns reconnect logic and calls it again after a
//! drop.

use futures::channel::mpsc as fmpsc;
use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, Sink, SinkExt, StreamExt};
use shc_core::{ShcError, ShcResult};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ShcError> + Send>>;
pub type FrameStream = BoxStream<'static, ShcResult<String>>;

pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, ShcResult<(FrameSink, FrameStream)>>;
}

// ── WebSocket ────────────────────────────────────────────────────────────────

/// Connects to the chat server's realtime endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, ShcResult<(FrameSink, FrameStream)>> {
        let url = self.url.clone();
        async move {
            let (ws, response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ShcError::Transport(format!("connecting to {url}: {e}")))?;
            debug!(%url, status = %response.status(), "websocket open");

            let (sink, stream) = ws.split();
            let sink = sink
                .with(|frame: String| future::ready(Ok::<_, tungstenite::Error>(Message::text(frame))))
                .sink_map_err(|e| ShcError::Transport(format!("websocket send: {e}")));
            // Binary, ping and pong frames carry nothing for the dispatcher
            let stream = stream.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(_) => None,
                    Err(e) => Some(Err(ShcError::Transport(format!("websocket receive: {e}")))),
                })
            });

            let sink: FrameSink = Box::pin(sink);
            Ok((sink, stream.boxed()))
        }
        .boxed()
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// The peer side of one in-memory connection.
pub struct ServerEnd {
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<ShcResult<String>>,
}

impl ServerEnd {
    /// Next frame the client wrote, or `None` once the client side closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Deliver one inbound frame to the client.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.to_client.unbounded_send(Ok(frame.into())).is_ok()
    }

    /// Deliver a read error, which the client treats as a dropped connection.
    pub fn fail(&self, reason: &str) -> bool {
        self.to_client
            .unbounded_send(Err(ShcError::Transport(reason.into())))
            .is_ok()
    }

    /// Frames already written and not yet received.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(Some(frame)) = self.from_client.next().now_or_never() {
            out.push(frame);
        }
        out
    }

    /// Close the connection from the server side.
    pub fn close(self) {}
}

/// Hands each accepted connection's [`ServerEnd`] to whoever holds the
/// receiver returned by [`MemoryConnector::new`].
#[derive(Clone)]
pub struct MemoryConnector {
    accept: fmpsc::UnboundedSender<ServerEnd>,
    refuse_next: Arc<AtomicU32>,
}

impl MemoryConnector {
    pub fn new() -> (Self, fmpsc::UnboundedReceiver<ServerEnd>) {
        let (accept, incoming) = fmpsc::unbounded();
        (
            Self {
                accept,
                refuse_next: Arc::new(AtomicU32::new(0)),
            },
            incoming,
        )
    }

    /// Make the next `n` connect attempts fail.
    pub fn refuse_next(&self, n: u32) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BoxFuture<'static, ShcResult<(FrameSink, FrameStream)>> {
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let accept = self.accept.clone();
        async move {
            if refused {
                return Err(ShcError::Transport("connection refused".into()));
            }
            let (client_tx, from_client) = fmpsc::unbounded::<String>();
            let (to_client, client_rx) = fmpsc::unbounded::<ShcResult<String>>();
            accept
                .unbounded_send(ServerEnd {
                    from_client,
                    to_client,
                })
                .map_err(|_| ShcError::Transport("no listener for in-memory connection".into()))?;

            let sink: FrameSink = Box::pin(
                client_tx.sink_map_err(|e| ShcError::Transport(format!("in-memory send: {e}"))),
            );
            Ok((sink, client_rx.boxed()))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_connector_pairs_frames() {
        let (connector, mut incoming) = MemoryConnector::new();
        let (mut sink, mut stream) = connector.connect().await.unwrap();
        let mut server = incoming.next().await.unwrap();

        sink.send("get_chats".to_string()).await.unwrap();
        assert_eq!(server.recv().await.as_deref(), Some("get_chats"));

        assert!(server.push(r#"{"packet":"chats","chats":[]}"#));
        let frame = stream.next().await.unwrap().unwrap();
        assert!(frame.contains("chats"));

        server.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_connector_refusal() {
        let (connector, _incoming) = MemoryConnector::new();
        connector.refuse_next(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
    }
}
