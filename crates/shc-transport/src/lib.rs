//! shc-transport: one persistent duplex connection per session
//!
//! ```text
//!  send() ──► pending FIFO ──(notify_authenticated)──► writer task ──► socket
//!  send_direct() ─────────────────────────────────────►
//!  socket ──► reader task ──► dispatcher (single consumer) ──► handlers, one packet at a time
//! ```
//!
//! The connection itself comes from a [`Connector`]: [`WsConnector`] for the
//! real server, [`MemoryConnector`] for in-process peers and tests.

pub mod connector;
pub mod dispatch;
pub mod packet;
pub mod policy;
pub mod session;

pub use connector::{Connector, FrameSink, FrameStream, MemoryConnector, ServerEnd, WsConnector};
pub use dispatch::HandlerId;
pub use packet::{InboundPacket, OutboundPacket, Request};
pub use policy::{ReconnectPolicy, Termination};
pub use session::{SessionState, TransportSession, WeakTransportSession};
