//! shc-client: one chat session assembled from its parts
//!
//! ```text
//!  IdentityManager ──(private key)──► ChatKeyRegistry
//!         │                                  ▲
//!         └──── login / unlock ──┐           │ chats
//!                                ▼           │
//!                         TransportSession ──┘
//! ```
//!
//! [`ChatClient`] registers the login and chat-list handlers on a
//! [`TransportSession`](shc_transport::TransportSession) and owns nothing
//! global; several clients can run side by side.

pub mod client;
pub mod credentials;
pub mod identity;
pub mod protocol;
pub mod registry;

pub use client::{ChatClient, ClientEvent};
pub use credentials::SavedLogin;
pub use identity::{IdentityManager, RegistrationBundle};
pub use registry::{ChatKeyRegistry, IngestReport};
