//! Peer-to-peer session establishment over a signaling relay.
//!
//! [`P2pClient`] authenticates to the relay, registers the application, answers
//! browser offers and exposes the resulting WebRTC data channel.
//! [`supervisor::run`] keeps it connected with exponential backoff.

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
mod guard;
pub mod peer;
pub mod protocol;
pub mod signaling;
pub mod supervisor;

pub use client::{ChannelReadyHook, ClientEventHandler, P2pClient, P2pClientBuilder};
pub use config::{ClientConfig, IceServer};
pub use credentials::{Credentials, CredentialsError};
pub use error::P2pError;
pub use peer::{ByteChannel, PeerSession, PeerState};
pub use supervisor::{Backoff, ReconnectPolicy};
