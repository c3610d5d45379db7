#![forbid(unsafe_code)]

//! Transport-agnostic event surface for the SyncRoom realtime core.
//!
//! Payload shapes and wire names only: how events reach a connection
//! (websocket, QUIC stream, in-process channel) is the embedder's concern.

pub mod events;

pub use events::{ChatBroadcast, ClientEvent, ParentPreview, ServerEvent};
