#![forbid(unsafe_code)]

//! The SyncRoom realtime core: session directory, presence, message routing,
//! assistant relay and call signaling over a transport-agnostic connection
//! substrate. Embedders attach one outbound queue per connection and feed
//! inbound [`syncroom_protocol::ClientEvent`]s through
//! [`server::connection::CoreServices`].

pub mod config;
pub mod server;
mod util;
