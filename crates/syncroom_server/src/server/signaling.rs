#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use syncroom_domain::{CallRoomId, ConnectionId};
use syncroom_protocol::ServerEvent;
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::hub::ConnectionHub;

/// Call-signaling event kinds forwarded verbatim between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
	Offer,
	Answer,
	IceCandidate,
}

/// Stateless call-signaling relay keyed by connection identity.
///
/// The relay tracks only who is in which call-room; offer/answer/ICE payloads
/// are opaque and pass through uninspected. A connection is in at most one
/// call-room; call-rooms prune when their last peer leaves.
#[derive(Debug, Clone)]
pub struct SignalingRelay {
	hub: ConnectionHub,
	inner: Arc<Mutex<CallRegistry>>,
}

#[derive(Debug, Default)]
struct CallRegistry {
	rooms: HashMap<CallRoomId, Vec<ConnectionId>>,
	by_conn: HashMap<ConnectionId, CallRoomId>,
}

impl SignalingRelay {
	pub fn new(hub: ConnectionHub) -> Self {
		Self {
			hub,
			inner: Arc::new(Mutex::new(CallRegistry::default())),
		}
	}

	/// Bind a connection to a call-room. Existing peers learn of the new peer
	/// first; the joiner then receives the peer list, never including itself.
	/// Returns the peers that were already present.
	pub async fn join_call(&self, conn: ConnectionId, room: CallRoomId) -> Vec<ConnectionId> {
		let (existing, departed_from) = {
			let mut reg = self.inner.lock().await;

			let switching = reg.by_conn.get(&conn).is_some_and(|prior| prior != &room);
			let departed_from = if switching { reg.remove_from_call(conn) } else { None };

			let peers = reg.rooms.entry(room.clone()).or_default();
			let existing = peers.iter().copied().filter(|p| *p != conn).collect::<Vec<_>>();
			if !peers.contains(&conn) {
				peers.push(conn);
			}
			reg.by_conn.insert(conn, room.clone());

			(existing, departed_from)
		};

		if let Some((_, remaining)) = departed_from {
			self.notify_departure(conn, &remaining).await;
		}

		debug!(%conn, call = %room, peers = existing.len(), "call join");
		self.hub
			.send_to_many(&existing, ServerEvent::NewPeer { peer_id: conn })
			.await;
		self.hub
			.send_to(
				conn,
				ServerEvent::ExistingPeers {
					peers: existing.clone(),
				},
			)
			.await;

		existing
	}

	/// Forward one signaling payload to a single target connection, verbatim,
	/// with the sender attached. Unknown targets are a silent no-op.
	pub async fn forward(&self, from: ConnectionId, kind: SignalKind, target: ConnectionId, payload: Value) {
		let event = match kind {
			SignalKind::Offer => ServerEvent::Offer { from_id: from, payload },
			SignalKind::Answer => ServerEvent::Answer { from_id: from, payload },
			SignalKind::IceCandidate => ServerEvent::IceCandidate { from_id: from, payload },
		};

		if !self.hub.send_to(target, event).await {
			debug!(%from, %target, "signal target not connected, dropping");
		}
	}

	/// Unbind from a call-room and notify the remaining peers.
	pub async fn leave_call(&self, conn: ConnectionId, room: CallRoomId) {
		let remaining = {
			let mut reg = self.inner.lock().await;
			let bound_here = reg.by_conn.get(&conn).is_some_and(|bound| bound == &room);
			if bound_here {
				reg.remove_from_call(conn).map(|(_, peers)| peers)
			} else {
				None
			}
		};

		if let Some(remaining) = remaining {
			debug!(%conn, call = %room, "call leave");
			self.notify_departure(conn, &remaining).await;
		}
	}

	/// Disconnect cleanup: release any call binding the connection held.
	pub async fn disconnect(&self, conn: ConnectionId) {
		let remaining = {
			let mut reg = self.inner.lock().await;
			reg.remove_from_call(conn).map(|(_, peers)| peers)
		};

		if let Some(remaining) = remaining {
			self.notify_departure(conn, &remaining).await;
		}
	}

	/// Peers currently bound to a call-room.
	pub async fn peers(&self, room: &CallRoomId) -> Vec<ConnectionId> {
		let reg = self.inner.lock().await;
		reg.rooms.get(room).cloned().unwrap_or_default()
	}

	async fn notify_departure(&self, conn: ConnectionId, remaining: &[ConnectionId]) {
		self.hub
			.send_to_many(remaining, ServerEvent::PeerDisconnected { peer_id: conn })
			.await;
	}
}

impl CallRegistry {
	/// Remove a connection from its bound call-room, pruning the room when
	/// empty. Returns the room and the remaining peers.
	fn remove_from_call(&mut self, conn: ConnectionId) -> Option<(CallRoomId, Vec<ConnectionId>)> {
		let room = self.by_conn.remove(&conn)?;
		let Some(peers) = self.rooms.get_mut(&room) else {
			return Some((room, Vec::new()));
		};

		peers.retain(|p| *p != conn);
		let remaining = peers.clone();
		if remaining.is_empty() {
			self.rooms.remove(&room);
		}

		Some((room, remaining))
	}
}
