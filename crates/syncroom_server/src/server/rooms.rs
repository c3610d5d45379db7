#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use syncroom_domain::{ConnectionId, RoomId, UserId};
use syncroom_protocol::ServerEvent;
use syncroom_store::Identity;
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::hub::ConnectionHub;

/// Session directory and presence tracker.
///
/// Maps each connection to its authenticated identity and the single room it
/// is bound to, and tracks per-room presence for connected members only.
/// Rooms materialize on first join and are pruned when their presence set
/// empties; each room's state sits behind its own lock, reached only through
/// this registry. No ambient global table, no process-wide lock held across
/// room work.
#[derive(Debug, Clone)]
pub struct Rooms {
	inner: Arc<Mutex<Registry>>,
	hub: ConnectionHub,
}

/// A connection's current binding within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
	pub user_id: UserId,
	pub display_name: String,
	pub room_id: RoomId,
}

#[derive(Debug, Default)]
struct Registry {
	sessions: HashMap<ConnectionId, Session>,
	rooms: HashMap<RoomId, Arc<Mutex<RoomState>>>,
}

#[derive(Debug, Clone)]
struct Session {
	identity: Identity,
	room: Option<RoomId>,
}

#[derive(Debug)]
struct RoomState {
	/// Set under the room lock when the last connection leaves; a holder of a
	/// stale `Arc` that observes this must re-resolve through the registry.
	pruned: bool,

	/// Presence entries in insertion order, one per distinct user.
	presence: Vec<PresenceEntry>,

	/// Connections currently bound to the room, in join order.
	conns: Vec<ConnectionId>,

	/// Per-room pipeline lock serializing persist+broadcast sequences.
	sequence: Arc<Mutex<()>>,
}

impl Default for RoomState {
	fn default() -> Self {
		Self {
			pruned: false,
			presence: Vec::new(),
			conns: Vec::new(),
			sequence: Arc::new(Mutex::new(())),
		}
	}
}

#[derive(Debug)]
struct PresenceEntry {
	user_id: UserId,
	display_name: String,

	/// Live connections this user has bound to the room.
	connections: u32,
}

impl Rooms {
	pub fn new(hub: ConnectionHub) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Registry::default())),
			hub,
		}
	}

	/// Record an authenticated connection with no room binding yet.
	pub async fn register(&self, conn: ConnectionId, identity: Identity) {
		let mut reg = self.inner.lock().await;
		reg.sessions.insert(conn, Session { identity, room: None });
	}

	/// Bind a connection to a room, registering presence, and return the
	/// updated roster. Joining while bound to another room releases the old
	/// binding first. Unknown rooms materialize on first join. Returns `None`
	/// for unregistered connections.
	pub async fn join(&self, conn: ConnectionId, room_id: RoomId) -> Option<Vec<String>> {
		let (identity, prior_room) = {
			let reg = self.inner.lock().await;
			let session = reg.sessions.get(&conn)?;
			(session.identity.clone(), session.room.clone())
		};

		if prior_room.as_ref() == Some(&room_id) {
			return Some(self.roster(&room_id).await);
		}

		if let Some(old) = prior_room {
			self.leave_room_inner(conn, &identity.user_id, &old).await;
		}

		loop {
			let state = {
				let mut reg = self.inner.lock().await;
				Arc::clone(reg.rooms.entry(room_id.clone()).or_default())
			};

			let mut guard = state.lock().await;
			if guard.pruned {
				drop(guard);
				self.remove_if_same(&room_id, &state).await;
				continue;
			}

			guard.conns.push(conn);
			upsert_presence(&mut guard.presence, &identity);
			let roster = roster_of(&guard.presence);
			let conns = guard.conns.clone();
			drop(guard);

			{
				let mut reg = self.inner.lock().await;
				if let Some(session) = reg.sessions.get_mut(&conn) {
					session.room = Some(room_id.clone());
				}
			}

			debug!(%conn, room = %room_id, user = %identity.user_id, "room join");
			self.hub
				.send_to_many(&conns, ServerEvent::RosterUpdated { users: roster.clone() })
				.await;

			return Some(roster);
		}
	}

	/// Explicitly release a connection's room binding, keeping the session.
	pub async fn leave_room(&self, conn: ConnectionId) -> Option<Binding> {
		let (identity, room_id) = {
			let mut reg = self.inner.lock().await;
			let session = reg.sessions.get_mut(&conn)?;
			let room = session.room.take()?;
			(session.identity.clone(), room)
		};

		self.leave_room_inner(conn, &identity.user_id, &room_id).await;
		Some(Binding {
			user_id: identity.user_id,
			display_name: identity.display_name,
			room_id,
		})
	}

	/// Drop a connection's session entirely (disconnect).
	pub async fn remove(&self, conn: ConnectionId) -> Option<Identity> {
		let (identity, room) = {
			let mut reg = self.inner.lock().await;
			let session = reg.sessions.remove(&conn)?;
			(session.identity, session.room)
		};

		if let Some(room_id) = room {
			self.leave_room_inner(conn, &identity.user_id, &room_id).await;
		}
		Some(identity)
	}

	/// The connection's identity, when registered.
	pub async fn identity(&self, conn: ConnectionId) -> Option<Identity> {
		let reg = self.inner.lock().await;
		reg.sessions.get(&conn).map(|s| s.identity.clone())
	}

	/// The connection's room binding, when bound.
	pub async fn binding(&self, conn: ConnectionId) -> Option<Binding> {
		let reg = self.inner.lock().await;
		let session = reg.sessions.get(&conn)?;
		let room_id = session.room.clone()?;
		Some(Binding {
			user_id: session.identity.user_id.clone(),
			display_name: session.identity.display_name.clone(),
			room_id,
		})
	}

	/// Connections currently bound to a room, computed from live state.
	pub async fn connections(&self, room_id: &RoomId) -> Vec<ConnectionId> {
		let Some(state) = self.room_state(room_id).await else {
			return Vec::new();
		};

		let guard = state.lock().await;
		if guard.pruned { Vec::new() } else { guard.conns.clone() }
	}

	/// Current roster: display names in presence insertion order.
	pub async fn roster(&self, room_id: &RoomId) -> Vec<String> {
		let Some(state) = self.room_state(room_id).await else {
			return Vec::new();
		};

		let guard = state.lock().await;
		if guard.pruned { Vec::new() } else { roster_of(&guard.presence) }
	}

	/// The room's pipeline lock, used to serialize persist+broadcast
	/// sequences per room. `None` when the room does not exist.
	pub(crate) async fn sequence(&self, room_id: &RoomId) -> Option<Arc<Mutex<()>>> {
		let state = self.room_state(room_id).await?;

		let guard = state.lock().await;
		if guard.pruned {
			None
		} else {
			Some(Arc::clone(&guard.sequence))
		}
	}

	/// Number of live room entries.
	pub async fn room_count(&self) -> usize {
		let reg = self.inner.lock().await;
		reg.rooms.len()
	}

	async fn room_state(&self, room_id: &RoomId) -> Option<Arc<Mutex<RoomState>>> {
		let reg = self.inner.lock().await;
		reg.rooms.get(room_id).cloned()
	}

	async fn leave_room_inner(&self, conn: ConnectionId, user_id: &UserId, room_id: &RoomId) {
		let Some(state) = self.room_state(room_id).await else {
			return;
		};

		let mut guard = state.lock().await;
		if guard.pruned {
			return;
		}

		let before = guard.conns.len();
		guard.conns.retain(|c| *c != conn);
		if guard.conns.len() == before {
			return;
		}

		let user_removed = release_presence(&mut guard.presence, user_id);
		let now_empty = guard.conns.is_empty();
		if now_empty {
			guard.pruned = true;
		}
		let conns = guard.conns.clone();
		let roster = roster_of(&guard.presence);
		drop(guard);

		if now_empty {
			self.remove_if_same(room_id, &state).await;
			debug!(room = %room_id, "room pruned (presence empty)");
			return;
		}

		if user_removed {
			self.hub
				.send_to_many(&conns, ServerEvent::RosterUpdated { users: roster })
				.await;
		}
	}

	/// Remove the registry entry only if it still points at `state`; a fresh
	/// entry created after the prune mark is left alone.
	async fn remove_if_same(&self, room_id: &RoomId, state: &Arc<Mutex<RoomState>>) {
		let mut reg = self.inner.lock().await;
		let same = reg.rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, state));
		if same {
			reg.rooms.remove(room_id);
		}
	}
}

/// Add one connection's worth of presence. Duplicate userIds collapse to a
/// single entry with last-write display name.
fn upsert_presence(presence: &mut Vec<PresenceEntry>, identity: &Identity) {
	match presence.iter_mut().find(|e| e.user_id == identity.user_id) {
		Some(entry) => {
			entry.connections = entry.connections.saturating_add(1);
			if entry.display_name != identity.display_name {
				entry.display_name = identity.display_name.clone();
			}
		}
		None => presence.push(PresenceEntry {
			user_id: identity.user_id.clone(),
			display_name: identity.display_name.clone(),
			connections: 1,
		}),
	}
}

/// Release one connection's worth of presence. Returns whether the user left
/// the roster entirely; multi-session users stay present until their last
/// connection goes.
fn release_presence(presence: &mut Vec<PresenceEntry>, user_id: &UserId) -> bool {
	let Some(idx) = presence.iter().position(|e| &e.user_id == user_id) else {
		return false;
	};

	let entry = &mut presence[idx];
	entry.connections = entry.connections.saturating_sub(1);
	if entry.connections == 0 {
		presence.remove(idx);
		true
	} else {
		false
	}
}

fn roster_of(presence: &[PresenceEntry]) -> Vec<String> {
	presence.iter().map(|e| e.display_name.clone()).collect()
}
