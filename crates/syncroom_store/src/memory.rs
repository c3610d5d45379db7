#![forbid(unsafe_code)]

//! In-memory backends used by tests and demo embeddings.

use std::collections::HashMap;

use async_trait::async_trait;
use syncroom_domain::{MessageId, Role, RoomId, UserId};
use tokio::sync::Mutex;

use crate::{
	AssistantHistoryStore, Handshake, HistoryEntry, HistorySender, Identity, IdentityProvider, Member, MembershipStore,
	MessageStore, NewMessage, Reaction, ReactionStore, StoredMessage, unix_ms_now,
};

/// Identity provider that trusts the handshake's own claims, the way the
/// original transport forwarded `userId`/`username` query parameters.
#[derive(Debug, Default)]
pub struct TrustedIdentityProvider;

#[async_trait]
impl IdentityProvider for TrustedIdentityProvider {
	async fn current_user(&self, handshake: &Handshake) -> anyhow::Result<Option<Identity>> {
		let (Some(raw_id), Some(name)) = (handshake.user_id.as_deref(), handshake.display_name.as_deref()) else {
			return Ok(None);
		};

		let Ok(user_id) = raw_id.parse::<UserId>() else {
			return Ok(None);
		};
		if name.trim().is_empty() {
			return Ok(None);
		}

		Ok(Some(Identity {
			user_id,
			display_name: name.to_string(),
		}))
	}
}

/// Single in-memory store implementing every persistence seam.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	members: HashMap<RoomId, Vec<Member>>,
	messages: Vec<StoredMessage>,
	reactions: Vec<Reaction>,
	history: HashMap<UserId, Vec<HistoryEntry>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed or update a membership row (upsert by user id).
	pub async fn upsert_member(&self, room: RoomId, user_id: UserId, display_name: impl Into<String>, role: Role) {
		let mut inner = self.inner.lock().await;
		let members = inner.members.entry(room).or_default();
		let display_name = display_name.into();

		match members.iter_mut().find(|m| m.user_id == user_id) {
			Some(existing) => {
				existing.display_name = display_name;
				existing.role = role;
			}
			None => members.push(Member {
				user_id,
				display_name,
				role,
			}),
		}
	}
}

#[async_trait]
impl MembershipStore for MemoryStore {
	async fn role_of(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Role>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.members
			.get(room)
			.and_then(|members| members.iter().find(|m| &m.user_id == user))
			.map(|m| m.role))
	}

	async fn members_of(&self, room: &RoomId) -> anyhow::Result<Vec<Member>> {
		let inner = self.inner.lock().await;
		Ok(inner.members.get(room).cloned().unwrap_or_default())
	}

	async fn set_role(&self, room: &RoomId, user: &UserId, role: Role) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if let Some(members) = inner.members.get_mut(room)
			&& let Some(member) = members.iter_mut().find(|m| &m.user_id == user)
		{
			member.role = role;
		}
		Ok(())
	}

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.members.get_mut(room) else {
			return Ok(false);
		};

		let before = members.len();
		members.retain(|m| &m.user_id != user);
		Ok(members.len() != before)
	}
}

#[async_trait]
impl MessageStore for MemoryStore {
	async fn create(&self, message: NewMessage) -> anyhow::Result<StoredMessage> {
		let stored = StoredMessage {
			id: MessageId::new_v4(),
			room_id: message.room_id,
			author_id: message.author_id,
			author_name: message.author_name,
			body: message.body,
			parent_id: message.parent_id,
			is_code_snippet: message.is_code_snippet,
			language: message.language,
			created_at: unix_ms_now(),
		};

		let mut inner = self.inner.lock().await;
		inner.messages.push(stored.clone());
		Ok(stored)
	}

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<StoredMessage>> {
		let inner = self.inner.lock().await;
		Ok(inner.messages.iter().find(|m| &m.id == id).cloned())
	}

	async fn delete(&self, id: &MessageId) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		let before = inner.messages.len();
		inner.messages.retain(|m| &m.id != id);
		Ok(inner.messages.len() != before)
	}

	async fn find_by_room(&self, room: &RoomId) -> anyhow::Result<Vec<StoredMessage>> {
		let inner = self.inner.lock().await;
		let mut found = inner
			.messages
			.iter()
			.filter(|m| &m.room_id == room)
			.cloned()
			.collect::<Vec<_>>();
		found.sort_by_key(|m| m.created_at);
		Ok(found)
	}
}

#[async_trait]
impl ReactionStore for MemoryStore {
	async fn upsert(&self, message: &MessageId, user: &UserId, emoji: &str) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		let exists = inner
			.reactions
			.iter()
			.any(|r| &r.message_id == message && &r.user_id == user && r.emoji == emoji);
		if exists {
			return Ok(false);
		}

		inner.reactions.push(Reaction {
			message_id: *message,
			user_id: user.clone(),
			emoji: emoji.to_string(),
			created_at: unix_ms_now(),
		});
		Ok(true)
	}

	async fn find_by_rooms(&self, rooms: &[RoomId]) -> anyhow::Result<Vec<Reaction>> {
		let inner = self.inner.lock().await;
		let message_ids = inner
			.messages
			.iter()
			.filter(|m| rooms.contains(&m.room_id))
			.map(|m| m.id)
			.collect::<Vec<_>>();

		Ok(inner
			.reactions
			.iter()
			.filter(|r| message_ids.contains(&r.message_id))
			.cloned()
			.collect())
	}
}

#[async_trait]
impl AssistantHistoryStore for MemoryStore {
	async fn record(&self, user: &UserId, sender: HistorySender, body: &str) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.history.entry(user.clone()).or_default().push(HistoryEntry {
			sender,
			body: body.to_string(),
			created_at: unix_ms_now(),
		});
		Ok(())
	}

	async fn recent(&self, user: &UserId, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
		let inner = self.inner.lock().await;
		let Some(entries) = inner.history.get(user) else {
			return Ok(Vec::new());
		};

		let start = entries.len().saturating_sub(limit);
		Ok(entries[start..].to_vec())
	}
}
