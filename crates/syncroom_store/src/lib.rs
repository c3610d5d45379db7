#![forbid(unsafe_code)]

//! Collaborator seams consumed by the realtime core.
//!
//! Role and message history live in external storage; the core reads them
//! through these traits with no local write caching, so authorization is
//! always checked against current committed state. Two backends ship here:
//! [`memory`] for tests and demos, [`sqlite`] over `sqlx`.

pub mod memory;
pub mod sqlite;

use core::fmt;
use core::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use syncroom_domain::{MessageId, ParseIdError, Role, RoomId, UserId};

/// Authenticated identity resolved from a connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub user_id: UserId,
	pub display_name: String,
}

/// Transport-level handshake data handed to the identity provider.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
	pub user_id: Option<String>,
	pub display_name: Option<String>,
	pub auth_token: Option<String>,
}

/// Stored group membership row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
	pub user_id: UserId,
	pub display_name: String,
	pub role: Role,
}

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub room_id: RoomId,

	/// `None` for assistant-authored messages.
	pub author_id: Option<UserId>,
	pub author_name: String,

	pub body: String,
	pub parent_id: Option<MessageId>,
	pub is_code_snippet: bool,
	pub language: Option<String>,
}

/// A persisted message as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub author_id: Option<UserId>,
	pub author_name: String,
	pub body: String,
	pub parent_id: Option<MessageId>,
	pub is_code_snippet: bool,
	pub language: Option<String>,

	/// Unix milliseconds.
	pub created_at: i64,
}

/// Stored reaction row, unique per `(message_id, user_id, emoji)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
	pub message_id: MessageId,
	pub user_id: UserId,
	pub emoji: String,
	pub created_at: i64,
}

/// Who authored a direct-assistant-channel turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySender {
	User,
	Assistant,
}

impl HistorySender {
	pub const fn as_str(self) -> &'static str {
		match self {
			HistorySender::User => "user",
			HistorySender::Assistant => "assistant",
		}
	}
}

impl fmt::Display for HistorySender {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for HistorySender {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"user" => Ok(HistorySender::User),
			"assistant" | "ai" => Ok(HistorySender::Assistant),
			other => Err(ParseIdError::InvalidFormat(other.to_string())),
		}
	}
}

/// One turn of a user's direct conversation with the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
	pub sender: HistorySender,
	pub body: String,
	pub created_at: i64,
}

/// Resolves the authenticated user behind a connection handshake.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	/// `Ok(None)` means unauthenticated; the connection must be refused.
	async fn current_user(&self, handshake: &Handshake) -> anyhow::Result<Option<Identity>>;
}

/// Authoritative group-membership store. Roles are read per check and never
/// cached by the core, so role changes take effect on the next action.
#[async_trait]
pub trait MembershipStore: Send + Sync {
	async fn role_of(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Role>>;

	async fn is_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<bool> {
		Ok(self.role_of(room, user).await?.is_some())
	}

	async fn members_of(&self, room: &RoomId) -> anyhow::Result<Vec<Member>>;

	async fn set_role(&self, room: &RoomId, user: &UserId, role: Role) -> anyhow::Result<()>;

	/// Remove a member (leave or kick). Returns whether a row existed.
	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<bool>;
}

/// Persistent message store.
#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn create(&self, message: NewMessage) -> anyhow::Result<StoredMessage>;

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<StoredMessage>>;

	/// Returns whether a row was deleted; a second delete of the same id
	/// observes `false`.
	async fn delete(&self, id: &MessageId) -> anyhow::Result<bool>;

	/// All messages of a room ordered by `created_at` ascending.
	async fn find_by_room(&self, room: &RoomId) -> anyhow::Result<Vec<StoredMessage>>;
}

/// Persistent reaction store with upsert semantics.
#[async_trait]
pub trait ReactionStore: Send + Sync {
	/// Idempotent: returns `true` only when the triple was newly inserted.
	async fn upsert(&self, message: &MessageId, user: &UserId, emoji: &str) -> anyhow::Result<bool>;

	async fn find_by_rooms(&self, rooms: &[RoomId]) -> anyhow::Result<Vec<Reaction>>;
}

/// Per-user direct-assistant conversation log.
#[async_trait]
pub trait AssistantHistoryStore: Send + Sync {
	async fn record(&self, user: &UserId, sender: HistorySender, body: &str) -> anyhow::Result<()>;

	/// The most recent `limit` turns, returned oldest-first.
	async fn recent(&self, user: &UserId, limit: usize) -> anyhow::Result<Vec<HistoryEntry>>;
}

/// External completion collaborator backing the assistant relay.
#[async_trait]
pub trait CompletionClient: Send + Sync {
	/// `history` is oldest-first and, when non-empty, starts with a user turn.
	async fn complete(&self, prompt: &str, history: &[HistoryEntry]) -> anyhow::Result<String>;
}

/// Current Unix time in milliseconds.
#[inline]
pub(crate) fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}
