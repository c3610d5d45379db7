#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use syncroom_domain::{ConnectionId, MessageId};
use syncroom_protocol::{ChatBroadcast, ParentPreview, ServerEvent};
use syncroom_store::{MembershipStore, MessageStore, NewMessage, ReactionStore, StoredMessage};
use tracing::debug;

use crate::server::authz::{AuthDecision, RoomAction, authorize};
use crate::server::hub::ConnectionHub;
use crate::server::rooms::Rooms;

/// Settings for the message router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	pub debug_log_events: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self { debug_log_events: false }
	}
}

/// Validates, authorizes and persists inbound chat events, then fans the
/// enriched payload out to every connection currently bound to the room.
///
/// Each room's persist+broadcast sequence runs under that room's pipeline
/// lock, so intra-room broadcast order equals acceptance order and two rooms
/// make progress independently.
#[derive(Clone)]
pub struct MessageRouter {
	rooms: Rooms,
	hub: ConnectionHub,
	membership: Arc<dyn MembershipStore>,
	messages: Arc<dyn MessageStore>,
	reactions: Arc<dyn ReactionStore>,
	cfg: RouterConfig,
}

impl MessageRouter {
	pub fn new(
		rooms: Rooms,
		hub: ConnectionHub,
		membership: Arc<dyn MembershipStore>,
		messages: Arc<dyn MessageStore>,
		reactions: Arc<dyn ReactionStore>,
		cfg: RouterConfig,
	) -> Self {
		Self {
			rooms,
			hub,
			membership,
			messages,
			reactions,
			cfg,
		}
	}

	/// Route one inbound chat message. Returns the stored message when it was
	/// accepted; validation and authorization failures drop silently.
	pub async fn handle_chat(
		&self,
		conn: ConnectionId,
		body: &str,
		parent_id: Option<MessageId>,
		is_code_snippet: bool,
		language: Option<String>,
	) -> anyhow::Result<Option<StoredMessage>> {
		metrics::counter!("syncroom_server_messages_in_total").increment(1);

		let Some(binding) = self.rooms.binding(conn).await else {
			self.drop_event(conn, "chat message from connection with no room binding");
			return Ok(None);
		};

		if body.trim().is_empty() {
			self.drop_event(conn, "empty chat message body");
			return Ok(None);
		}

		let Some(sequence) = self.rooms.sequence(&binding.room_id).await else {
			return Ok(None);
		};
		let _room_order = sequence.lock().await;

		match authorize(self.membership.as_ref(), &binding.room_id, &binding.user_id, RoomAction::PostMessage).await? {
			AuthDecision::Authorized(_) => {}
			decision => {
				debug!(%conn, room = %binding.room_id, ?decision, "chat message rejected");
				metrics::counter!("syncroom_server_messages_dropped_total").increment(1);
				return Ok(None);
			}
		}

		// A missing or deleted parent degrades to no preview; the reply still
		// goes through.
		let parent_preview = match parent_id {
			Some(parent) => self
				.messages
				.get(&parent)
				.await
				.context("resolve parent message")?
				.filter(|p| p.room_id == binding.room_id)
				.map(|p| ParentPreview {
					username: p.author_name,
					body: p.body,
				}),
			None => None,
		};

		let stored = self
			.messages
			.create(NewMessage {
				room_id: binding.room_id.clone(),
				author_id: Some(binding.user_id.clone()),
				author_name: binding.display_name.clone(),
				body: body.to_string(),
				parent_id,
				is_code_snippet,
				language,
			})
			.await
			.context("persist chat message")?;

		if self.cfg.debug_log_events {
			debug!(%conn, room = %binding.room_id, id = %stored.id, "chat message accepted");
		}

		self.broadcast(&stored, parent_preview).await;
		Ok(Some(stored))
	}

	/// Delete a message by id. Authorization uses the stored author as the
	/// `is_author` input; denial and not-found are silent no-ops so nothing
	/// leaks to the rest of the room.
	pub async fn delete_message(&self, conn: ConnectionId, message_id: MessageId) -> anyhow::Result<()> {
		let Some(binding) = self.rooms.binding(conn).await else {
			return Ok(());
		};

		let Some(sequence) = self.rooms.sequence(&binding.room_id).await else {
			return Ok(());
		};
		let _room_order = sequence.lock().await;

		let Some(stored) = self.messages.get(&message_id).await.context("load message for delete")? else {
			return Ok(());
		};
		if stored.room_id != binding.room_id {
			return Ok(());
		}

		let action = RoomAction::DeleteMessage {
			author: stored.author_id.as_ref(),
		};
		match authorize(self.membership.as_ref(), &binding.room_id, &binding.user_id, action).await? {
			AuthDecision::Authorized(_) => {}
			decision => {
				debug!(%conn, room = %binding.room_id, id = %message_id, ?decision, "delete rejected");
				return Ok(());
			}
		}

		// Under the room lock a concurrent delete of the same id observes the
		// row already gone and stays silent.
		if !self.messages.delete(&message_id).await.context("delete message")? {
			return Ok(());
		}

		metrics::counter!("syncroom_server_messages_deleted_total").increment(1);
		let conns = self.rooms.connections(&binding.room_id).await;
		self.hub
			.send_to_many(&conns, ServerEvent::MessageDeleted { message_id })
			.await;
		Ok(())
	}

	/// Upsert a reaction and fan out the triple. Room membership is the only
	/// authorization; duplicate triples collapse to a single broadcast.
	pub async fn add_reaction(&self, conn: ConnectionId, message_id: MessageId, emoji: &str) -> anyhow::Result<()> {
		let Some(binding) = self.rooms.binding(conn).await else {
			return Ok(());
		};

		if emoji.trim().is_empty() {
			self.drop_event(conn, "empty reaction emoji");
			return Ok(());
		}

		if !self
			.membership
			.is_member(&binding.room_id, &binding.user_id)
			.await
			.context("check reaction membership")?
		{
			debug!(%conn, room = %binding.room_id, "reaction from non-member");
			return Ok(());
		}

		let Some(sequence) = self.rooms.sequence(&binding.room_id).await else {
			return Ok(());
		};
		let _room_order = sequence.lock().await;

		// Reactions to unknown or foreign-room messages degrade silently.
		let target = self.messages.get(&message_id).await.context("load reaction target")?;
		if !target.is_some_and(|m| m.room_id == binding.room_id) {
			return Ok(());
		}

		let inserted = self
			.reactions
			.upsert(&message_id, &binding.user_id, emoji)
			.await
			.context("upsert reaction")?;
		if !inserted {
			return Ok(());
		}

		let conns = self.rooms.connections(&binding.room_id).await;
		self.hub
			.send_to_many(
				&conns,
				ServerEvent::ReactionAdded {
					message_id,
					user_id: binding.user_id,
					emoji: emoji.to_string(),
				},
			)
			.await;
		Ok(())
	}

	/// Rebroadcast a typing notification to the sender's room. Ephemeral: no
	/// persistence, no ordering against the message pipeline.
	pub async fn handle_typing(&self, conn: ConnectionId, is_typing: bool) {
		let Some(binding) = self.rooms.binding(conn).await else {
			return;
		};

		let conns = self.rooms.connections(&binding.room_id).await;
		self.hub
			.send_to_many(
				&conns,
				ServerEvent::Typing {
					user_id: Some(binding.user_id),
					display_name: binding.display_name,
					is_typing,
				},
			)
			.await;
	}

	async fn broadcast(&self, stored: &StoredMessage, parent_preview: Option<ParentPreview>) {
		let conns = self.rooms.connections(&stored.room_id).await;
		self.hub
			.send_to_many(&conns, ServerEvent::ChatMessage(enrich(stored, parent_preview)))
			.await;
	}

	fn drop_event(&self, conn: ConnectionId, reason: &'static str) {
		metrics::counter!("syncroom_server_messages_dropped_total").increment(1);
		debug!(%conn, reason, "dropping inbound event");
	}
}

/// Shape a stored message into the enriched broadcast payload.
pub(crate) fn enrich(stored: &StoredMessage, parent_preview: Option<ParentPreview>) -> ChatBroadcast {
	ChatBroadcast {
		id: stored.id,
		room_id: stored.room_id.clone(),
		user_id: stored.author_id.clone(),
		username: stored.author_name.clone(),
		body: stored.body.clone(),
		parent_id: stored.parent_id,
		parent_preview,
		is_code_snippet: stored.is_code_snippet,
		language: stored.language.clone(),
		created_at: stored.created_at,
	}
}
