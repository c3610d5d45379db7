#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use syncroom_domain::{ASSISTANT_DISPLAY_NAME, ConnectionId, MessageId, RoomId, UserId};
use syncroom_protocol::{ChatBroadcast, ServerEvent};
use syncroom_store::{AssistantHistoryStore, CompletionClient, HistorySender, MessageStore, NewMessage};
use tracing::{debug, warn};

use crate::server::hub::ConnectionHub;
use crate::server::rooms::Rooms;
use crate::server::router::enrich;
use crate::util::time::unix_ms_now;

/// Neutral reply surfaced when the completion collaborator fails or times
/// out.
pub const FAILURE_REPLY: &str = "Sorry, I'm having trouble connecting to my circuits right now.";

/// Settings for the assistant relay.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
	/// Reserved prefix routing a room message to the assistant.
	pub directive: String,

	/// Most recent direct-channel turns sent to the collaborator.
	pub history_limit: usize,

	/// Upper bound on one completion call; expiry forces typing-stop and the
	/// neutral failure reply.
	pub completion_timeout: Duration,
}

impl Default for AssistantConfig {
	fn default() -> Self {
		Self {
			directive: "@ai".to_string(),
			history_limit: 20,
			completion_timeout: Duration::from_secs(30),
		}
	}
}

/// Interleaves the automated assistant into the message stream.
///
/// The completion call always runs in a spawned task so the router keeps
/// handling other messages; the eventual reply re-enters the room pipeline by
/// arrival time like any other message.
#[derive(Clone)]
pub struct AssistantRelay {
	rooms: Rooms,
	hub: ConnectionHub,
	messages: Arc<dyn MessageStore>,
	history: Arc<dyn AssistantHistoryStore>,
	completion: Arc<dyn CompletionClient>,
	cfg: AssistantConfig,
}

impl AssistantRelay {
	pub fn new(
		rooms: Rooms,
		hub: ConnectionHub,
		messages: Arc<dyn MessageStore>,
		history: Arc<dyn AssistantHistoryStore>,
		completion: Arc<dyn CompletionClient>,
		cfg: AssistantConfig,
	) -> Self {
		Self {
			rooms,
			hub,
			messages,
			history,
			completion,
			cfg,
		}
	}

	/// Whether a message body begins with the directive token.
	pub fn is_directive(&self, body: &str) -> bool {
		matches_directive(&self.cfg.directive, body)
	}

	/// Kick off an assistant turn for a room message. Emits typing-start,
	/// then hands the completion call to a spawned task; any connected member
	/// may trigger this and invocations are not rate limited.
	pub async fn trigger_room(&self, conn: ConnectionId, room_id: RoomId, body: &str) {
		let prompt = strip_directive(&self.cfg.directive, body);

		metrics::counter!("syncroom_server_assistant_requests_total").increment(1);
		self.broadcast_typing(&room_id, true).await;

		let relay = self.clone();
		tokio::spawn(async move {
			relay.run_completion(conn, room_id, prompt).await;
		});
	}

	/// One turn of a user's direct conversation with the assistant. Errors
	/// from the collaborator degrade to the neutral failure line; only store
	/// failures propagate.
	pub async fn direct_message(&self, user: &UserId, body: &str) -> anyhow::Result<String> {
		let prompt = if self.is_directive(body) {
			strip_directive(&self.cfg.directive, body)
		} else {
			body.trim().to_string()
		};

		let mut history = self
			.history
			.recent(user, self.cfg.history_limit)
			.await
			.context("load assistant history")?;

		// The collaborator requires the first turn to be user-authored; a
		// leading assistant turn in the retained window is dropped.
		while history.first().is_some_and(|e| e.sender == HistorySender::Assistant) {
			history.remove(0);
		}

		self.history
			.record(user, HistorySender::User, body.trim())
			.await
			.context("record user turn")?;

		let outcome = tokio::time::timeout(self.cfg.completion_timeout, self.completion.complete(&prompt, &history)).await;

		match outcome {
			Ok(Ok(reply)) if !reply.trim().is_empty() => {
				self.history
					.record(user, HistorySender::Assistant, reply.trim())
					.await
					.context("record assistant turn")?;
				Ok(reply)
			}
			Ok(Ok(reply)) => {
				debug!(user = %user, "empty assistant reply on direct channel");
				Ok(reply)
			}
			Ok(Err(e)) => {
				metrics::counter!("syncroom_server_assistant_failures_total").increment(1);
				warn!(user = %user, error = %e, "assistant completion failed on direct channel");
				Ok(FAILURE_REPLY.to_string())
			}
			Err(_) => {
				metrics::counter!("syncroom_server_assistant_failures_total").increment(1);
				warn!(user = %user, "assistant completion timed out on direct channel");
				Ok(FAILURE_REPLY.to_string())
			}
		}
	}

	async fn run_completion(&self, conn: ConnectionId, room_id: RoomId, prompt: String) {
		let outcome = tokio::time::timeout(self.cfg.completion_timeout, self.completion.complete(&prompt, &[])).await;

		match outcome {
			Ok(Ok(reply)) if !reply.trim().is_empty() => {
				if let Err(e) = self.publish_turn(&room_id, reply).await {
					warn!(room = %room_id, error = %e, "failed to publish assistant turn");
					self.send_failure(conn, &room_id).await;
				}
			}
			Ok(Ok(_)) => {
				debug!(room = %room_id, "empty assistant reply, nothing broadcast");
			}
			Ok(Err(e)) => {
				metrics::counter!("syncroom_server_assistant_failures_total").increment(1);
				warn!(room = %room_id, error = %e, "assistant completion failed");
				self.send_failure(conn, &room_id).await;
			}
			Err(_) => {
				metrics::counter!("syncroom_server_assistant_failures_total").increment(1);
				warn!(room = %room_id, timeout_ms = self.cfg.completion_timeout.as_millis() as u64, "assistant completion timed out");
				self.send_failure(conn, &room_id).await;
			}
		}

		// Typing-stop fires regardless of how the completion went.
		self.broadcast_typing(&room_id, false).await;
	}

	/// Persist and broadcast the reply as a synthetic participant message,
	/// interleaved under the room's pipeline lock.
	async fn publish_turn(&self, room_id: &RoomId, reply: String) -> anyhow::Result<()> {
		let sequence = self.rooms.sequence(room_id).await;
		let _room_order = match &sequence {
			Some(seq) => Some(seq.lock().await),
			None => None,
		};

		let stored = self
			.messages
			.create(NewMessage {
				room_id: room_id.clone(),
				author_id: None,
				author_name: ASSISTANT_DISPLAY_NAME.to_string(),
				body: reply,
				parent_id: None,
				is_code_snippet: false,
				language: None,
			})
			.await
			.context("persist assistant turn")?;

		let conns = self.rooms.connections(room_id).await;
		self.hub
			.send_to_many(&conns, ServerEvent::ChatMessage(enrich(&stored, None)))
			.await;
		Ok(())
	}

	/// The neutral failure line goes to the acting connection only and is not
	/// persisted; the rest of the room sees only typing-start/stop.
	async fn send_failure(&self, conn: ConnectionId, room_id: &RoomId) {
		let payload = ChatBroadcast {
			id: MessageId::new_v4(),
			room_id: room_id.clone(),
			user_id: None,
			username: ASSISTANT_DISPLAY_NAME.to_string(),
			body: FAILURE_REPLY.to_string(),
			parent_id: None,
			parent_preview: None,
			is_code_snippet: false,
			language: None,
			created_at: unix_ms_now(),
		};

		self.hub.send_to(conn, ServerEvent::ChatMessage(payload)).await;
	}

	async fn broadcast_typing(&self, room_id: &RoomId, is_typing: bool) {
		let conns = self.rooms.connections(room_id).await;
		self.hub
			.send_to_many(
				&conns,
				ServerEvent::Typing {
					user_id: None,
					display_name: ASSISTANT_DISPLAY_NAME.to_string(),
					is_typing,
				},
			)
			.await;
	}
}

/// Whether `body`, ignoring leading whitespace and ASCII case, begins with
/// the directive token at a word boundary.
pub(crate) fn matches_directive(token: &str, body: &str) -> bool {
	let mut chars = body.trim_start().chars();

	for expected in token.chars() {
		match chars.next() {
			Some(c) if c.eq_ignore_ascii_case(&expected) => {}
			_ => return false,
		}
	}

	match chars.next() {
		None => true,
		Some(c) => !c.is_alphanumeric(),
	}
}

/// The body with the directive token removed and surrounding whitespace
/// trimmed. Bodies not carrying the token are only trimmed.
pub(crate) fn strip_directive(token: &str, body: &str) -> String {
	let trimmed = body.trim_start();
	if !matches_directive(token, body) {
		return trimmed.trim_end().to_string();
	}

	trimmed
		.chars()
		.skip(token.chars().count())
		.collect::<String>()
		.trim()
		.to_string()
}
