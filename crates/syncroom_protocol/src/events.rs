#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncroom_domain::{CallRoomId, ConnectionId, MessageId, RoomId, UserId};

/// Events a connection may submit to the core.
///
/// Signaling payloads (`offer`/`answer`/`iceCandidate`) are carried as opaque
/// JSON; the core forwards them verbatim and never inspects SDP/ICE content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClientEvent {
	#[serde(rename_all = "camelCase")]
	JoinRoom { room_id: RoomId },

	#[serde(rename_all = "camelCase")]
	ChatMessage {
		body: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		parent_id: Option<MessageId>,
		#[serde(default)]
		is_code_snippet: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		language: Option<String>,
	},

	#[serde(rename_all = "camelCase")]
	AddReaction { message_id: MessageId, emoji: String },

	#[serde(rename_all = "camelCase")]
	DeleteMessage { message_id: MessageId },

	#[serde(rename_all = "camelCase")]
	Typing { is_typing: bool },

	#[serde(rename_all = "camelCase")]
	JoinCall { room: CallRoomId },

	#[serde(rename_all = "camelCase")]
	Offer { target_id: ConnectionId, payload: Value },

	#[serde(rename_all = "camelCase")]
	Answer { target_id: ConnectionId, payload: Value },

	#[serde(rename_all = "camelCase")]
	IceCandidate { target_id: ConnectionId, payload: Value },

	#[serde(rename_all = "camelCase")]
	LeaveCall { room: CallRoomId },
}

/// Events the core delivers to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerEvent {
	/// Current room roster, display names in presence insertion order.
	RosterUpdated { users: Vec<String> },

	/// A chat message enriched with author and parent denormalizations.
	ChatMessage(ChatBroadcast),

	#[serde(rename_all = "camelCase")]
	ReactionAdded {
		message_id: MessageId,
		user_id: UserId,
		emoji: String,
	},

	#[serde(rename_all = "camelCase")]
	MessageDeleted { message_id: MessageId },

	/// Typing state of a room participant. `user_id` is absent for the
	/// synthetic assistant participant.
	#[serde(rename_all = "camelCase")]
	Typing {
		#[serde(skip_serializing_if = "Option::is_none")]
		user_id: Option<UserId>,
		display_name: String,
		is_typing: bool,
	},

	#[serde(rename_all = "camelCase")]
	NewPeer { peer_id: ConnectionId },

	#[serde(rename_all = "camelCase")]
	ExistingPeers { peers: Vec<ConnectionId> },

	#[serde(rename_all = "camelCase")]
	Offer { from_id: ConnectionId, payload: Value },

	#[serde(rename_all = "camelCase")]
	Answer { from_id: ConnectionId, payload: Value },

	#[serde(rename_all = "camelCase")]
	IceCandidate { from_id: ConnectionId, payload: Value },

	#[serde(rename_all = "camelCase")]
	PeerDisconnected { peer_id: ConnectionId },
}

/// Enriched chat message payload fanned out to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
	pub id: MessageId,
	pub room_id: RoomId,

	/// Absent for assistant-authored messages.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_id: Option<UserId>,
	pub username: String,

	pub body: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_id: Option<MessageId>,
	/// Denormalized echo of the parent message; `None` when the parent was
	/// deleted or never existed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_preview: Option<ParentPreview>,

	#[serde(default)]
	pub is_code_snippet: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,

	pub created_at: i64,
}

/// Parent-message echo embedded in threaded replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentPreview {
	pub username: String,
	pub body: String,
}
