#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context as _, anyhow};
use syncroom_domain::ConnectionId;
use syncroom_protocol::ClientEvent;
use syncroom_store::{
	AssistantHistoryStore, CompletionClient, Handshake, Identity, IdentityProvider, MembershipStore, MessageStore,
	ReactionStore,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::server::assistant::AssistantRelay;
use crate::server::hub::{ConnectionHub, OutboundItem};
use crate::server::rooms::Rooms;
use crate::server::router::MessageRouter;
use crate::server::signaling::{SignalKind, SignalingRelay};

/// External collaborators the core consumes.
pub struct CoreStores {
	pub identity: Arc<dyn IdentityProvider>,
	pub membership: Arc<dyn MembershipStore>,
	pub messages: Arc<dyn MessageStore>,
	pub reactions: Arc<dyn ReactionStore>,
	pub history: Arc<dyn AssistantHistoryStore>,
	pub completion: Arc<dyn CompletionClient>,
}

/// A freshly authenticated connection: its id, resolved identity, and the
/// outbound event stream the embedder drains into its transport.
pub struct ConnectionSession {
	pub conn_id: ConnectionId,
	pub identity: Identity,
	pub events: mpsc::Receiver<OutboundItem>,
}

/// The wired realtime core. One instance serves every room; the embedder
/// calls [`CoreServices::connect`] per transport connection, feeds inbound
/// events through [`CoreServices::handle_event`], and calls
/// [`CoreServices::disconnect`] when the transport goes away.
pub struct CoreServices {
	hub: ConnectionHub,
	rooms: Rooms,
	router: MessageRouter,
	assistant: AssistantRelay,
	signaling: SignalingRelay,
	identity: Arc<dyn IdentityProvider>,
	next_conn_id: AtomicU64,
}

impl CoreServices {
	pub fn new(stores: CoreStores, cfg: CoreConfig) -> Self {
		let hub = ConnectionHub::new(cfg.hub);
		let rooms = Rooms::new(hub.clone());
		let router = MessageRouter::new(
			rooms.clone(),
			hub.clone(),
			Arc::clone(&stores.membership),
			Arc::clone(&stores.messages),
			Arc::clone(&stores.reactions),
			cfg.router,
		);
		let assistant = AssistantRelay::new(
			rooms.clone(),
			hub.clone(),
			Arc::clone(&stores.messages),
			Arc::clone(&stores.history),
			Arc::clone(&stores.completion),
			cfg.assistant,
		);
		let signaling = SignalingRelay::new(hub.clone());

		Self {
			hub,
			rooms,
			router,
			assistant,
			signaling,
			identity: stores.identity,
			next_conn_id: AtomicU64::new(1),
		}
	}

	/// Authenticate a transport connection and attach its outbound queue.
	/// Unauthenticated handshakes are refused.
	pub async fn connect(&self, handshake: &Handshake) -> anyhow::Result<ConnectionSession> {
		let identity = self
			.identity
			.current_user(handshake)
			.await
			.context("resolve connection identity")?
			.ok_or_else(|| anyhow!("unauthenticated connection"))?;

		let conn_id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
		let events = self.hub.attach(conn_id).await;
		self.rooms.register(conn_id, identity.clone()).await;

		metrics::counter!("syncroom_server_connections_total").increment(1);
		info!(%conn_id, user = %identity.user_id, "connection authenticated");

		Ok(ConnectionSession {
			conn_id,
			identity,
			events,
		})
	}

	/// Dispatch one inbound event from a connection. Failures here are scoped
	/// to the one event; the connection and its room stay healthy.
	pub async fn handle_event(&self, conn: ConnectionId, event: ClientEvent) -> anyhow::Result<()> {
		match event {
			ClientEvent::JoinRoom { room_id } => {
				if self.rooms.join(conn, room_id).await.is_none() {
					debug!(%conn, "joinRoom from unregistered connection");
				}
			}

			ClientEvent::ChatMessage {
				body,
				parent_id,
				is_code_snippet,
				language,
			} => {
				let stored = self
					.router
					.handle_chat(conn, &body, parent_id, is_code_snippet, language)
					.await?;

				if let Some(stored) = stored
					&& self.assistant.is_directive(&stored.body)
				{
					self.assistant.trigger_room(conn, stored.room_id.clone(), &stored.body).await;
				}
			}

			ClientEvent::AddReaction { message_id, emoji } => {
				self.router.add_reaction(conn, message_id, &emoji).await?;
			}

			ClientEvent::DeleteMessage { message_id } => {
				self.router.delete_message(conn, message_id).await?;
			}

			ClientEvent::Typing { is_typing } => {
				self.router.handle_typing(conn, is_typing).await;
			}

			ClientEvent::JoinCall { room } => {
				self.signaling.join_call(conn, room).await;
			}

			ClientEvent::Offer { target_id, payload } => {
				self.signaling.forward(conn, SignalKind::Offer, target_id, payload).await;
			}

			ClientEvent::Answer { target_id, payload } => {
				self.signaling.forward(conn, SignalKind::Answer, target_id, payload).await;
			}

			ClientEvent::IceCandidate { target_id, payload } => {
				self.signaling
					.forward(conn, SignalKind::IceCandidate, target_id, payload)
					.await;
			}

			ClientEvent::LeaveCall { room } => {
				self.signaling.leave_call(conn, room).await;
			}
		}

		Ok(())
	}

	/// Transport-level disconnect: release call and room bindings (notifying
	/// peers and the roster) and drop the outbound queue. Effects already
	/// broadcast to other connections are not rolled back.
	pub async fn disconnect(&self, conn: ConnectionId) {
		self.signaling.disconnect(conn).await;
		let _ = self.rooms.remove(conn).await;
		self.hub.detach(conn).await;
		debug!(%conn, "connection closed");
	}

	pub fn rooms(&self) -> &Rooms {
		&self.rooms
	}

	pub fn hub(&self) -> &ConnectionHub {
		&self.hub
	}

	pub fn router(&self) -> &MessageRouter {
		&self.router
	}

	pub fn assistant(&self) -> &AssistantRelay {
		&self.assistant
	}

	pub fn signaling(&self) -> &SignalingRelay {
		&self.signaling
	}
}
