#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use syncroom_domain::{ConnectionId, Role, RoomId, UserId};
use syncroom_protocol::ServerEvent;
use syncroom_store::memory::MemoryStore;
use syncroom_store::{Identity, MessageStore, ReactionStore};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::hub::{ConnectionHub, HubConfig, OutboundItem};
use crate::server::rooms::Rooms;
use crate::server::router::{MessageRouter, RouterConfig};

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

struct Fixture {
	hub: ConnectionHub,
	rooms: Rooms,
	store: Arc<MemoryStore>,
	router: MessageRouter,
}

fn setup() -> Fixture {
	let hub = ConnectionHub::new(HubConfig::default());
	let rooms = Rooms::new(hub.clone());
	let store = Arc::new(MemoryStore::new());
	let router = MessageRouter::new(
		rooms.clone(),
		hub.clone(),
		store.clone(),
		store.clone(),
		store.clone(),
		RouterConfig::default(),
	);

	Fixture {
		hub,
		rooms,
		store,
		router,
	}
}

impl Fixture {
	async fn join(&self, conn: ConnectionId, uid: &str, name: &str, room_id: &RoomId) -> mpsc::Receiver<OutboundItem> {
		let rx = self.hub.attach(conn).await;
		self.rooms
			.register(
				conn,
				Identity {
					user_id: user(uid),
					display_name: name.to_string(),
				},
			)
			.await;
		self.rooms.join(conn, room_id.clone()).await.expect("join");
		rx
	}
}

/// Skip events until one matches, bounded per receive.
async fn recv_matching<F>(rx: &mut mpsc::Receiver<OutboundItem>, mut pred: F) -> ServerEvent
where
	F: FnMut(&ServerEvent) -> bool,
{
	loop {
		let item = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected a matching event within timeout")
			.expect("channel open");
		if let OutboundItem::Event(ev) = item
			&& pred(&ev)
		{
			return *ev;
		}
	}
}

async fn assert_no_chat_event(rx: &mut mpsc::Receiver<OutboundItem>) {
	loop {
		match timeout(Duration::from_millis(50), rx.recv()).await {
			Err(_) => return,
			Ok(Some(OutboundItem::Event(ev))) => {
				assert!(
					!matches!(*ev, ServerEvent::ChatMessage(_) | ServerEvent::MessageDeleted { .. }),
					"unexpected chat event: {ev:?}"
				);
			}
			Ok(Some(_)) => {}
			Ok(None) => return,
		}
	}
}

#[tokio::test]
async fn empty_body_drops_without_persistence_or_broadcast() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("u1"), "Alice", Role::Member).await;
	let mut rx = fx.join(ConnectionId(1), "u1", "Alice", &g).await;

	let stored = fx
		.router
		.handle_chat(ConnectionId(1), "   \n\t", None, false, None)
		.await
		.expect("handle_chat");

	assert!(stored.is_none());
	assert!(fx.store.find_by_room(&g).await.expect("find").is_empty());
	assert_no_chat_event(&mut rx).await;
}

#[tokio::test]
async fn post_from_non_member_drops_silently() {
	let fx = setup();
	let g = room("g1");
	let mut rx = fx.join(ConnectionId(1), "stranger", "Sam", &g).await;

	let stored = fx
		.router
		.handle_chat(ConnectionId(1), "hello?", None, false, None)
		.await
		.expect("handle_chat");

	assert!(stored.is_none());
	assert!(fx.store.find_by_room(&g).await.expect("find").is_empty());
	assert_no_chat_event(&mut rx).await;
}

#[tokio::test]
async fn broadcast_carries_parent_preview() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("u1"), "Alice", Role::Member).await;
	fx.store.upsert_member(g.clone(), user("u2"), "Bob", Role::Member).await;
	let _rx_a = fx.join(ConnectionId(1), "u1", "Alice", &g).await;
	let mut rx_b = fx.join(ConnectionId(2), "u2", "Bob", &g).await;

	let first = fx
		.router
		.handle_chat(ConnectionId(1), "original message", None, false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	let reply = fx
		.router
		.handle_chat(ConnectionId(2), "replying", Some(first.id), false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	let ev = recv_matching(&mut rx_b, |ev| {
		matches!(ev, ServerEvent::ChatMessage(m) if m.id == reply.id)
	})
	.await;
	let ServerEvent::ChatMessage(payload) = ev else { unreachable!() };

	assert_eq!(payload.parent_id, Some(first.id));
	let preview = payload.parent_preview.expect("preview present");
	assert_eq!(preview.username, "Alice");
	assert_eq!(preview.body, "original message");
}

#[tokio::test]
async fn deleted_parent_degrades_to_no_preview() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("u1"), "Alice", Role::Member).await;
	let mut rx = fx.join(ConnectionId(1), "u1", "Alice", &g).await;

	let first = fx
		.router
		.handle_chat(ConnectionId(1), "soon gone", None, false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	assert!(fx.store.delete(&first.id).await.expect("delete"));

	let reply = fx
		.router
		.handle_chat(ConnectionId(1), "replying into the void", Some(first.id), false, None)
		.await
		.expect("handle_chat")
		.expect("reply still goes through");

	let ev = recv_matching(&mut rx, |ev| {
		matches!(ev, ServerEvent::ChatMessage(m) if m.id == reply.id)
	})
	.await;
	let ServerEvent::ChatMessage(payload) = ev else { unreachable!() };

	assert_eq!(payload.parent_id, Some(first.id));
	assert!(payload.parent_preview.is_none());
}

#[tokio::test]
async fn member_cannot_delete_someone_elses_message() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("u1"), "Alice", Role::Member).await;
	fx.store.upsert_member(g.clone(), user("u2"), "Bob", Role::Member).await;
	let _rx_a = fx.join(ConnectionId(1), "u1", "Alice", &g).await;
	let mut rx_b = fx.join(ConnectionId(2), "u2", "Bob", &g).await;

	let msg = fx
		.router
		.handle_chat(ConnectionId(1), "mine", None, false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	fx.router.delete_message(ConnectionId(2), msg.id).await.expect("delete attempt");

	assert!(fx.store.get(&msg.id).await.expect("get").is_some(), "message must survive");
	// Denial is silent: no deletion event reaches the room.
	let _ = recv_matching(&mut rx_b, |ev| matches!(ev, ServerEvent::ChatMessage(_))).await;
	assert_no_chat_event(&mut rx_b).await;
}

#[tokio::test]
async fn admin_deleting_members_message_broadcasts_to_all() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("x"), "Xena", Role::Admin).await;
	fx.store.upsert_member(g.clone(), user("y"), "Yuri", Role::Member).await;
	let _rx_x = fx.join(ConnectionId(1), "x", "Xena", &g).await;
	let mut rx_y = fx.join(ConnectionId(2), "y", "Yuri", &g).await;

	let msg = fx
		.router
		.handle_chat(ConnectionId(2), "delete me if you dare", None, false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	fx.router.delete_message(ConnectionId(1), msg.id).await.expect("delete");

	assert!(fx.store.get(&msg.id).await.expect("get").is_none());

	// The author sees the deletion too.
	let ev = recv_matching(&mut rx_y, |ev| matches!(ev, ServerEvent::MessageDeleted { .. })).await;
	let ServerEvent::MessageDeleted { message_id } = ev else { unreachable!() };
	assert_eq!(message_id, msg.id);
}

#[tokio::test]
async fn concurrent_deletes_broadcast_at_most_once() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("u1"), "Alice", Role::Member).await;
	fx.store.upsert_member(g.clone(), user("u2"), "Amir", Role::Admin).await;
	let _rx_a = fx.join(ConnectionId(1), "u1", "Alice", &g).await;
	let mut rx_b = fx.join(ConnectionId(2), "u2", "Amir", &g).await;

	let msg = fx
		.router
		.handle_chat(ConnectionId(1), "contested", None, false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	let (author, moderator) = tokio::join!(
		fx.router.delete_message(ConnectionId(1), msg.id),
		fx.router.delete_message(ConnectionId(2), msg.id),
	);
	author.expect("author delete");
	moderator.expect("moderator delete");

	let _ = recv_matching(&mut rx_b, |ev| matches!(ev, ServerEvent::MessageDeleted { .. })).await;
	assert_no_chat_event(&mut rx_b).await;
}

#[tokio::test]
async fn duplicate_reactions_store_and_broadcast_once() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("u1"), "Alice", Role::Member).await;
	fx.store.upsert_member(g.clone(), user("u2"), "Bob", Role::Member).await;
	let _rx_a = fx.join(ConnectionId(1), "u1", "Alice", &g).await;
	let mut rx_b = fx.join(ConnectionId(2), "u2", "Bob", &g).await;

	let msg = fx
		.router
		.handle_chat(ConnectionId(1), "react to this", None, false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	fx.router.add_reaction(ConnectionId(2), msg.id, "👍").await.expect("react");
	fx.router.add_reaction(ConnectionId(2), msg.id, "👍").await.expect("react again");

	let stored = fx.store.find_by_rooms(std::slice::from_ref(&g)).await.expect("reactions");
	assert_eq!(stored.len(), 1);

	let ev = recv_matching(&mut rx_b, |ev| matches!(ev, ServerEvent::ReactionAdded { .. })).await;
	let ServerEvent::ReactionAdded { message_id, user_id, emoji } = ev else {
		unreachable!()
	};
	assert_eq!(message_id, msg.id);
	assert_eq!(user_id, user("u2"));
	assert_eq!(emoji, "👍");

	match timeout(Duration::from_millis(50), rx_b.recv()).await {
		Err(_) => {}
		Ok(Some(OutboundItem::Event(ev))) => {
			assert!(!matches!(*ev, ServerEvent::ReactionAdded { .. }), "duplicate broadcast")
		}
		Ok(other) => panic!("unexpected item: {other:?}"),
	}
}

#[tokio::test]
async fn reactions_to_foreign_room_messages_drop() {
	let fx = setup();
	let g1 = room("g1");
	let g2 = room("g2");
	fx.store.upsert_member(g1.clone(), user("u1"), "Alice", Role::Member).await;
	fx.store.upsert_member(g2.clone(), user("u2"), "Bob", Role::Member).await;
	let _rx_a = fx.join(ConnectionId(1), "u1", "Alice", &g1).await;
	let _rx_b = fx.join(ConnectionId(2), "u2", "Bob", &g2).await;

	let msg = fx
		.router
		.handle_chat(ConnectionId(1), "in room one", None, false, None)
		.await
		.expect("handle_chat")
		.expect("accepted");

	fx.router.add_reaction(ConnectionId(2), msg.id, "👀").await.expect("react");

	assert!(fx.store.find_by_rooms(std::slice::from_ref(&g1)).await.expect("reactions").is_empty());
}

#[tokio::test]
async fn typing_passthrough_carries_sender_identity() {
	let fx = setup();
	let g = room("g1");
	fx.store.upsert_member(g.clone(), user("u1"), "Alice", Role::Member).await;
	fx.store.upsert_member(g.clone(), user("u2"), "Bob", Role::Member).await;
	let _rx_a = fx.join(ConnectionId(1), "u1", "Alice", &g).await;
	let mut rx_b = fx.join(ConnectionId(2), "u2", "Bob", &g).await;

	fx.router.handle_typing(ConnectionId(1), true).await;

	let ev = recv_matching(&mut rx_b, |ev| matches!(ev, ServerEvent::Typing { .. })).await;
	let ServerEvent::Typing {
		user_id,
		display_name,
		is_typing,
	} = ev
	else {
		unreachable!()
	};
	assert_eq!(user_id, Some(user("u1")));
	assert_eq!(display_name, "Alice");
	assert!(is_typing);
}
