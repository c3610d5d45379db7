#![forbid(unsafe_code)]

use std::time::Duration;

use syncroom_domain::{ConnectionId, RoomId, UserId};
use syncroom_protocol::ServerEvent;
use syncroom_store::Identity;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::hub::{ConnectionHub, HubConfig, OutboundItem};
use crate::server::rooms::Rooms;

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn identity(id: &str, name: &str) -> Identity {
	Identity {
		user_id: UserId::new(id).expect("valid UserId"),
		display_name: name.to_string(),
	}
}

fn setup() -> (ConnectionHub, Rooms) {
	let hub = ConnectionHub::new(HubConfig::default());
	let rooms = Rooms::new(hub.clone());
	(hub, rooms)
}

async fn next_event(rx: &mut mpsc::Receiver<OutboundItem>) -> ServerEvent {
	let item = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open");
	match item {
		OutboundItem::Event(ev) => *ev,
		other => panic!("expected event, got: {other:?}"),
	}
}

async fn next_roster(rx: &mut mpsc::Receiver<OutboundItem>) -> Vec<String> {
	match next_event(rx).await {
		ServerEvent::RosterUpdated { users } => users,
		other => panic!("expected rosterUpdated, got: {other:?}"),
	}
}

#[tokio::test]
async fn join_returns_roster_in_insertion_order() {
	let (hub, rooms) = setup();

	let a = ConnectionId(1);
	let b = ConnectionId(2);
	let _rx_a = hub.attach(a).await;
	let _rx_b = hub.attach(b).await;
	rooms.register(a, identity("u1", "Alice")).await;
	rooms.register(b, identity("u2", "Bob")).await;

	let roster = rooms.join(a, room("g1")).await.expect("registered connection");
	assert_eq!(roster, vec!["Alice".to_string()]);

	let roster = rooms.join(b, room("g1")).await.expect("registered connection");
	assert_eq!(roster, vec!["Alice".to_string(), "Bob".to_string()]);
}

#[tokio::test]
async fn duplicate_user_collapses_to_last_write_display_name() {
	let (hub, rooms) = setup();

	let a = ConnectionId(1);
	let b = ConnectionId(2);
	let _rx_a = hub.attach(a).await;
	let _rx_b = hub.attach(b).await;
	rooms.register(a, identity("u1", "Alice")).await;
	rooms.register(b, identity("u1", "Alice (tablet)")).await;

	rooms.join(a, room("g1")).await.expect("join");
	let roster = rooms.join(b, room("g1")).await.expect("join");

	assert_eq!(roster, vec!["Alice (tablet)".to_string()]);
}

#[tokio::test]
async fn multi_session_presence_survives_single_disconnect() {
	let (hub, rooms) = setup();

	let tab1 = ConnectionId(1);
	let tab2 = ConnectionId(2);
	let other = ConnectionId(3);
	let _rx_1 = hub.attach(tab1).await;
	let _rx_2 = hub.attach(tab2).await;
	let mut rx_other = hub.attach(other).await;

	rooms.register(tab1, identity("u1", "Alice")).await;
	rooms.register(tab2, identity("u1", "Alice")).await;
	rooms.register(other, identity("u2", "Bob")).await;

	rooms.join(tab1, room("g1")).await.expect("join");
	rooms.join(tab2, room("g1")).await.expect("join");
	rooms.join(other, room("g1")).await.expect("join");

	// Drain Bob's rosters from the joins above.
	let _ = next_roster(&mut rx_other).await;

	let _ = rooms.remove(tab1).await;
	assert_eq!(rooms.roster(&room("g1")).await, vec!["Alice".to_string(), "Bob".to_string()]);

	let _ = rooms.remove(tab2).await;
	assert_eq!(rooms.roster(&room("g1")).await, vec!["Bob".to_string()]);

	// Bob sees the roster change only once the user fully left.
	let roster = next_roster(&mut rx_other).await;
	assert_eq!(roster, vec!["Bob".to_string()]);
	assert!(
		timeout(Duration::from_millis(50), rx_other.recv()).await.is_err(),
		"no extra roster broadcast expected for the first disconnect"
	);
}

#[tokio::test]
async fn room_prunes_when_presence_empties() {
	let (hub, rooms) = setup();

	let a = ConnectionId(1);
	let _rx_a = hub.attach(a).await;
	rooms.register(a, identity("u1", "Alice")).await;

	rooms.join(a, room("g1")).await.expect("join");
	assert_eq!(rooms.room_count().await, 1);

	rooms.leave_room(a).await.expect("bound connection");
	assert_eq!(rooms.room_count().await, 0);
	assert!(rooms.connections(&room("g1")).await.is_empty());

	// Rooms materialize again on the next join.
	let roster = rooms.join(a, room("g1")).await.expect("rejoin");
	assert_eq!(roster, vec!["Alice".to_string()]);
	assert_eq!(rooms.room_count().await, 1);
}

#[tokio::test]
async fn joining_another_room_releases_the_previous_binding() {
	let (hub, rooms) = setup();

	let a = ConnectionId(1);
	let b = ConnectionId(2);
	let _rx_a = hub.attach(a).await;
	let mut rx_b = hub.attach(b).await;
	rooms.register(a, identity("u1", "Alice")).await;
	rooms.register(b, identity("u2", "Bob")).await;

	rooms.join(b, room("g1")).await.expect("join");
	let _ = next_roster(&mut rx_b).await;

	rooms.join(a, room("g1")).await.expect("join");
	let _ = next_roster(&mut rx_b).await;

	rooms.join(a, room("g2")).await.expect("rebind");

	let roster = next_roster(&mut rx_b).await;
	assert_eq!(roster, vec!["Bob".to_string()]);

	assert_eq!(rooms.binding(a).await.map(|b| b.room_id), Some(room("g2")));
	assert_eq!(rooms.connections(&room("g2")).await, vec![a]);
}

#[tokio::test]
async fn roster_broadcast_reaches_everyone_in_the_room() {
	let (hub, rooms) = setup();

	let a = ConnectionId(1);
	let b = ConnectionId(2);
	let mut rx_a = hub.attach(a).await;
	let _rx_b = hub.attach(b).await;
	rooms.register(a, identity("u1", "Alice")).await;
	rooms.register(b, identity("u2", "Bob")).await;

	rooms.join(a, room("g1")).await.expect("join");
	let roster = next_roster(&mut rx_a).await;
	assert_eq!(roster, vec!["Alice".to_string()]);

	rooms.join(b, room("g1")).await.expect("join");
	let roster = next_roster(&mut rx_a).await;
	assert_eq!(roster, vec!["Alice".to_string(), "Bob".to_string()]);
}

#[tokio::test]
async fn two_rooms_do_not_observe_each_other() {
	let (hub, rooms) = setup();

	let a = ConnectionId(1);
	let b = ConnectionId(2);
	let mut rx_a = hub.attach(a).await;
	let _rx_b = hub.attach(b).await;
	rooms.register(a, identity("u1", "Alice")).await;
	rooms.register(b, identity("u2", "Bob")).await;

	rooms.join(a, room("g1")).await.expect("join");
	let _ = next_roster(&mut rx_a).await;

	rooms.join(b, room("g2")).await.expect("join");

	assert!(
		timeout(Duration::from_millis(50), rx_a.recv()).await.is_err(),
		"a join in another room must not reach this room's connections"
	);
}
