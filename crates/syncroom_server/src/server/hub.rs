#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use syncroom_domain::ConnectionId;
use syncroom_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Connection-keyed fan-out substrate. Every live connection owns one bounded
/// outbound queue; room broadcast and unicast both address queues by
/// [`ConnectionId`].
#[derive(Debug, Clone)]
pub struct ConnectionHub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

/// Configuration for `ConnectionHub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued outbound items per connection.
	pub queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items emitted on a connection's outbound stream.
#[derive(Debug, Clone)]
pub enum OutboundItem {
	Event(Box<ServerEvent>),

	/// Indicates the connection was lagging and events were dropped.
	Lagged { dropped: u64 },
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<ConnectionId, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	tx: mpsc::Sender<OutboundItem>,

	/// Drops not yet reported to this connection via a `Lagged` marker.
	pending_lag: u64,
}

impl ConnectionHub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection's outbound queue. Re-attaching the same id
	/// replaces the previous queue.
	pub async fn attach(&self, conn: ConnectionId) -> mpsc::Receiver<OutboundItem> {
		let (tx, rx) = mpsc::channel(self.cfg.queue_capacity);

		let mut inner = self.inner.lock().await;
		inner.conns.insert(conn, Subscriber { tx, pending_lag: 0 });
		metrics::gauge!("syncroom_server_active_connections").set(inner.conns.len() as f64);

		if self.cfg.debug_logs {
			debug!(%conn, total = inner.conns.len(), "hub: attached connection");
		}

		rx
	}

	/// Remove a connection's queue.
	pub async fn detach(&self, conn: ConnectionId) {
		let mut inner = self.inner.lock().await;
		inner.conns.remove(&conn);
		metrics::gauge!("syncroom_server_active_connections").set(inner.conns.len() as f64);
	}

	/// Unicast one event. Returns whether the target exists and the event was
	/// queued; unknown targets are a no-op.
	pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
		let mut inner = self.inner.lock().await;
		let delivered = deliver(&mut inner, conn, &event);
		prune_closed(&mut inner);
		delivered
	}

	/// Deliver one event to each listed connection, in list order.
	pub async fn send_to_many(&self, conns: &[ConnectionId], event: ServerEvent) {
		let mut inner = self.inner.lock().await;
		for conn in conns {
			deliver(&mut inner, *conn, &event);
		}
		prune_closed(&mut inner);
	}

	/// Number of currently attached connections.
	pub async fn connected_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.conns.len()
	}
}

fn deliver(inner: &mut Inner, conn: ConnectionId, event: &ServerEvent) -> bool {
	let Some(sub) = inner.conns.get_mut(&conn) else {
		return false;
	};

	match sub.tx.try_send(OutboundItem::Event(Box::new(event.clone()))) {
		Ok(()) => {
			metrics::counter!("syncroom_server_events_out_total").increment(1);

			if sub.pending_lag > 0
				&& sub
					.tx
					.try_send(OutboundItem::Lagged {
						dropped: sub.pending_lag,
					})
					.is_ok()
			{
				sub.pending_lag = 0;
			}
			true
		}
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("syncroom_server_events_dropped_total").increment(1);
			sub.pending_lag = sub.pending_lag.saturating_add(1);
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => false,
	}
}

fn prune_closed(inner: &mut Inner) {
	inner.conns.retain(|_, sub| !sub.tx.is_closed());
}
