#![forbid(unsafe_code)]

//! SQLite-backed persistence over `sqlx`.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use syncroom_domain::{MessageId, Role, RoomId, UserId};
use tracing::debug;

use crate::{
	AssistantHistoryStore, HistoryEntry, HistorySender, Member, MembershipStore, MessageStore, NewMessage, Reaction,
	ReactionStore, StoredMessage, unix_ms_now,
};

/// SQLite store implementing every persistence seam over one pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	/// Connect and run embedded migrations. `database_url` must use the
	/// `sqlite:` scheme (`sqlite::memory:` works for tests).
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (expected sqlite:)"));
		}

		// An in-memory SQLite database exists per connection; the pool must
		// hold exactly one connection or later queries see an empty database.
		let mut options = sqlx::sqlite::SqlitePoolOptions::new();
		if database_url.contains(":memory:") {
			options = options.max_connections(1).min_connections(1);
		}

		let pool = options.connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		debug!(in_memory = database_url.contains(":memory:"), "sqlite store ready");
		Ok(Self { pool })
	}

	pub fn pool(&self) -> &sqlx::SqlitePool {
		&self.pool
	}
}

type MessageRow = (
	String,
	String,
	Option<String>,
	String,
	String,
	Option<String>,
	bool,
	Option<String>,
	i64,
);

fn message_from_row(row: MessageRow) -> anyhow::Result<StoredMessage> {
	let (id, room_id, author_id, author_name, body, parent_id, is_code_snippet, language, created_at) = row;

	Ok(StoredMessage {
		id: id.parse::<MessageId>().context("parse message id")?,
		room_id: RoomId::new(room_id).context("parse room id")?,
		author_id: author_id.map(UserId::new).transpose().context("parse author id")?,
		author_name,
		body,
		parent_id: parent_id
			.map(|p| p.parse::<MessageId>())
			.transpose()
			.context("parse parent id")?,
		is_code_snippet,
		language,
		created_at,
	})
}

#[async_trait]
impl MembershipStore for SqliteStore {
	async fn role_of(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Role>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT role FROM group_members WHERE room_id = ? AND user_id = ?")
			.bind(room.as_str())
			.bind(user.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select member role")?;

		row.map(|(role,)| role.parse::<Role>().context("parse stored role")).transpose()
	}

	async fn members_of(&self, room: &RoomId) -> anyhow::Result<Vec<Member>> {
		let rows: Vec<(String, String, String)> =
			sqlx::query_as("SELECT user_id, display_name, role FROM group_members WHERE room_id = ? ORDER BY rowid")
				.bind(room.as_str())
				.fetch_all(&self.pool)
				.await
				.context("select members")?;

		rows.into_iter()
			.map(|(user_id, display_name, role)| {
				Ok(Member {
					user_id: UserId::new(user_id).context("parse member user id")?,
					display_name,
					role: role.parse::<Role>().context("parse member role")?,
				})
			})
			.collect()
	}

	async fn set_role(&self, room: &RoomId, user: &UserId, role: Role) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO group_members (room_id, user_id, display_name, role, created_at) VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT(room_id, user_id) DO UPDATE SET role = excluded.role",
		)
		.bind(room.as_str())
		.bind(user.as_str())
		.bind(user.as_str())
		.bind(role.as_str())
		.bind(unix_ms_now())
		.execute(&self.pool)
		.await
		.context("upsert member role")?;

		Ok(())
	}

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<bool> {
		let result = sqlx::query("DELETE FROM group_members WHERE room_id = ? AND user_id = ?")
			.bind(room.as_str())
			.bind(user.as_str())
			.execute(&self.pool)
			.await
			.context("delete member")?;

		Ok(result.rows_affected() > 0)
	}
}

#[async_trait]
impl MessageStore for SqliteStore {
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

		sqlx::query(
			"INSERT INTO messages (id, room_id, author_id, author_name, body, parent_id, is_code_snippet, language, created_at) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(stored.id.to_string())
		.bind(stored.room_id.as_str())
		.bind(stored.author_id.as_ref().map(|u| u.as_str().to_string()))
		.bind(&stored.author_name)
		.bind(&stored.body)
		.bind(stored.parent_id.map(|p| p.to_string()))
		.bind(stored.is_code_snippet)
		.bind(&stored.language)
		.bind(stored.created_at)
		.execute(&self.pool)
		.await
		.context("insert message")?;

		Ok(stored)
	}

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<StoredMessage>> {
		let row: Option<MessageRow> = sqlx::query_as(
			"SELECT id, room_id, author_id, author_name, body, parent_id, is_code_snippet, language, created_at \
			FROM messages WHERE id = ?",
		)
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await
		.context("select message")?;

		row.map(message_from_row).transpose()
	}

	async fn delete(&self, id: &MessageId) -> anyhow::Result<bool> {
		let result = sqlx::query("DELETE FROM messages WHERE id = ?")
			.bind(id.to_string())
			.execute(&self.pool)
			.await
			.context("delete message")?;

		Ok(result.rows_affected() > 0)
	}

	async fn find_by_room(&self, room: &RoomId) -> anyhow::Result<Vec<StoredMessage>> {
		let rows: Vec<MessageRow> = sqlx::query_as(
			"SELECT id, room_id, author_id, author_name, body, parent_id, is_code_snippet, language, created_at \
			FROM messages WHERE room_id = ? ORDER BY created_at, rowid",
		)
		.bind(room.as_str())
		.fetch_all(&self.pool)
		.await
		.context("select room messages")?;

		rows.into_iter().map(message_from_row).collect()
	}
}

#[async_trait]
impl ReactionStore for SqliteStore {
	async fn upsert(&self, message: &MessageId, user: &UserId, emoji: &str) -> anyhow::Result<bool> {
		let result = sqlx::query(
			"INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?) \
			ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
		)
		.bind(message.to_string())
		.bind(user.as_str())
		.bind(emoji)
		.bind(unix_ms_now())
		.execute(&self.pool)
		.await
		.context("upsert reaction")?;

		Ok(result.rows_affected() > 0)
	}

	async fn find_by_rooms(&self, rooms: &[RoomId]) -> anyhow::Result<Vec<Reaction>> {
		if rooms.is_empty() {
			return Ok(Vec::new());
		}

		let placeholders = vec!["?"; rooms.len()].join(", ");
		let sql = format!(
			"SELECT r.message_id, r.user_id, r.emoji, r.created_at \
			FROM reactions r JOIN messages m ON m.id = r.message_id \
			WHERE m.room_id IN ({placeholders}) ORDER BY r.created_at, r.rowid"
		);

		let mut query = sqlx::query_as::<_, (String, String, String, i64)>(&sql);
		for room in rooms {
			query = query.bind(room.as_str());
		}

		let rows = query.fetch_all(&self.pool).await.context("select room reactions")?;

		rows.into_iter()
			.map(|(message_id, user_id, emoji, created_at)| {
				Ok(Reaction {
					message_id: message_id.parse::<MessageId>().context("parse reaction message id")?,
					user_id: UserId::new(user_id).context("parse reaction user id")?,
					emoji,
					created_at,
				})
			})
			.collect()
	}
}

#[async_trait]
impl AssistantHistoryStore for SqliteStore {
	async fn record(&self, user: &UserId, sender: HistorySender, body: &str) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO assistant_history (user_id, sender, body, created_at) VALUES (?, ?, ?, ?)")
			.bind(user.as_str())
			.bind(sender.as_str())
			.bind(body)
			.bind(unix_ms_now())
			.execute(&self.pool)
			.await
			.context("insert assistant history")?;

		Ok(())
	}

	async fn recent(&self, user: &UserId, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
		let rows: Vec<(String, String, i64)> = sqlx::query_as(
			"SELECT sender, body, created_at FROM assistant_history WHERE user_id = ? ORDER BY id DESC LIMIT ?",
		)
		.bind(user.as_str())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.context("select assistant history")?;

		let mut entries = rows
			.into_iter()
			.map(|(sender, body, created_at)| {
				Ok(HistoryEntry {
					sender: sender.parse::<HistorySender>().context("parse history sender")?,
					body,
					created_at,
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		entries.reverse();
		Ok(entries)
	}
}
