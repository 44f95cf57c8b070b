//! SQLite storage backend for sync-store.

use crate::{MessageStore, RecoveryReport, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tidings_sync_core::{apply, Effect, Transition};
use tidings_sync_types::{
    CachedRange, Content, DbId, DeleteTarget, Message, MessageState, Seq, SeqRange, Subscription,
    SyncError, Timestamp, Topic, TopicName, User, UserId,
};
use tokio::sync::Mutex;

/// SQLite-based message store.
///
/// Uses WAL mode for concurrent reads. Read-modify-write operations are
/// serialized by a writer lock and run inside one transaction each.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given database path.
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        Self::with_pool(pool).await
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StoreError::Database)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A single connection that is never recycled keeps the database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                name TEXT PRIMARY KEY,
                recv_seq INTEGER,
                read_seq INTEGER,
                max_seq INTEGER,
                all_loaded INTEGER NOT NULL DEFAULT 0,
                attached INTEGER NOT NULL DEFAULT 0,
                online INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                seq INTEGER,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                ts INTEGER NOT NULL,
                status INTEGER NOT NULL,
                pending_delete INTEGER NOT NULL DEFAULT 0,
                UNIQUE(topic, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                topic TEXT NOT NULL,
                user TEXT NOT NULL,
                recv_seq INTEGER,
                read_seq INTEGER,
                mode TEXT NOT NULL DEFAULT '',
                updated INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (topic, user)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                uid TEXT PRIMARY KEY,
                public TEXT NOT NULL,
                updated INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_topic_status ON messages(topic, status)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    async fn insert_message(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
        state: MessageState,
    ) -> Result<DbId, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        ensure_topic(&mut tx, topic).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO messages (topic, seq, sender, content, ts, status)
            VALUES (?1, NULL, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(topic.as_str())
        .bind(from.as_str())
        .bind(content.to_json()?)
        .bind(to_sql(ts)?)
        .bind(state.code())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(DbId::new(result.last_insert_rowid()))
    }

    async fn delete_matching(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        transition: Transition,
    ) -> Result<u64, StoreError> {
        let Some(bounds) = target.bounds() else {
            return Ok(0);
        };

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, topic, seq, sender, content, ts, status, pending_delete
            FROM messages
            WHERE topic = ?1 AND seq BETWEEN ?2 AND ?3
            ORDER BY seq ASC
            "#,
        )
        .bind(topic.as_str())
        .bind(to_sql(bounds.low().value())?)
        .bind(to_sql(bounds.high().value())?)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        let mut changed = 0;
        for row in rows {
            let mut msg = Message::try_from(row)?;
            if !msg.seq.is_some_and(|seq| target.contains(seq)) {
                continue;
            }
            if apply(&mut msg, transition.clone())? == Effect::Updated {
                write_message(&mut tx, &msg).await?;
                changed += 1;
            }
        }

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(changed)
    }

    async fn advance_topic_watermark(
        &self,
        name: &TopicName,
        column: Watermark,
        seq: Seq,
    ) -> Result<bool, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        ensure_topic(&mut tx, name).await?;

        let sql = match column {
            Watermark::Recv => {
                "UPDATE topics SET recv_seq = ?2 \
                 WHERE name = ?1 AND (recv_seq IS NULL OR recv_seq < ?2)"
            }
            Watermark::Read => {
                "UPDATE topics SET read_seq = ?2 \
                 WHERE name = ?1 AND (read_seq IS NULL OR read_seq < ?2)"
            }
        };
        let result = sqlx::query(sql)
            .bind(name.as_str())
            .bind(to_sql(seq.value())?)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_peer_watermark(
        &self,
        topic: &TopicName,
        user: &UserId,
        column: Watermark,
        seq: Seq,
    ) -> Result<bool, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        sqlx::query(
            "INSERT INTO subscriptions (topic, user) VALUES (?1, ?2) \
             ON CONFLICT(topic, user) DO NOTHING",
        )
        .bind(topic.as_str())
        .bind(user.as_str())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        let sql = match column {
            Watermark::Recv => {
                "UPDATE subscriptions SET recv_seq = ?3 \
                 WHERE topic = ?1 AND user = ?2 AND (recv_seq IS NULL OR recv_seq < ?3)"
            }
            Watermark::Read => {
                "UPDATE subscriptions SET read_seq = ?3 \
                 WHERE topic = ?1 AND user = ?2 AND (read_seq IS NULL OR read_seq < ?3)"
            }
        };
        let result = sqlx::query(sql)
            .bind(topic.as_str())
            .bind(user.as_str())
            .bind(to_sql(seq.value())?)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_topic_flag(
        &self,
        name: &TopicName,
        flag: Flag,
        value: bool,
    ) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        ensure_topic(&mut tx, name).await?;

        let sql = match flag {
            Flag::Attached => "UPDATE topics SET attached = ?2 WHERE name = ?1",
            Flag::Online => "UPDATE topics SET online = ?2 WHERE name = ?1",
            Flag::AllLoaded => "UPDATE topics SET all_loaded = ?2 WHERE name = ?1",
        };
        sqlx::query(sql)
            .bind(name.as_str())
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Watermark {
    Recv,
    Read,
}

#[derive(Clone, Copy)]
enum Flag {
    Attached,
    Online,
    AllLoaded,
}

async fn ensure_topic(conn: &mut SqliteConnection, name: &TopicName) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO topics (name) VALUES (?1) ON CONFLICT(name) DO NOTHING")
        .bind(name.as_str())
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;
    Ok(())
}

async fn raise_max_seq(
    conn: &mut SqliteConnection,
    name: &TopicName,
    seq: Seq,
) -> Result<(), StoreError> {
    ensure_topic(conn, name).await?;
    sqlx::query(
        "UPDATE topics SET max_seq = ?2 WHERE name = ?1 AND (max_seq IS NULL OR max_seq < ?2)",
    )
    .bind(name.as_str())
    .bind(to_sql(seq.value())?)
    .execute(&mut *conn)
    .await
    .map_err(StoreError::Database)?;
    Ok(())
}

/// SQLite integers are signed; values past `i64::MAX` are refused.
fn to_sql(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| {
        StoreError::Codec(SyncError::InvalidData(format!(
            "{} exceeds the SQLite integer range",
            value
        )))
    })
}

fn seq_to_sql(seq: Option<Seq>) -> Result<Option<i64>, StoreError> {
    seq.map(|s| to_sql(s.value())).transpose()
}

/// Seqs, timestamps and counts are never negative in a healthy database.
fn from_sql(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| {
        StoreError::Codec(SyncError::InvalidData(format!(
            "negative stored value {}",
            value
        )))
    })
}

fn seq_from_sql(value: Option<i64>) -> Result<Option<Seq>, StoreError> {
    value.map(|v| from_sql(v).map(Seq::new)).transpose()
}

async fn fetch_message(
    conn: &mut SqliteConnection,
    topic: &TopicName,
    id: DbId,
) -> Result<Option<Message>, StoreError> {
    let row = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT id, topic, seq, sender, content, ts, status, pending_delete
        FROM messages
        WHERE topic = ?1 AND id = ?2
        "#,
    )
    .bind(topic.as_str())
    .bind(id.value())
    .fetch_optional(&mut *conn)
    .await
    .map_err(StoreError::Database)?;

    row.map(Message::try_from).transpose()
}

async fn write_message(conn: &mut SqliteConnection, msg: &Message) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE messages
        SET seq = ?2, sender = ?3, content = ?4, ts = ?5, status = ?6, pending_delete = ?7
        WHERE id = ?1
        "#,
    )
    .bind(msg.id.value())
    .bind(seq_to_sql(msg.seq)?)
    .bind(msg.from.as_str())
    .bind(msg.content.to_json()?)
    .bind(to_sql(msg.ts)?)
    .bind(msg.state.code())
    .bind(msg.pending_delete)
    .execute(&mut *conn)
    .await
    .map_err(StoreError::Database)?;
    Ok(())
}

async fn transition_row(
    conn: &mut SqliteConnection,
    topic: &TopicName,
    id: DbId,
    transition: Transition,
) -> Result<Effect, StoreError> {
    let mut msg = fetch_message(conn, topic, id)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            topic: topic.to_string(),
            id: id.value(),
        })?;

    let effect = apply(&mut msg, transition)?;
    match effect {
        Effect::Updated => write_message(conn, &msg).await?,
        Effect::Removed => {
            sqlx::query("DELETE FROM messages WHERE id = ?1")
                .bind(id.value())
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Database)?;
        }
        Effect::Unchanged => {}
    }
    Ok(effect)
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn topic_upsert(&self, topic: &Topic) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            r#"
            INSERT INTO topics (name, recv_seq, read_seq, max_seq, all_loaded, attached, online)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name) DO UPDATE SET
                recv_seq = excluded.recv_seq,
                read_seq = excluded.read_seq,
                max_seq = excluded.max_seq,
                all_loaded = excluded.all_loaded,
                attached = excluded.attached,
                online = excluded.online
            "#,
        )
        .bind(topic.name.as_str())
        .bind(seq_to_sql(topic.recv)?)
        .bind(seq_to_sql(topic.read)?)
        .bind(seq_to_sql(topic.max_seq)?)
        .bind(topic.all_loaded)
        .bind(topic.attached)
        .bind(topic.online)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    async fn topic_get(&self, name: &TopicName) -> Result<Option<Topic>, StoreError> {
        let row = sqlx::query_as::<_, TopicRow>(
            r#"
            SELECT name, recv_seq, read_seq, max_seq, all_loaded, attached, online
            FROM topics
            WHERE name = ?1
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        row.map(Topic::try_from).transpose()
    }

    async fn topic_get_all(&self) -> Result<Vec<Topic>, StoreError> {
        let rows = sqlx::query_as::<_, TopicRow>(
            r#"
            SELECT name, recv_seq, read_seq, max_seq, all_loaded, attached, online
            FROM topics
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(Topic::try_from).collect()
    }

    async fn topic_delete(&self, name: &TopicName) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        for sql in [
            "DELETE FROM messages WHERE topic = ?1",
            "DELETE FROM subscriptions WHERE topic = ?1",
            "DELETE FROM topics WHERE name = ?1",
        ] {
            sqlx::query(sql)
                .bind(name.as_str())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Database)?;
        }

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(())
    }

    async fn topic_set_attached(&self, name: &TopicName, attached: bool) -> Result<(), StoreError> {
        self.set_topic_flag(name, Flag::Attached, attached).await
    }

    async fn topic_set_online(&self, name: &TopicName, online: bool) -> Result<(), StoreError> {
        self.set_topic_flag(name, Flag::Online, online).await
    }

    async fn topic_set_max_seq(&self, name: &TopicName, seq: Seq) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        raise_max_seq(&mut tx, name, seq).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(())
    }

    async fn set_read(&self, name: &TopicName, seq: Seq) -> Result<bool, StoreError> {
        self.advance_topic_watermark(name, Watermark::Read, seq).await
    }

    async fn set_recv(&self, name: &TopicName, seq: Seq) -> Result<bool, StoreError> {
        self.advance_topic_watermark(name, Watermark::Recv, seq).await
    }

    async fn set_all_loaded(&self, name: &TopicName, loaded: bool) -> Result<(), StoreError> {
        self.set_topic_flag(name, Flag::AllLoaded, loaded).await
    }

    async fn cached_range(&self, name: &TopicName) -> Result<Option<CachedRange>, StoreError> {
        let (min, max): (Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT MIN(seq), MAX(seq) FROM messages WHERE topic = ?1 AND seq IS NOT NULL",
        )
        .bind(name.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(match (min, max) {
            (Some(min), Some(max)) => Some(SeqRange::new(
                Seq::new(from_sql(min)?),
                Seq::new(from_sql(max)?),
            )),
            _ => None,
        })
    }

    async fn sub_upsert(&self, sub: &Subscription) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            r#"
            INSERT INTO subscriptions (topic, user, recv_seq, read_seq, mode, updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(topic, user) DO UPDATE SET
                recv_seq = excluded.recv_seq,
                read_seq = excluded.read_seq,
                mode = excluded.mode,
                updated = excluded.updated
            "#,
        )
        .bind(sub.topic.as_str())
        .bind(sub.user.as_str())
        .bind(seq_to_sql(sub.recv)?)
        .bind(seq_to_sql(sub.read)?)
        .bind(sub.mode.as_str())
        .bind(to_sql(sub.updated)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    async fn sub_get_all(&self, topic: &TopicName) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT topic, user, recv_seq, read_seq, mode, updated
            FROM subscriptions
            WHERE topic = ?1
            ORDER BY user ASC
            "#,
        )
        .bind(topic.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn sub_delete(&self, topic: &TopicName, user: &UserId) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        sqlx::query("DELETE FROM subscriptions WHERE topic = ?1 AND user = ?2")
            .bind(topic.as_str())
            .bind(user.as_str())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }

    async fn msg_recv_by_remote(
        &self,
        topic: &TopicName,
        user: &UserId,
        seq: Seq,
    ) -> Result<bool, StoreError> {
        self.advance_peer_watermark(topic, user, Watermark::Recv, seq).await
    }

    async fn msg_read_by_remote(
        &self,
        topic: &TopicName,
        user: &UserId,
        seq: Seq,
    ) -> Result<bool, StoreError> {
        self.advance_peer_watermark(topic, user, Watermark::Read, seq).await
    }

    async fn user_get(&self, uid: &UserId) -> Result<Option<User>, StoreError> {
        let row =
            sqlx::query_as::<_, UserRow>("SELECT uid, public, updated FROM users WHERE uid = ?1")
                .bind(uid.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Database)?;

        row.map(User::try_from).transpose()
    }

    async fn user_upsert(&self, user: &User) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            r#"
            INSERT INTO users (uid, public, updated)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(uid) DO UPDATE SET public = excluded.public, updated = excluded.updated
            "#,
        )
        .bind(user.uid.as_str())
        .bind(user.public.to_json()?)
        .bind(to_sql(user.updated)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    async fn msg_received(
        &self,
        topic: &TopicName,
        seq: Seq,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        let existing = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, topic, seq, sender, content, ts, status, pending_delete
            FROM messages
            WHERE topic = ?1 AND seq = ?2
            "#,
        )
        .bind(topic.as_str())
        .bind(to_sql(seq.value())?)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        let id = match existing {
            Some(row) => {
                let mut msg = Message::try_from(row)?;
                if !msg.state.is_deleted() {
                    msg.from = from.clone();
                    msg.content = content.clone();
                    msg.ts = ts;
                    write_message(&mut tx, &msg).await?;
                }
                msg.id
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO messages (topic, seq, sender, content, ts, status)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                )
                .bind(topic.as_str())
                .bind(to_sql(seq.value())?)
                .bind(from.as_str())
                .bind(content.to_json()?)
                .bind(to_sql(ts)?)
                .bind(MessageState::Synced.code())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Database)?;
                DbId::new(result.last_insert_rowid())
            }
        };

        raise_max_seq(&mut tx, topic, seq).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(id)
    }

    async fn msg_draft(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError> {
        self.insert_message(topic, from, content, ts, MessageState::Draft).await
    }

    async fn msg_send(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError> {
        self.insert_message(topic, from, content, ts, MessageState::Ready).await
    }

    async fn msg_get(&self, topic: &TopicName, id: DbId) -> Result<Option<Message>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::Database)?;
        fetch_message(&mut conn, topic, id).await
    }

    async fn msg_transition(
        &self,
        topic: &TopicName,
        id: DbId,
        transition: Transition,
    ) -> Result<Effect, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        let effect = transition_row(&mut tx, topic, id, transition).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(effect)
    }

    async fn msg_delivered(
        &self,
        topic: &TopicName,
        id: DbId,
        seq: Seq,
        ts: Timestamp,
    ) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        let holder = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, topic, seq, sender, content, ts, status, pending_delete
            FROM messages
            WHERE topic = ?1 AND seq = ?2 AND id != ?3
            "#,
        )
        .bind(topic.as_str())
        .bind(to_sql(seq.value())?)
        .bind(id.value())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        if let Some(row) = holder {
            let other = Message::try_from(row)?;
            if other.state != MessageState::Synced {
                return Err(StoreError::DuplicateSeq {
                    topic: topic.to_string(),
                    seq: seq.value(),
                });
            }
            tracing::debug!("Folding echo {:?} of {} into {:?}", other.id, seq, id);
            sqlx::query("DELETE FROM messages WHERE id = ?1")
                .bind(other.id.value())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Database)?;
        }

        transition_row(&mut tx, topic, id, Transition::Confirm { seq, ts }).await?;
        raise_max_seq(&mut tx, topic, seq).await?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(())
    }

    async fn msg_mark_to_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, StoreError> {
        self.delete_matching(topic, target, Transition::MarkDeleted { hard }).await
    }

    async fn msg_apply_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, StoreError> {
        self.delete_matching(topic, target, Transition::ApplyDelete { hard }).await
    }

    async fn msg_query(&self, topic: &TopicName, limit: u64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, topic, seq, sender, content, ts, status, pending_delete
            FROM messages
            WHERE topic = ?1 AND status != ?2
            ORDER BY (seq IS NULL) DESC, seq DESC, id DESC
            LIMIT ?3
            "#,
        )
        .bind(topic.as_str())
        .bind(MessageState::HardDeleted.code())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn msg_range(
        &self,
        topic: &TopicName,
        range: SeqRange,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, topic, seq, sender, content, ts, status, pending_delete
            FROM messages
            WHERE topic = ?1 AND seq BETWEEN ?2 AND ?3 AND status != ?4
            ORDER BY seq ASC
            "#,
        )
        .bind(topic.as_str())
        .bind(to_sql(range.low().value())?)
        .bind(to_sql(range.high().value())?)
        .bind(MessageState::HardDeleted.code())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn msg_count(&self, topic: &TopicName) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE topic = ?1 AND status != ?2")
                .bind(topic.as_str())
                .bind(MessageState::HardDeleted.code())
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::Database)?;

        from_sql(count)
    }

    async fn queued_messages(&self, topic: &TopicName) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, topic, seq, sender, content, ts, status, pending_delete
            FROM messages
            WHERE topic = ?1 AND status = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(topic.as_str())
        .bind(MessageState::Ready.code())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn queued_deletes(&self, topic: &TopicName, hard: bool) -> Result<Vec<Seq>, StoreError> {
        let state = if hard {
            MessageState::HardDeleted
        } else {
            MessageState::SoftDeleted
        };
        let seqs: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT seq FROM messages
            WHERE topic = ?1 AND status = ?2 AND pending_delete = 1 AND seq IS NOT NULL
            ORDER BY seq ASC
            "#,
        )
        .bind(topic.as_str())
        .bind(state.code())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        seqs.into_iter().map(|s| from_sql(s).map(Seq::new)).collect()
    }

    async fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        let reset = sqlx::query("UPDATE messages SET status = ?1 WHERE status = ?2")
            .bind(MessageState::Ready.code())
            .bind(MessageState::Syncing.code())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        let detached = sqlx::query("UPDATE topics SET attached = 0 WHERE attached = 1")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        tx.commit().await.map_err(StoreError::Database)?;

        let report = RecoveryReport {
            reset_syncing: reset.rows_affected(),
            detached_topics: detached.rows_affected(),
        };
        tracing::info!(
            "Recovered store: {} in-flight message(s) reset, {} topic(s) detached",
            report.reset_syncing,
            report.detached_topics
        );
        Ok(report)
    }
}

/// Internal row types for SQLite queries.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    topic: String,
    seq: Option<i64>,
    sender: String,
    content: String,
    ts: i64,
    status: i64,
    pending_delete: bool,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let state = MessageState::from_code(row.status).ok_or_else(|| {
            StoreError::Codec(SyncError::InvalidData(format!(
                "unknown message status {}",
                row.status
            )))
        })?;

        Ok(Message {
            id: DbId::new(row.id),
            topic: TopicName::new(row.topic),
            seq: seq_from_sql(row.seq)?,
            from: UserId::new(row.sender),
            content: Content::from_json(&row.content)?,
            ts: from_sql(row.ts)?,
            state,
            pending_delete: row.pending_delete,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TopicRow {
    name: String,
    recv_seq: Option<i64>,
    read_seq: Option<i64>,
    max_seq: Option<i64>,
    all_loaded: bool,
    attached: bool,
    online: bool,
}

impl TryFrom<TopicRow> for Topic {
    type Error = StoreError;

    fn try_from(row: TopicRow) -> Result<Self, Self::Error> {
        Ok(Topic {
            name: TopicName::new(row.name),
            recv: seq_from_sql(row.recv_seq)?,
            read: seq_from_sql(row.read_seq)?,
            max_seq: seq_from_sql(row.max_seq)?,
            all_loaded: row.all_loaded,
            attached: row.attached,
            online: row.online,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    topic: String,
    user: String,
    recv_seq: Option<i64>,
    read_seq: Option<i64>,
    mode: String,
    updated: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            topic: TopicName::new(row.topic),
            user: UserId::new(row.user),
            recv: seq_from_sql(row.recv_seq)?,
            read: seq_from_sql(row.read_seq)?,
            mode: row.mode,
            updated: from_sql(row.updated)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    uid: String,
    public: String,
    updated: i64,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            uid: UserId::new(row.uid),
            public: Content::from_json(&row.public)?,
            updated: from_sql(row.updated)?,
        })
    }
}
