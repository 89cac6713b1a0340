use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
    // Held for the whole of every mutating transaction
    write_gate: Arc<Mutex<()>>,
}

/// A write transaction holding the process-wide write gate.
///
/// Dropping it without `commit` rolls the transaction back.
pub struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    _gate: OwnedMutexGuard<()>,
}

impl WriteTx {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.tx
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

// "sqlite://data/x.db?mode=rwc" -> "data/x.db"
fn file_path(database_url: &str) -> &str {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    path.split('?').next().unwrap_or(path)
}

impl Database {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        info!("[DB] Connecting to {}", database_url);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if in_memory {
            // every connection to :memory: is a separate database, so pin exactly one
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = std::path::Path::new(file_path(database_url)).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                    info!("[DB] Created directory {:?}", parent);
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        info!("[DB] Connection pool ready");
        Ok(Self { pool, write_gate: Arc::new(Mutex::new(())) })
    }

    /// Fresh, migrated in-memory database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let db = Self::connect("sqlite::memory:", 1).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Waits for the write gate, then opens a transaction that already holds the
    /// SQLite write lock.
    ///
    /// The first statement is a write, which gives the same locking as `BEGIN IMMEDIATE`:
    /// later reads in the transaction can no longer be invalidated by another connection
    /// committing, and writers outside this process wait on `busy_timeout` instead.
    pub async fn begin_write(&self) -> Result<WriteTx, sqlx::Error> {
        let gate = self.write_gate.clone().lock_owned().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE write_lock SET taken_at = ? WHERE id = 1")
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        Ok(WriteTx { tx, _gate: gate })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Single row touched at the start of every write transaction
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS write_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                taken_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;
        sqlx::query("INSERT OR IGNORE INTO write_lock (id, taken_at) VALUES (1, 0)")
            .execute(&self.pool).await?;

        // Users (directory); sessions are issued by the external credential service
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                avatar TEXT NOT NULL DEFAULT '',
                is_online INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Groups with the denormalized last-message projection
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                image TEXT,
                creator_id TEXT NOT NULL,
                total_members INTEGER NOT NULL DEFAULT 1 CHECK (total_members >= 0),
                last_message_id INTEGER,
                last_sender_id TEXT,
                last_sent_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                notify INTEGER NOT NULL DEFAULT 1,
                nickname TEXT,
                PRIMARY KEY (group_id, user_id)
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS join_requests (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                requested_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS invitations (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                receiver_email TEXT NOT NULL,
                invited_by TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // AUTOINCREMENT keeps ids strictly increasing even after deletes
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                file_name TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS message_reads (
                message_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                read_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_group ON messages (group_id, id);")
            .execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members (user_id);")
            .execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_groups_last_sent ON groups (last_sent_at);")
            .execute(&self.pool).await?;

        Ok(())
    }
}
