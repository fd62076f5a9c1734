use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::models::{HistoryCursor, MailAccount, Message, NewMessage, Thread};

pub mod migrations;
pub mod models;
pub mod schema;

pub const DB_PATH_ENV: &str = "MAILSYNC_DB";

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

/// Outcome of one idempotent ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestResult {
    Inserted,
    /// The provider message id was already stored for this tenant; nothing
    /// was modified.
    AlreadyPresent,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_accounts: i64,
    pub total_threads: i64,
    pub total_messages: i64,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrations::migrate(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        if let Ok(configured) = std::env::var(DB_PATH_ENV) {
            let trimmed = configured.trim();
            if !trimmed.is_empty() {
                return Ok(PathBuf::from(trimmed));
            }
        }
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailsync").join("mailsync.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts the account, or on re-link replaces the mailbox address and
    /// sealed credential. Cursor and last-sync state survive a re-link.
    pub fn upsert_account(&self, account: &MailAccount) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO accounts (id, tenant_id, user_id, email_address, credential, cursor, last_synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(tenant_id, user_id) DO UPDATE SET
                email_address = excluded.email_address,
                credential = excluded.credential
            "#,
            params![
                account.id,
                account.tenant_id,
                account.user_id,
                account.email_address,
                account.credential,
                account.cursor.as_ref().map(HistoryCursor::as_str),
                account.last_synced_at,
            ],
        )?;

        Ok(())
    }

    pub fn get_account(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<MailAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant_id, user_id, email_address, credential, cursor, last_synced_at
            FROM accounts
            WHERE tenant_id = ?1 AND user_id = ?2
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query(params![tenant_id, user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(MailAccount::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_accounts(&self) -> Result<Vec<MailAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant_id, user_id, email_address, credential, cursor, last_synced_at
            FROM accounts
            ORDER BY tenant_id ASC, email_address ASC
            "#,
        )?;

        let accounts = stmt
            .query_map([], MailAccount::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    /// Accounts due for a sync run: never-synced first, then longest-stale.
    pub fn eligible_accounts(&self, limit: usize) -> Result<Vec<MailAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant_id, user_id, email_address, credential, cursor, last_synced_at
            FROM accounts
            ORDER BY last_synced_at ASC NULLS FIRST, id ASC
            LIMIT ?1
            "#,
        )?;

        let accounts = stmt
            .query_map(params![limit as i64], MailAccount::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    /// Durably records a completed run. This is the only place the stored
    /// cursor moves, and it runs only after every event of the run has been
    /// committed.
    pub fn complete_sync(
        &self,
        account_id: &str,
        cursor: &HistoryCursor,
        synced_at: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE accounts SET cursor = ?2, last_synced_at = ?3 WHERE id = ?1",
            params![account_id, cursor.as_str(), synced_at],
        )?;
        Ok(())
    }

    /// Writes one provider message for the tenant, idempotently, inside a
    /// single transaction: existing message ids are left untouched, the
    /// parent thread is upserted conflict-safely, and the message insert
    /// carries its own uniqueness guard so a racing writer resolves to
    /// "do nothing" rather than an error.
    pub fn ingest_message(
        &self,
        tenant_id: &str,
        message: &NewMessage,
    ) -> Result<IngestResult, DbError> {
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM messages WHERE tenant_id = ?1 AND provider_message_id = ?2 LIMIT 1",
                params![tenant_id, message.provider_message_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            tx.commit()?;
            return Ok(IngestResult::AlreadyPresent);
        }

        // Subject and last-message timestamp move forward only; an older
        // message re-observed later never rewinds the thread.
        let thread_id: i64 = tx.query_row(
            r#"
            INSERT INTO threads (tenant_id, provider_thread_id, subject, last_message_at, status)
            VALUES (?1, ?2, ?3, ?4, 'active')
            ON CONFLICT(tenant_id, provider_thread_id) DO UPDATE SET
                subject = CASE
                    WHEN excluded.last_message_at >= threads.last_message_at
                         AND excluded.subject IS NOT NULL
                    THEN excluded.subject
                    ELSE threads.subject
                END,
                last_message_at = max(threads.last_message_at, excluded.last_message_at)
            RETURNING id
            "#,
            params![
                tenant_id,
                message.provider_thread_id,
                message.subject,
                message.sent_at,
            ],
            |row| row.get(0),
        )?;

        let inserted = tx.execute(
            r#"
            INSERT INTO messages (
                tenant_id, thread_id, provider_message_id, from_address, to_addresses,
                sent_at, snippet, body_text, direction
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(tenant_id, provider_message_id) DO NOTHING
            "#,
            params![
                tenant_id,
                thread_id,
                message.provider_message_id,
                message.from_address,
                serde_json::to_string(&message.to_addresses)?,
                message.sent_at,
                message.snippet,
                message.body_text,
                message.direction.to_string(),
            ],
        )?;

        tx.commit()?;

        if inserted == 0 {
            Ok(IngestResult::AlreadyPresent)
        } else {
            Ok(IngestResult::Inserted)
        }
    }

    pub fn get_thread(
        &self,
        tenant_id: &str,
        provider_thread_id: &str,
    ) -> Result<Option<Thread>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant_id, provider_thread_id, subject, last_message_at, status
            FROM threads
            WHERE tenant_id = ?1 AND provider_thread_id = ?2
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query(params![tenant_id, provider_thread_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Thread::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_message(
        &self,
        tenant_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant_id, thread_id, provider_message_id, from_address, to_addresses,
                   sent_at, snippet, body_text, direction, analysis
            FROM messages
            WHERE tenant_id = ?1 AND provider_message_id = ?2
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query(params![tenant_id, provider_message_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Message::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn count_threads(&self, tenant_id: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_messages(&self, tenant_id: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn stats(&self) -> Result<DatabaseStats, DbError> {
        let total_accounts: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        let total_threads: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))?;
        let total_messages: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;

        Ok(DatabaseStats {
            total_accounts,
            total_threads,
            total_messages,
        })
    }
}
