use crate::errors::AppError;
use crate::types::{now_ts, Contact, Direction, LedgerEntry, Message, NewContact, NewMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dirs::home_dir;

use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::ConversationStore;

const DB_FILE_NAME: &str = "threadline.db";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    pub async fn new_default() -> Result<Self> {
        Self::new_named(DB_FILE_NAME).await
    }

    pub async fn new_named(file_name: &str) -> Result<Self> {
        let base = default_data_dir()?;
        let db_path = base.join(file_name);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: db_path,
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;

        let db = Database {
            pool,
            path: PathBuf::from(":memory:"),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context("enabling foreign keys")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL COLLATE NOCASE,
                phone TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                UNIQUE(email, phone)
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id INTEGER NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                direction TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                parent_id INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (contact_id) REFERENCES contacts(id),
                FOREIGN KEY (parent_id) REFERENCES messages(id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_contact_roots
                ON messages(contact_id, parent_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS ingest_ledger (
                message_id TEXT PRIMARY KEY,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                in_reply_to TEXT,
                saved INTEGER NOT NULL,
                contact_id INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (contact_id) REFERENCES contacts(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;

        Ok(())
    }

    pub async fn mark_message_read(&self, message_id: i64, read: bool) -> Result<()> {
        sqlx::query("UPDATE messages SET read = ?1 WHERE id = ?2")
            .bind(read)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("updating read flag")?;
        Ok(())
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT id, contact_id, subject, body, direction, read, parent_id, created_at
            FROM messages
            WHERE id = ?1;
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading message")?;

        row.map(|r| message_from_row(&r)).transpose()
    }

    pub async fn count_messages(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("count messages")?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn count_ledger_entries(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM ingest_ledger")
            .fetch_one(&self.pool)
            .await
            .context("count ledger entries")?;
        Ok(row.get::<i64, _>(0))
    }
}

#[async_trait]
impl ConversationStore for Database {
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<Contact>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, phone, created_at
            FROM contacts
            WHERE email = ?1 COLLATE NOCASE
            ORDER BY created_at DESC, id DESC
            LIMIT 1;
            "#,
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .context("finding contact by email")?;

        Ok(row.map(|r| contact_from_row(&r)))
    }

    async fn upsert_contact(&self, contact: &NewContact) -> Result<Contact> {
        let email = contact.email.trim().to_ascii_lowercase();
        let phone = contact.phone.as_deref().map(str::trim).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO contacts (name, email, phone, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(email, phone) DO UPDATE SET
                name = excluded.name;
            "#,
        )
        .bind(&contact.name)
        .bind(&email)
        .bind(phone)
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .context("upserting contact")?;

        let row = sqlx::query(
            "SELECT id, name, email, phone, created_at FROM contacts WHERE email = ?1 AND phone = ?2",
        )
        .bind(&email)
        .bind(phone)
        .fetch_one(&self.pool)
        .await
        .context("reloading upserted contact")?;

        Ok(contact_from_row(&row))
    }

    async fn find_recent_root_messages(&self, contact_id: i64, limit: u32) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, contact_id, subject, body, direction, read, parent_id, created_at
            FROM messages
            WHERE contact_id = ?1 AND parent_id IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT ?2;
            "#,
        )
        .bind(contact_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("loading recent root messages")?;

        rows.iter().map(message_from_row).collect()
    }

    async fn create_message(&self, message: &NewMessage) -> Result<Message> {
        if let Some(parent_id) = message.parent_id {
            let owner: Option<i64> = sqlx::query("SELECT contact_id FROM messages WHERE id = ?1")
                .bind(parent_id)
                .fetch_optional(&self.pool)
                .await
                .context("checking parent message")?
                .map(|row| row.get(0));

            if owner != Some(message.contact_id) {
                return Err(AppError::InvalidParent {
                    parent_id,
                    contact_id: message.contact_id,
                }
                .into());
            }
        }

        let res = sqlx::query(
            r#"
            INSERT INTO messages (contact_id, subject, body, direction, read, parent_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);
            "#,
        )
        .bind(message.contact_id)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.direction.as_str())
        .bind(message.read)
        .bind(message.parent_id)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("inserting message")?;

        Ok(Message {
            id: res.last_insert_rowid(),
            contact_id: message.contact_id,
            subject: message.subject.clone(),
            body: message.body.clone(),
            direction: message.direction,
            read: message.read,
            parent_id: message.parent_id,
            created_at: message.created_at,
        })
    }

    async fn find_ledger_entry(&self, message_id: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT message_id, from_addr, to_addr, in_reply_to, saved, contact_id, created_at
            FROM ingest_ledger
            WHERE message_id = ?1;
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("finding ledger entry")?;

        Ok(row.map(|r| LedgerEntry {
            message_id: r.get(0),
            from_addr: r.get(1),
            to_addr: r.get(2),
            in_reply_to: r.get(3),
            saved: r.get(4),
            contact_id: r.get(5),
            created_at: r.get(6),
        }))
    }

    async fn create_ledger_entry(&self, entry: &LedgerEntry) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO ingest_ledger (message_id, from_addr, to_addr, in_reply_to, saved, contact_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(message_id) DO NOTHING;
            "#,
        )
        .bind(&entry.message_id)
        .bind(&entry.from_addr)
        .bind(&entry.to_addr)
        .bind(&entry.in_reply_to)
        .bind(entry.saved)
        .bind(entry.contact_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("inserting ledger entry")?;

        Ok(res.rows_affected() == 1)
    }
}

fn contact_from_row(row: &SqliteRow) -> Contact {
    let phone: String = row.get(3);
    Contact {
        id: row.get(0),
        name: row.get(1),
        email: row.get(2),
        phone: if phone.is_empty() { None } else { Some(phone) },
        created_at: row.get(4),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let direction: String = row.get(4);
    Ok(Message {
        id: row.get(0),
        contact_id: row.get(1),
        subject: row.get(2),
        body: row.get(3),
        direction: Direction::parse(&direction)?,
        read: row.get(5),
        parent_id: row.get(6),
        created_at: row.get(7),
    })
}

pub(crate) fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("THREADLINE_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating THREADLINE_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join("threadline");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/threadline; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("threadline-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}
