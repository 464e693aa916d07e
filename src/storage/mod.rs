mod db;

pub use db::Database;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Contact, LedgerEntry, Message, NewContact, NewMessage};

/// Contacts, messages and the ingestion ledger, as consumed by the ingestion
/// pipeline. Implementations must be safe to share across tasks.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Most recently created contact whose address matches, ignoring case.
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<Contact>>;

    /// Create a contact or refresh the name of the one with the same
    /// `(email, phone)` pair.
    async fn upsert_contact(&self, contact: &NewContact) -> Result<Contact>;

    /// Root messages of a contact, most recent first, at most `limit`.
    async fn find_recent_root_messages(&self, contact_id: i64, limit: u32) -> Result<Vec<Message>>;

    async fn create_message(&self, message: &NewMessage) -> Result<Message>;

    async fn find_ledger_entry(&self, message_id: &str) -> Result<Option<LedgerEntry>>;

    /// Returns `false` when an entry with the same message id already exists.
    async fn create_ledger_entry(&self, entry: &LedgerEntry) -> Result<bool>;
}
