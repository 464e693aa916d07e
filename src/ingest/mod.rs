use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, info};

use crate::storage::ConversationStore;
use crate::threading::strip_quoted_history;
use crate::types::{now_ts, Contact, Direction, InboundEmail, LedgerEntry, Message, NewContact, NewMessage};

/// How far back a reply may reach when picking its conversation root.
#[derive(Clone, Debug)]
pub struct ThreadPolicy {
    /// Number of most recent root messages considered.
    pub lookback: u32,
    /// Roots older than this are never chosen. `None` means no cutoff.
    pub max_age_days: Option<u32>,
}

impl Default for ThreadPolicy {
    fn default() -> Self {
        Self {
            lookback: 5,
            max_age_days: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Already in the ledger, or being ingested by another task.
    Duplicate,
    Threaded {
        message_id: i64,
        parent_id: i64,
        contact_id: i64,
    },
    /// Recorded in the ledger without creating a message.
    Unlinked { contact_id: Option<i64> },
}

pub struct IngestPipeline<S> {
    store: Arc<S>,
    policy: ThreadPolicy,
    in_flight: Mutex<HashSet<String>>,
}

impl<S: ConversationStore> IngestPipeline<S> {
    pub fn new(store: Arc<S>, policy: ThreadPolicy) -> Self {
        Self {
            store,
            policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Dedup, resolve the sender, link to a conversation when the email is a
    /// reply, and persist. Store errors are returned to the caller.
    pub async fn ingest(&self, email: &InboundEmail) -> Result<IngestOutcome> {
        let Some(_claim) = Claim::take(&self.in_flight, &email.message_id) else {
            debug!(message_id = %email.message_id, "Message already being ingested");
            return Ok(IngestOutcome::Duplicate);
        };

        self.ingest_claimed(email).await
    }

    async fn ingest_claimed(&self, email: &InboundEmail) -> Result<IngestOutcome> {
        if self.store.find_ledger_entry(&email.message_id).await?.is_some() {
            debug!(message_id = %email.message_id, "Message already in ledger; skipping");
            return Ok(IngestOutcome::Duplicate);
        }

        let contact = match self.store.find_contact_by_email(&email.from).await? {
            Some(contact) => Some(self.refresh_contact_name(contact, email).await?),
            None => None,
        };

        let parent = match (&contact, &email.in_reply_to) {
            (Some(contact), Some(_)) => self.select_thread_root(contact.id).await?,
            _ => None,
        };

        let mut entry = LedgerEntry {
            message_id: email.message_id.clone(),
            from_addr: email.from.clone(),
            to_addr: email.to.clone(),
            in_reply_to: email.in_reply_to.clone(),
            saved: false,
            contact_id: contact.as_ref().map(|c| c.id),
            created_at: now_ts(),
        };

        let (Some(contact), Some(parent)) = (contact, parent) else {
            self.record(&entry).await?;
            info!(
                message_id = %email.message_id,
                from = %email.from,
                contact = ?entry.contact_id,
                has_in_reply_to = email.in_reply_to.is_some(),
                "Email recorded without a conversation"
            );
            return Ok(IngestOutcome::Unlinked {
                contact_id: entry.contact_id,
            });
        };

        let message = self
            .store
            .create_message(&NewMessage {
                contact_id: contact.id,
                subject: email.subject.clone(),
                body: strip_quoted_history(&email.body),
                direction: Direction::FromContact,
                read: false,
                parent_id: Some(parent.id),
                created_at: now_ts(),
            })
            .await?;

        entry.saved = true;
        self.record(&entry).await?;

        info!(
            message_id = %email.message_id,
            from = %email.from,
            contact = contact.id,
            parent = parent.id,
            created = message.id,
            "Reply threaded into conversation"
        );

        Ok(IngestOutcome::Threaded {
            message_id: message.id,
            parent_id: parent.id,
            contact_id: contact.id,
        })
    }

    /// Most recent root message of the contact, within the staleness cutoff.
    async fn select_thread_root(&self, contact_id: i64) -> Result<Option<Message>> {
        let roots = self
            .store
            .find_recent_root_messages(contact_id, self.policy.lookback)
            .await?;

        let newest = roots
            .into_iter()
            .filter(|m| m.is_root() && m.contact_id == contact_id)
            .max_by_key(|m| (m.created_at, m.id));

        let Some(max_age_days) = self.policy.max_age_days else {
            return Ok(newest);
        };
        let oldest_allowed = now_ts() - i64::from(max_age_days) * 86_400;
        Ok(newest.filter(|m| {
            let fresh = m.created_at >= oldest_allowed;
            if !fresh {
                debug!(contact = contact_id, root = m.id, "Newest root message is past the staleness cutoff");
            }
            fresh
        }))
    }

    async fn refresh_contact_name(&self, contact: Contact, email: &InboundEmail) -> Result<Contact> {
        match email.from_name.as_deref() {
            Some(name) if name != contact.name => {
                self.store
                    .upsert_contact(&NewContact {
                        name: name.to_string(),
                        email: contact.email.clone(),
                        phone: contact.phone.clone(),
                    })
                    .await
            }
            _ => Ok(contact),
        }
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<()> {
        if !self.store.create_ledger_entry(entry).await? {
            debug!(message_id = %entry.message_id, "Ledger entry already existed");
        }
        Ok(())
    }
}

/// In-flight marker for one message id. Released on drop, including when the
/// ingestion panics or is cancelled.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    message_id: String,
}

impl<'a> Claim<'a> {
    fn take(in_flight: &'a Mutex<HashSet<String>>, message_id: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(message_id.to_string()) {
            return None;
        }
        Some(Self {
            in_flight,
            message_id: message_id.to_string(),
        })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.message_id);
    }
}
