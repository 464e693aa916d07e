use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use threadline::ingest::{IngestOutcome, IngestPipeline, ThreadPolicy};
use threadline::storage::{ConversationStore, Database};
use threadline::types::{now_ts, Contact, Direction, InboundEmail, LedgerEntry, Message, NewContact, NewMessage};

async fn setup() -> (Arc<Database>, IngestPipeline<Database>) {
    let db = Arc::new(Database::in_memory().await.expect("in-memory db"));
    let pipeline = IngestPipeline::new(Arc::clone(&db), ThreadPolicy::default());
    (db, pipeline)
}

async fn contact(db: &Database, name: &str, email: &str) -> Contact {
    db.upsert_contact(&NewContact {
        name: name.to_string(),
        email: email.to_string(),
        phone: None,
    })
    .await
    .expect("upsert contact")
}

async fn root_message(db: &Database, contact_id: i64, created_at: i64) -> i64 {
    db.create_message(&NewMessage {
        contact_id,
        subject: Some("Contact form".to_string()),
        body: "I have a question".to_string(),
        direction: Direction::FromContact,
        read: true,
        parent_id: None,
        created_at,
    })
    .await
    .expect("create root")
    .id
}

fn reply(message_id: &str, from: &str, body: &str) -> InboundEmail {
    InboundEmail {
        message_id: message_id.to_string(),
        from: from.to_string(),
        from_name: None,
        to: "support@example.com".to_string(),
        subject: Some("Re: your question".to_string()),
        body: body.to_string(),
        in_reply_to: Some("root@example.com".to_string()),
    }
}

#[tokio::test]
async fn reply_from_known_contact_is_threaded_and_cleaned() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    let m1 = root_message(&db, carla.id, 1_000).await;

    let outcome = pipeline
        .ingest(&reply("r1@mail", "carla@example.org", "Thanks!\n> previous text"))
        .await
        .unwrap();

    let IngestOutcome::Threaded { message_id, parent_id, contact_id } = outcome else {
        panic!("expected a threaded outcome, got {outcome:?}");
    };
    assert_eq!(parent_id, m1);
    assert_eq!(contact_id, carla.id);

    let created = db.get_message(message_id).await.unwrap().expect("created message");
    assert_eq!(created.parent_id, Some(m1));
    assert_eq!(created.body, "Thanks!");
    assert_eq!(created.direction, Direction::FromContact);
    assert!(!created.read);
    assert_eq!(created.subject.as_deref(), Some("Re: your question"));

    let entry = db.find_ledger_entry("r1@mail").await.unwrap().expect("ledger entry");
    assert!(entry.saved);
    assert_eq!(entry.contact_id, Some(carla.id));
    assert_eq!(entry.in_reply_to.as_deref(), Some("root@example.com"));
}

#[tokio::test]
async fn reply_from_unknown_address_is_only_recorded() {
    let (db, pipeline) = setup().await;

    let outcome = pipeline
        .ingest(&reply("stranger-1@x", "stranger@x.com", "hello?"))
        .await
        .unwrap();

    assert_eq!(outcome, IngestOutcome::Unlinked { contact_id: None });
    assert_eq!(db.count_messages().await.unwrap(), 0);

    let entry = db.find_ledger_entry("stranger-1@x").await.unwrap().expect("ledger entry");
    assert!(!entry.saved);
    assert_eq!(entry.contact_id, None);
}

#[tokio::test]
async fn email_without_reply_signal_never_creates_a_message() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    root_message(&db, carla.id, 1_000).await;

    let mut email = reply("fresh@mail", "carla@example.org", "New topic");
    email.in_reply_to = None;

    let outcome = pipeline.ingest(&email).await.unwrap();

    assert_eq!(outcome, IngestOutcome::Unlinked { contact_id: Some(carla.id) });
    assert_eq!(db.count_messages().await.unwrap(), 1);
    assert_eq!(db.count_ledger_entries().await.unwrap(), 1);
    let entry = db.find_ledger_entry("fresh@mail").await.unwrap().unwrap();
    assert!(!entry.saved);
    assert_eq!(entry.contact_id, Some(carla.id));
}

#[tokio::test]
async fn contact_without_root_messages_is_unlinked() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;

    let outcome = pipeline
        .ingest(&reply("r-none@mail", "carla@example.org", "hi"))
        .await
        .unwrap();

    assert_eq!(outcome, IngestOutcome::Unlinked { contact_id: Some(carla.id) });
    assert_eq!(db.count_messages().await.unwrap(), 0);
}

#[tokio::test]
async fn ingesting_twice_is_a_no_op() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    root_message(&db, carla.id, 1_000).await;

    let email = reply("twice@mail", "carla@example.org", "Thanks!");
    let first = pipeline.ingest(&email).await.unwrap();
    let second = pipeline.ingest(&email).await.unwrap();

    assert!(matches!(first, IngestOutcome::Threaded { .. }));
    assert_eq!(second, IngestOutcome::Duplicate);
    assert_eq!(db.count_ledger_entries().await.unwrap(), 1);
    assert_eq!(db.count_messages().await.unwrap(), 2);
}

#[tokio::test]
async fn concurrent_ingest_of_same_id_materializes_once() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    root_message(&db, carla.id, 1_000).await;
    let pipeline = Arc::new(pipeline);

    let email = reply("race@mail", "carla@example.org", "Thanks!");
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let email = email.clone();
            tokio::spawn(async move { pipeline.ingest(&email).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(db.count_ledger_entries().await.unwrap(), 1);
    assert_eq!(db.count_messages().await.unwrap(), 2);
}

#[tokio::test]
async fn known_ledger_id_causes_no_store_writes() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    root_message(&db, carla.id, 1_000).await;
    db.create_ledger_entry(&LedgerEntry {
        message_id: "seen@mail".to_string(),
        from_addr: "carla@example.org".to_string(),
        to_addr: "support@example.com".to_string(),
        in_reply_to: None,
        saved: false,
        contact_id: None,
        created_at: now_ts(),
    })
    .await
    .unwrap();

    let mut email = reply("seen@mail", "carla@example.org", "Thanks!");
    email.from_name = Some("Carla Renamed".to_string());
    let outcome = pipeline.ingest(&email).await.unwrap();

    assert_eq!(outcome, IngestOutcome::Duplicate);
    assert_eq!(db.count_messages().await.unwrap(), 1);
    assert_eq!(db.count_ledger_entries().await.unwrap(), 1);
    let unchanged = db.find_contact_by_email("carla@example.org").await.unwrap().unwrap();
    assert_eq!(unchanged.name, "Carla");
    let entry = db.find_ledger_entry("seen@mail").await.unwrap().unwrap();
    assert!(!entry.saved);
}

#[tokio::test]
async fn reply_attaches_to_most_recent_root() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    let t1 = root_message(&db, carla.id, 1_000).await;
    let t3 = root_message(&db, carla.id, 3_000).await;
    let t2 = root_message(&db, carla.id, 2_000).await;

    let outcome = pipeline
        .ingest(&reply("recency@mail", "carla@example.org", "ok"))
        .await
        .unwrap();

    let IngestOutcome::Threaded { parent_id, .. } = outcome else {
        panic!("expected a threaded outcome, got {outcome:?}");
    };
    assert_eq!(parent_id, t3);
    assert_ne!(parent_id, t1);
    assert_ne!(parent_id, t2);
}

#[tokio::test]
async fn replies_are_never_chosen_as_thread_roots() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    let root = root_message(&db, carla.id, 1_000).await;

    pipeline
        .ingest(&reply("first@mail", "carla@example.org", "first reply"))
        .await
        .unwrap();
    let second = pipeline
        .ingest(&reply("second@mail", "carla@example.org", "second reply"))
        .await
        .unwrap();

    let IngestOutcome::Threaded { parent_id, .. } = second else {
        panic!("expected a threaded outcome, got {second:?}");
    };
    assert_eq!(parent_id, root);
}

#[tokio::test]
async fn staleness_cutoff_leaves_old_roots_alone() {
    let db = Arc::new(Database::in_memory().await.unwrap());
    let pipeline = IngestPipeline::new(
        Arc::clone(&db),
        ThreadPolicy {
            lookback: 5,
            max_age_days: Some(30),
        },
    );
    let carla = contact(&db, "Carla", "carla@example.org").await;
    root_message(&db, carla.id, now_ts() - 90 * 86_400).await;

    let outcome = pipeline
        .ingest(&reply("late@mail", "carla@example.org", "still there?"))
        .await
        .unwrap();

    assert_eq!(outcome, IngestOutcome::Unlinked { contact_id: Some(carla.id) });
}

#[tokio::test]
async fn old_roots_still_match_without_cutoff() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    let old = root_message(&db, carla.id, now_ts() - 365 * 86_400).await;

    let outcome = pipeline
        .ingest(&reply("year-later@mail", "carla@example.org", "back again"))
        .await
        .unwrap();

    assert!(matches!(outcome, IngestOutcome::Threaded { parent_id, .. } if parent_id == old));
}

#[tokio::test]
async fn fully_quoted_reply_is_stored_with_empty_body() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "Carla", "carla@example.org").await;
    root_message(&db, carla.id, 1_000).await;

    let outcome = pipeline
        .ingest(&reply("empty@mail", "carla@example.org", "> a\n> b"))
        .await
        .unwrap();

    let IngestOutcome::Threaded { message_id, .. } = outcome else {
        panic!("expected a threaded outcome, got {outcome:?}");
    };
    let created = db.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(created.body, "");
}

#[tokio::test]
async fn display_name_refreshes_existing_contact() {
    let (db, pipeline) = setup().await;
    let carla = contact(&db, "carla", "carla@example.org").await;

    let mut email = reply("named@mail", "carla@example.org", "hi");
    email.from_name = Some("Carla Souza".to_string());
    pipeline.ingest(&email).await.unwrap();

    let refreshed = db.find_contact_by_email("carla@example.org").await.unwrap().unwrap();
    assert_eq!(refreshed.id, carla.id);
    assert_eq!(refreshed.name, "Carla Souza");
}

/// Store whose first ledger lookup panics; everything else goes to SQLite.
struct PanicsOnce {
    inner: Database,
    tripped: AtomicBool,
}

#[async_trait]
impl ConversationStore for PanicsOnce {
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<Contact>> {
        self.inner.find_contact_by_email(email).await
    }

    async fn upsert_contact(&self, contact: &NewContact) -> Result<Contact> {
        self.inner.upsert_contact(contact).await
    }

    async fn find_recent_root_messages(&self, contact_id: i64, limit: u32) -> Result<Vec<Message>> {
        self.inner.find_recent_root_messages(contact_id, limit).await
    }

    async fn create_message(&self, message: &NewMessage) -> Result<Message> {
        self.inner.create_message(message).await
    }

    async fn find_ledger_entry(&self, message_id: &str) -> Result<Option<LedgerEntry>> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("ledger lookup blew up");
        }
        self.inner.find_ledger_entry(message_id).await
    }

    async fn create_ledger_entry(&self, entry: &LedgerEntry) -> Result<bool> {
        self.inner.create_ledger_entry(entry).await
    }
}

#[tokio::test]
async fn panicked_ingestion_releases_its_claim() {
    let store = Arc::new(PanicsOnce {
        inner: Database::in_memory().await.unwrap(),
        tripped: AtomicBool::new(false),
    });
    let pipeline = Arc::new(IngestPipeline::new(Arc::clone(&store), ThreadPolicy::default()));
    let email = reply("panicky@mail", "stranger@x.com", "hello");

    let first = {
        let pipeline = Arc::clone(&pipeline);
        let email = email.clone();
        tokio::spawn(async move { pipeline.ingest(&email).await })
    };
    assert!(first.await.unwrap_err().is_panic());

    let retry = pipeline.ingest(&email).await.unwrap();
    assert_eq!(retry, IngestOutcome::Unlinked { contact_id: None });
    assert!(store.inner.find_ledger_entry("panicky@mail").await.unwrap().is_some());
}
