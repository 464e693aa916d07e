use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future::join_all, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ImapCredentials, MailConfig};
use crate::imap::{ImapClient, ImapSession};
use crate::ingest::{IngestOutcome, IngestPipeline};
use crate::parse::parse_inbound;
use crate::scheduler::PollCycle;
use crate::storage::ConversationStore;

/// Raw message as fetched from the server.
#[derive(Clone, Debug)]
pub struct FetchedMessage {
    pub uid: u32,
    pub raw: Vec<u8>,
    /// Protocol id used when the message has no `Message-ID` header.
    pub fallback_id: String,
}

/// Per-cycle counters, logged at the end of each cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The cycle did not connect because credentials are missing.
    pub skipped: bool,
    pub fetched: usize,
    pub threaded: usize,
    pub unlinked: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &Result<IngestOutcome>) {
        match outcome {
            Ok(IngestOutcome::Threaded { .. }) => self.threaded += 1,
            Ok(IngestOutcome::Unlinked { .. }) => self.unlinked += 1,
            Ok(IngestOutcome::Duplicate) => self.duplicates += 1,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct MailboxPoller<S> {
    config: MailConfig,
    pipeline: Arc<IngestPipeline<S>>,
}

impl<S: ConversationStore + 'static> MailboxPoller<S> {
    pub fn new(config: MailConfig, pipeline: Arc<IngestPipeline<S>>) -> Self {
        Self { config, pipeline }
    }

    /// One polling cycle: connect, ingest every unseen message, log out.
    pub async fn poll_once(&self) -> Result<CycleReport> {
        let Some(creds) = self.config.credentials() else {
            error!(
                missing = ?self.config.missing_credentials(),
                "Mailbox credentials are not configured; skipping poll"
            );
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        };

        let started = Instant::now();
        info!(host = %creds.host, mailbox = %self.config.mailbox, "Starting mailbox poll");

        let mut session = ImapClient::connect(&creds).await?;
        let result = self.poll_inbox(&mut session, &creds).await;

        // Always release the connection, whatever happened in the loop.
        if let Err(e) = session.logout().await {
            warn!(host = %creds.host, error = %e, "IMAP logout failed");
        }

        let report = result?;
        info!(
            host = %creds.host,
            fetched = report.fetched,
            threaded = report.threaded,
            unlinked = report.unlinked,
            duplicates = report.duplicates,
            failed = report.failed,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Mailbox poll completed"
        );
        Ok(report)
    }

    async fn poll_inbox(&self, session: &mut ImapSession, creds: &ImapCredentials) -> Result<CycleReport> {
        let mailbox = session
            .select(&self.config.mailbox)
            .await
            .with_context(|| format!("selecting mailbox {}", self.config.mailbox))?;
        let uidvalidity = mailbox.uid_validity.unwrap_or(0);

        let unseen = session
            .uid_search("UNSEEN")
            .await
            .context("UID SEARCH UNSEEN")?;
        if unseen.is_empty() {
            debug!(mailbox = %self.config.mailbox, "No unseen messages");
            return Ok(CycleReport::default());
        }

        let mut uids: Vec<u32> = unseen.into_iter().collect();
        uids.sort_unstable();
        info!(mailbox = %self.config.mailbox, count = uids.len(), "Fetching unseen messages");

        // BODY[] (not BODY.PEEK[]) makes the server set \Seen with the fetch.
        let mut stream = session
            .uid_fetch(build_uid_sequence(&uids), "(UID BODY[])")
            .await
            .context("fetching unseen messages")?;

        let mut tasks = Vec::new();
        let mut stream_error = None;
        while let Some(fetch_result) = stream.next().await {
            let fetch = match fetch_result {
                Ok(f) => f,
                Err(e) => {
                    stream_error = Some(e);
                    break;
                }
            };

            let uid = fetch.uid.unwrap_or(0);
            let Some(body) = fetch.body() else {
                warn!(uid, "Fetched message has no body; skipping");
                continue;
            };
            tasks.push(spawn_ingest(
                Arc::clone(&self.pipeline),
                FetchedMessage {
                    uid,
                    raw: body.to_vec(),
                    fallback_id: format!("{}:{}:{}:{}", creds.host, self.config.mailbox, uidvalidity, uid),
                },
            ));
        }
        drop(stream);

        let report = gather(tasks).await;
        if let Some(e) = stream_error {
            warn!(
                ingested = report.fetched,
                failed = report.failed,
                "Fetch stream broke; keeping messages ingested so far"
            );
            return Err(anyhow::Error::new(e).context("reading FETCH response stream"));
        }
        Ok(report)
    }
}

#[async_trait]
impl<S: ConversationStore + 'static> PollCycle for MailboxPoller<S> {
    async fn run_cycle(&self) -> Result<CycleReport> {
        self.poll_once().await
    }
}

/// Parse and ingest one fetched message on its own task. Failures are logged
/// here, with whatever identifies the message, and returned.
pub fn spawn_ingest<S>(
    pipeline: Arc<IngestPipeline<S>>,
    message: FetchedMessage,
) -> JoinHandle<Result<IngestOutcome>>
where
    S: ConversationStore + 'static,
{
    tokio::spawn(async move {
        let email = match parse_inbound(&message.raw, &message.fallback_id) {
            Ok(email) => email,
            Err(e) => {
                warn!(
                    uid = message.uid,
                    message_id = %message.fallback_id,
                    error = %e,
                    "Failed to parse message"
                );
                return Err(anyhow::Error::new(e).context(format!("parsing {}", message.fallback_id)));
            }
        };

        let outcome = pipeline.ingest(&email).await;
        if let Err(e) = &outcome {
            warn!(
                uid = message.uid,
                message_id = %email.message_id,
                from = %email.from,
                error = %e,
                "Failed to ingest message"
            );
        }
        outcome
    })
}

/// Wait for every ingestion task of a cycle and tally the outcomes.
pub async fn gather(tasks: Vec<JoinHandle<Result<IngestOutcome>>>) -> CycleReport {
    let mut report = CycleReport {
        fetched: tasks.len(),
        ..CycleReport::default()
    };

    for result in join_all(tasks).await {
        match result {
            Ok(outcome) => report.record(&outcome),
            Err(e) => {
                warn!(error = %e, "Ingestion task panicked");
                report.failed += 1;
            }
        }
    }
    report
}

fn build_uid_sequence(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
