use chrono::Utc;
use serde::Serialize;

use crate::db::models::{Direction, HistoryCursor, MailAccount, NewMessage};
use crate::db::Database;
use crate::db::IngestResult;
use crate::error::SyncError;
use crate::provider::{MailProvider, MessageRecord};
use crate::token::AccessTokens;
use crate::walker::{bootstrap_walk, incremental_walk, DeltaWalk};

pub const DEFAULT_BOOTSTRAP_WINDOW: usize = 50;
pub const BOOTSTRAP_WINDOW_ENV: &str = "MAILSYNC_BOOTSTRAP_WINDOW";

#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// How many recent messages a first sync pulls in before switching the
    /// account to incremental mode.
    pub bootstrap_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bootstrap_window: DEFAULT_BOOTSTRAP_WINDOW,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let bootstrap_window = std::env::var(BOOTSTRAP_WINDOW_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|window| *window > 0)
            .unwrap_or(DEFAULT_BOOTSTRAP_WINDOW);

        Self { bootstrap_window }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Bootstrap,
    Incremental,
}

/// What one account's run did, for reporting and for the batch summary.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub mode: SyncMode,
    pub messages_ingested: usize,
    pub messages_skipped: usize,
    pub cursor: HistoryCursor,
}

/// Syncs one account end to end: exchange a token, walk the change feed,
/// ingest every added message, and only then advance the stored cursor. A
/// failure anywhere leaves the cursor untouched, so the next run replays the
/// same window against idempotent writes.
pub async fn sync_account(
    db: &Database,
    provider: &dyn MailProvider,
    tokens: &dyn AccessTokens,
    account: &MailAccount,
    config: &SyncConfig,
) -> Result<SyncOutcome, SyncError> {
    let token = tokens.access_token(account).await?;

    let (mode, walk) = match &account.cursor {
        None => {
            let walk = bootstrap_walk(provider, &token, config.bootstrap_window).await?;
            (SyncMode::Bootstrap, walk)
        }
        Some(since) => match incremental_walk(provider, &token, since).await {
            Ok(walk) => (SyncMode::Incremental, walk),
            // The provider aged the cursor out. Re-baseline from scratch;
            // idempotent ingest absorbs the overlap.
            Err(SyncError::CursorExpired) => {
                tracing::warn!(
                    account_id = %account.id,
                    cursor = %since,
                    "change cursor expired upstream, falling back to bootstrap"
                );
                let walk = bootstrap_walk(provider, &token, config.bootstrap_window).await?;
                (SyncMode::Bootstrap, walk)
            }
            Err(other) => return Err(other),
        },
    };

    let DeltaWalk { added, cursor } = walk;

    let mut messages_ingested = 0usize;
    let mut messages_skipped = 0usize;

    for message_id in &added {
        let Some(record) = provider.get_message(&token, message_id).await? else {
            // Deleted upstream between the change event and this fetch.
            tracing::warn!(
                account_id = %account.id,
                message_id = %message_id,
                "message vanished upstream, skipping"
            );
            messages_skipped += 1;
            continue;
        };

        let new_message = to_new_message(record, &account.email_address);
        match db.ingest_message(&account.tenant_id, &new_message)? {
            IngestResult::Inserted => messages_ingested += 1,
            IngestResult::AlreadyPresent => messages_skipped += 1,
        }
    }

    // The stored cursor only moves forward, even if this run's walk ended
    // behind a cursor a previous run already committed.
    let final_cursor = match &account.cursor {
        Some(stored) if *stored > cursor => stored.clone(),
        _ => cursor,
    };
    db.complete_sync(&account.id, &final_cursor, &Utc::now().to_rfc3339())?;

    tracing::info!(
        account_id = %account.id,
        mode = ?mode,
        ingested = messages_ingested,
        skipped = messages_skipped,
        cursor = %final_cursor,
        "sync run complete"
    );

    Ok(SyncOutcome {
        mode,
        messages_ingested,
        messages_skipped,
        cursor: final_cursor,
    })
}

fn to_new_message(record: MessageRecord, account_address: &str) -> NewMessage {
    let direction = Direction::derive(record.from_address.as_deref(), account_address);
    NewMessage {
        provider_message_id: record.provider_message_id,
        provider_thread_id: record.provider_thread_id,
        subject: record.subject,
        from_address: record.from_address,
        to_addresses: record.to_addresses,
        sent_at: record.sent_at,
        snippet: record.snippet,
        body_text: record.body_text,
        direction,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountOutcome {
    pub account_id: String,
    pub email_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub accounts: Vec<AccountOutcome>,
}

/// Runs up to `max_accounts` due accounts, oldest-synced first. One account's
/// failure is recorded and the batch moves on; it never aborts the rest.
pub async fn run_batch(
    db: &Database,
    provider: &dyn MailProvider,
    tokens: &dyn AccessTokens,
    config: &SyncConfig,
    max_accounts: usize,
) -> Result<BatchReport, SyncError> {
    let due = db.eligible_accounts(max_accounts)?;

    let mut report = BatchReport {
        succeeded: 0,
        failed: 0,
        accounts: Vec::with_capacity(due.len()),
    };

    for account in due {
        match sync_account(db, provider, tokens, &account, config).await {
            Ok(outcome) => {
                report.succeeded += 1;
                report.accounts.push(AccountOutcome {
                    account_id: account.id,
                    email_address: account.email_address,
                    outcome: Some(outcome),
                    error: None,
                });
            }
            Err(error) => {
                tracing::warn!(
                    account_id = %account.id,
                    error = %error,
                    "account sync failed, continuing batch"
                );
                report.failed += 1;
                report.accounts.push(AccountOutcome {
                    account_id: account.id,
                    email_address: account.email_address,
                    outcome: None,
                    error: Some(error.to_string()),
                });
            }
        }
    }

    Ok(report)
}
