use std::collections::HashSet;

use crate::db::models::HistoryCursor;
use crate::error::SyncError;
use crate::provider::MailProvider;

/// Result of one full traversal of the provider's change feed: the ordered,
/// deduplicated added-message ids and the cursor the account should advance
/// to once every event has been committed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaWalk {
    pub added: Vec<String>,
    pub cursor: HistoryCursor,
}

/// Establishes a starting point for an account that has never synced: a
/// bounded window of recent messages plus the mailbox's current cursor as
/// the baseline. The baseline is captured *before* the listing so anything
/// arriving mid-bootstrap is re-observed by the first incremental walk
/// instead of slipping into a gap.
pub async fn bootstrap_walk(
    provider: &dyn MailProvider,
    token: &str,
    window: usize,
) -> Result<DeltaWalk, SyncError> {
    let profile = provider.profile(token).await?;
    let added = provider.recent_message_ids(token, window).await?;

    Ok(DeltaWalk {
        added,
        cursor: profile.cursor,
    })
}

/// Pages "changes since `since`" to exhaustion, yielding each added-message
/// id once in first-seen order, and returns the maximum cursor observed
/// across all pages. The walker never writes storage; advancing the stored
/// cursor is the caller's job and must wait for the whole run to commit.
pub async fn incremental_walk(
    provider: &dyn MailProvider,
    token: &str,
    since: &HistoryCursor,
) -> Result<DeltaWalk, SyncError> {
    let mut seen = HashSet::new();
    let mut added = Vec::new();
    let mut newest = since.clone();
    let mut page_token: Option<String> = None;

    loop {
        let page = provider
            .history_page(token, since, page_token.as_deref())
            .await?;

        if page.cursor > newest {
            newest = page.cursor.clone();
        }

        for id in page.added_message_ids {
            if seen.insert(id.clone()) {
                added.push(id);
            }
        }

        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }

    Ok(DeltaWalk {
        added,
        cursor: newest,
    })
}
