use async_trait::async_trait;

use crate::db::models::HistoryCursor;
use crate::error::SyncError;

pub mod gmail;

pub use gmail::GmailProvider;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProfile {
    pub email_address: String,
    /// The mailbox's current server-side cursor, used as the bootstrap
    /// baseline.
    pub cursor: HistoryCursor,
}

/// Provider message payload mapped into the fields this core persists.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub to_addresses: Vec<String>,
    /// RFC 3339 UTC.
    pub sent_at: String,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
}

/// One page of the provider's "what changed since cursor X" feed.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub cursor: HistoryCursor,
    pub added_message_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[async_trait(?Send)]
pub trait MailProvider: Send + Sync {
    async fn profile(&self, token: &str) -> Result<ProviderProfile, SyncError>;

    /// Ids of the most recent messages, newest first, at most `window`.
    async fn recent_message_ids(
        &self,
        token: &str,
        window: usize,
    ) -> Result<Vec<String>, SyncError>;

    /// Full payload by id. `None` when the message no longer exists upstream
    /// (deleted between the change event and this fetch).
    async fn get_message(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, SyncError>;

    /// Changes since `since`. Fails with [`SyncError::CursorExpired`] when
    /// the provider no longer recognizes the cursor.
    async fn history_page(
        &self,
        token: &str,
        since: &HistoryCursor,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, SyncError>;
}
