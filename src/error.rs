use thiserror::Error;

use crate::db::DbError;
use crate::vault::VaultError;

/// Failure taxonomy for a single account's sync run. Every variant is caught
/// at the orchestrator boundary and converted into a per-account outcome by
/// the batch runner; none of them abort the batch loop.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Stored credential is corrupt or tampered. Fatal for the account until
    /// it is re-linked; retrying cannot succeed.
    #[error("credential decryption failed: {0}")]
    Decryption(#[from] VaultError),

    /// The account never linked a mailbox.
    #[error("no mailbox credential stored for tenant '{tenant_id}' user '{user_id}'")]
    CredentialMissing { tenant_id: String, user_id: String },

    /// The provider rejected the credential exchange (e.g. revoked consent).
    /// Not retried: a rejected refresh token stays rejected.
    #[error("provider rejected credential exchange: status={status} body={body}")]
    UpstreamAuth { status: u16, body: String },

    /// Transient retries exhausted, or a permanent non-auth upstream failure.
    /// The run fails with the cursor untouched and is retried next cycle.
    #[error("upstream unavailable: status={status} body={body}")]
    UpstreamUnavailable { status: u16, body: String },

    /// The stored cursor is no longer recognized by the provider's change
    /// feed. The orchestrator falls back to a fresh bootstrap.
    #[error("sync cursor no longer recognized by the provider")]
    CursorExpired,

    #[error("provider transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode provider response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Storage failure mid-ingest. Aborts the run without advancing the
    /// cursor.
    #[error("storage: {0}")]
    Persistence(#[from] DbError),
}
