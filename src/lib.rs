//! Incremental mailbox synchronization core: keeps each tenant's local copy
//! of a provider mailbox consistent via a resumable change cursor, with the
//! long-lived credential sealed at rest.

pub mod db;
pub mod error;
pub mod fetch;
pub mod provider;
pub mod sync;
pub mod token;
pub mod vault;
pub mod walker;
