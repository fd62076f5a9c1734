use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

/// Opaque marker for "everything processed up to this point" in the
/// provider's change feed. Never parsed; ordering compares length first and
/// falls back to lexicographic, which matches numeric order for the
/// provider's decimal history ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryCursor(String);

impl HistoryCursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HistoryCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for HistoryCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for HistoryCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// A message is outbound when its sender is the account's own address.
    pub fn derive(from_address: Option<&str>, account_address: &str) -> Self {
        match from_address {
            Some(sender) if sender.trim().eq_ignore_ascii_case(account_address.trim()) => {
                Self::Outbound
            }
            _ => Self::Inbound,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("invalid message direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Archived,
}

impl Display for ThreadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("invalid thread status: {other}")),
        }
    }
}

/// One linked mailbox per (tenant, local user). `cursor` is NULL exactly
/// until the first bootstrap sync completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailAccount {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub email_address: String,
    /// Sealed refresh token. Never serialized into reports or logs.
    #[serde(skip)]
    pub credential: Option<Vec<u8>>,
    pub cursor: Option<HistoryCursor>,
    pub last_synced_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: i64,
    pub tenant_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub last_message_at: String,
    pub status: ThreadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub tenant_id: String,
    pub thread_id: i64,
    pub provider_message_id: String,
    pub from_address: Option<String>,
    pub to_addresses: Vec<String>,
    pub sent_at: String,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub direction: Direction,
    /// Filled in later by the external analyzer; this core never writes it.
    pub analysis: Option<serde_json::Value>,
}

/// Ingest input for one provider message. Content is immutable once stored;
/// re-ingesting the same provider id is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub to_addresses: Vec<String>,
    pub sent_at: String,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub direction: Direction,
}

fn parse_json_array(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

fn parse_json_value(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
}

fn column_parse_error(raw: &str, error: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error)),
    )
}

impl MailAccount {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let cursor: Option<String> = row.get("cursor")?;
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            user_id: row.get("user_id")?,
            email_address: row.get("email_address")?,
            credential: row.get("credential")?,
            cursor: cursor.map(HistoryCursor::new),
            last_synced_at: row.get("last_synced_at")?,
        })
    }
}

impl Thread {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let status_raw: String = row.get("status")?;
        let status =
            ThreadStatus::from_str(&status_raw).map_err(|e| column_parse_error(&status_raw, e))?;

        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            provider_thread_id: row.get("provider_thread_id")?,
            subject: row.get("subject")?,
            last_message_at: row.get("last_message_at")?,
            status,
        })
    }
}

impl Message {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let direction_raw: String = row.get("direction")?;
        let direction = Direction::from_str(&direction_raw)
            .map_err(|e| column_parse_error(&direction_raw, e))?;

        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            thread_id: row.get("thread_id")?,
            provider_message_id: row.get("provider_message_id")?,
            from_address: row.get("from_address")?,
            to_addresses: parse_json_array(row.get("to_addresses")?),
            sent_at: row.get("sent_at")?,
            snippet: row.get("snippet")?,
            body_text: row.get("body_text")?,
            direction,
            analysis: parse_json_value(row.get("analysis")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, HistoryCursor, MailAccount};

    #[test]
    fn cursor_ordering_matches_numeric_order_of_decimal_ids() {
        let h99 = HistoryCursor::new("99");
        let h100 = HistoryCursor::new("100");
        let h105 = HistoryCursor::new("105");

        assert!(h99 < h100);
        assert!(h100 < h105);
        assert!(h105 > h99);
        assert_eq!(h100, HistoryCursor::new("100"));
    }

    #[test]
    fn direction_derivation_compares_sender_to_account_address() {
        assert_eq!(
            Direction::derive(Some("Owner@Example.com"), "owner@example.com"),
            Direction::Outbound
        );
        assert_eq!(
            Direction::derive(Some("other@example.com"), "owner@example.com"),
            Direction::Inbound
        );
        assert_eq!(
            Direction::derive(None, "owner@example.com"),
            Direction::Inbound
        );
    }

    #[test]
    fn direction_display_and_parse() {
        assert_eq!(Direction::Outbound.to_string(), "outbound");
        assert_eq!(
            "inbound".parse::<Direction>().expect("parse direction"),
            Direction::Inbound
        );
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn credential_never_serializes() {
        let account = MailAccount {
            id: "acc-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            user_id: "user-1".to_string(),
            email_address: "owner@example.com".to_string(),
            credential: Some(vec![1, 2, 3]),
            cursor: Some(HistoryCursor::new("100")),
            last_synced_at: None,
        };

        let json = serde_json::to_string(&account).expect("serialize account");
        assert!(!json.contains("credential"));
        assert!(json.contains("\"cursor\":\"100\""));
    }
}
