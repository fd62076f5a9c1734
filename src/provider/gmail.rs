use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::db::models::HistoryCursor;
use crate::error::SyncError;
use crate::fetch::{fetch_with_retry, redact_response_body, RetryPolicy};
use crate::provider::{HistoryPage, MailProvider, MessageRecord, ProviderProfile};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const PAGE_SIZE: usize = 100;

pub const API_BASE_ENV: &str = "MAILSYNC_API_BASE";

/// Gmail-shaped REST client behind the [`MailProvider`] seam. All calls go
/// through the resilient fetch wrapper.
#[derive(Debug, Clone)]
pub struct GmailProvider {
    client: Client,
    api_base: String,
    retry: RetryPolicy,
}

impl GmailProvider {
    pub fn new(api_base: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into(),
            retry,
        }
    }

    pub fn from_env() -> Self {
        let api_base = std::env::var(API_BASE_ENV)
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::new(api_base, RetryPolicy::default())
    }

    async fn get(&self, token: &str, url: &str) -> Result<(StatusCode, String), SyncError> {
        let response = fetch_with_retry(
            self.client
                .get(url)
                .bearer_auth(token)
                .header("accept", "application/json"),
            &self.retry,
        )
        .await?;

        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    fn fail_for(status: StatusCode, body: &str) -> SyncError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            SyncError::UpstreamAuth {
                status: status.as_u16(),
                body: redact_response_body(body),
            }
        } else {
            SyncError::UpstreamUnavailable {
                status: status.as_u16(),
                body: redact_response_body(body),
            }
        }
    }
}

#[async_trait(?Send)]
impl MailProvider for GmailProvider {
    async fn profile(&self, token: &str) -> Result<ProviderProfile, SyncError> {
        let url = format!("{}/users/me/profile", self.api_base);
        let (status, body) = self.get(token, &url).await?;
        if !status.is_success() {
            return Err(Self::fail_for(status, &body));
        }

        let profile: ProfileResponse = serde_json::from_str(&body)?;
        Ok(ProviderProfile {
            email_address: profile.email_address,
            cursor: HistoryCursor::new(profile.history_id),
        })
    }

    async fn recent_message_ids(
        &self,
        token: &str,
        window: usize,
    ) -> Result<Vec<String>, SyncError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < window {
            let page_size = PAGE_SIZE.min(window - ids.len());
            let mut url = format!(
                "{}/users/me/messages?maxResults={page_size}",
                self.api_base
            );
            if let Some(pt) = &page_token {
                url.push_str(&format!("&pageToken={pt}"));
            }

            let (status, body) = self.get(token, &url).await?;
            if !status.is_success() {
                return Err(Self::fail_for(status, &body));
            }

            let list: MessageListResponse = serde_json::from_str(&body)?;
            ids.extend(
                list.messages
                    .unwrap_or_default()
                    .into_iter()
                    .map(|stub| stub.id),
            );

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(window);
        Ok(ids)
    }

    async fn get_message(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, SyncError> {
        let url = format!(
            "{}/users/me/messages/{message_id}?format=full",
            self.api_base
        );
        let (status, body) = self.get(token, &url).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::fail_for(status, &body));
        }

        let message: MessagePayload = serde_json::from_str(&body)?;
        Ok(Some(map_message(message)))
    }

    async fn history_page(
        &self,
        token: &str,
        since: &HistoryCursor,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, SyncError> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded&maxResults={PAGE_SIZE}",
            self.api_base,
            since.as_str(),
        );
        if let Some(pt) = page_token {
            url.push_str(&format!("&pageToken={pt}"));
        }

        let (status, body) = self.get(token, &url).await?;
        // The provider forgets history ids after a retention window; the
        // stored cursor is then unusable and the caller re-bootstraps.
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::CursorExpired);
        }
        if !status.is_success() {
            return Err(Self::fail_for(status, &body));
        }

        let list: HistoryListResponse = serde_json::from_str(&body)?;
        let added_message_ids = list
            .history
            .unwrap_or_default()
            .into_iter()
            .flat_map(|record| record.messages_added.unwrap_or_default())
            .map(|event| event.message.id)
            .collect();

        Ok(HistoryPage {
            cursor: HistoryCursor::new(list.history_id),
            added_message_ids,
            next_page_token: list.next_page_token,
        })
    }
}

fn map_message(message: MessagePayload) -> MessageRecord {
    let subject = extract_header(&message.payload, "Subject");
    let from_address = extract_header(&message.payload, "From")
        .as_deref()
        .and_then(sender_address);
    let to_addresses = parse_address_list(extract_header(&message.payload, "To").as_deref());

    let (text_body, html_body) = extract_body_parts(&message.payload);
    let body_text = text_body.or_else(|| html_body.as_deref().and_then(html_to_text));

    let sent_at = message
        .internal_date
        .as_deref()
        .and_then(|ms_str| ms_str.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
        .to_rfc3339();

    let snippet = message.snippet.map(|s| html_entity_decode(&s));

    MessageRecord {
        provider_message_id: message.id,
        provider_thread_id: message.thread_id,
        subject,
        from_address,
        to_addresses,
        sent_at,
        snippet,
        body_text,
    }
}

fn extract_header(payload: &PartPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Pulls the bare address out of a From header: either
/// `Display Name <addr@host>` or a plain address.
fn sender_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let (Some(start), Some(end)) = (raw.rfind('<'), raw.rfind('>')) {
        if start < end {
            let address = raw[start + 1..end].trim();
            if !address.is_empty() {
                return Some(address.to_string());
            }
        }
    }

    if raw.contains('@') {
        return Some(raw.to_string());
    }

    None
}

fn parse_address_list(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    let mut addresses = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    // Commas inside quoted display names do not split entries.
    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if let Some(addr) = sender_address(&current) {
                    addresses.push(addr);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if let Some(addr) = sender_address(&current) {
        addresses.push(addr);
    }

    addresses
}

fn extract_body_parts(payload: &PartPayload) -> (Option<String>, Option<String>) {
    let mut text_body = None;
    let mut html_body = None;
    collect_body_parts(payload, &mut text_body, &mut html_body);
    (text_body, html_body)
}

fn collect_body_parts(
    payload: &PartPayload,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    if let Some(data) = payload.body.as_ref().and_then(|body| body.data.as_deref()) {
        if !data.is_empty() {
            if let Some(decoded) = decode_body_data(data) {
                if mime_type == "text/plain" && text_body.is_none() {
                    *text_body = Some(decoded);
                } else if mime_type == "text/html" && html_body.is_none() {
                    *html_body = Some(decoded);
                }
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_body_parts(part, text_body, html_body);
        }
    }
}

fn decode_body_data(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data).ok()?;
    String::from_utf8(bytes).ok()
}

fn html_to_text(html: &str) -> Option<String> {
    let text = std::panic::catch_unwind(|| {
        html2text::from_read(html.as_bytes(), 120)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .ok()?;

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn html_entity_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
}

// --- Provider response types ---
// Some deserialized fields are unread; they document the wire contract.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageStub>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
    #[allow(dead_code)]
    thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    id: String,
    thread_id: String,
    snippet: Option<String>,
    payload: PartPayload,
    internal_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartPayload {
    mime_type: Option<String>,
    headers: Option<Vec<Header>>,
    body: Option<PartBody>,
    parts: Option<Vec<PartPayload>>,
}

#[derive(Debug, Clone, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    #[allow(dead_code)]
    size: Option<u64>,
    data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    history: Option<Vec<HistoryRecord>>,
    next_page_token: Option<String>,
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[allow(dead_code)]
    id: String,
    messages_added: Option<Vec<MessageAddedEvent>>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageAddedEvent {
    message: MessageStub,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        decode_body_data, html_entity_decode, map_message, parse_address_list, sender_address,
        HistoryListResponse, MessagePayload,
    };

    #[test]
    fn message_payload_maps_to_record() {
        let payload = json!({
            "id": "18e1234abcd",
            "threadId": "18e1230000",
            "snippet": "Hello &amp; welcome to the meeting",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    { "name": "Subject", "value": "Quarterly Review" },
                    { "name": "From", "value": "Alex Smith <alex@example.com>" },
                    { "name": "To", "value": "team@example.com, Bob <bob@example.com>" }
                ],
                "body": { "size": 0 },
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "headers": [],
                        "body": { "size": 16, "data": "SGVsbG8gdGVhbSE" }
                    },
                    {
                        "mimeType": "text/html",
                        "headers": [],
                        "body": { "size": 30, "data": "PHA-SGVsbG8gPGI-dGVhbTwvYj4hPC9wPg" }
                    }
                ]
            },
            "internalDate": "1735732800000"
        });

        let message: MessagePayload =
            serde_json::from_value(payload).expect("deserialize message payload");
        let record = map_message(message);

        assert_eq!(record.provider_message_id, "18e1234abcd");
        assert_eq!(record.provider_thread_id, "18e1230000");
        assert_eq!(record.subject.as_deref(), Some("Quarterly Review"));
        assert_eq!(record.from_address.as_deref(), Some("alex@example.com"));
        assert_eq!(
            record.to_addresses,
            vec!["team@example.com".to_string(), "bob@example.com".to_string()]
        );
        assert_eq!(record.body_text.as_deref(), Some("Hello team!"));
        assert_eq!(
            record.snippet.as_deref(),
            Some("Hello & welcome to the meeting")
        );
        assert!(record.sent_at.starts_with("2025-01-01T12:00:00"));
    }

    #[test]
    fn html_only_message_falls_back_to_text_rendering() {
        let payload = json!({
            "id": "msg-html",
            "threadId": "thread-html",
            "snippet": "Rendered",
            "payload": {
                "mimeType": "text/html",
                "headers": [
                    { "name": "From", "value": "sender@example.com" }
                ],
                "body": { "size": 30, "data": "PHA-SGVsbG8gPGI-dGVhbTwvYj4hPC9wPg" }
            },
            "internalDate": "1735732800000"
        });

        let message: MessagePayload =
            serde_json::from_value(payload).expect("deserialize message payload");
        let record = map_message(message);

        assert!(record
            .body_text
            .as_deref()
            .expect("text fallback")
            .contains("Hello"));
    }

    #[test]
    fn sender_address_extraction() {
        assert_eq!(
            sender_address("Alex Smith <alex@example.com>").as_deref(),
            Some("alex@example.com")
        );
        assert_eq!(
            sender_address("plain@example.com").as_deref(),
            Some("plain@example.com")
        );
        assert!(sender_address("No Address Here").is_none());
        assert!(sender_address("").is_none());
    }

    #[test]
    fn address_list_respects_quoted_commas() {
        let addrs = parse_address_list(Some(
            "team@example.com, \"Bob, Jr.\" <bob@example.com>, alice@example.com",
        ));
        assert_eq!(
            addrs,
            vec![
                "team@example.com".to_string(),
                "bob@example.com".to_string(),
                "alice@example.com".to_string()
            ]
        );

        assert!(parse_address_list(None).is_empty());
    }

    #[test]
    fn history_list_decodes_added_events() {
        let payload = r#"{
            "history": [
                { "id": "101", "messagesAdded": [ { "message": { "id": "m4", "threadId": "t1" } } ] },
                { "id": "103", "messagesAdded": [ { "message": { "id": "m5", "threadId": "t2" } } ] },
                { "id": "104" }
            ],
            "nextPageToken": "page-2",
            "historyId": "105"
        }"#;

        let list: HistoryListResponse =
            serde_json::from_str(payload).expect("decode history list");
        assert_eq!(list.history_id, "105");
        assert_eq!(list.next_page_token.as_deref(), Some("page-2"));
        assert_eq!(list.history.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn base64url_body_decode() {
        assert_eq!(
            decode_body_data("SGVsbG8gV29ybGQ").as_deref(),
            Some("Hello World")
        );
        assert!(decode_body_data("!!!").is_none());
    }

    #[test]
    fn entity_decode() {
        assert_eq!(
            html_entity_decode("Hello &amp; welcome &lt;team&gt;"),
            "Hello & welcome <team>"
        );
    }
}
