use braid_transcript::{
    BoxFuture, ConversationId, HistoryFetchError, HistoryQuery, HistorySource, PersistedExchange,
};
use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;

/// Fetches persisted chat pairs for a session from the backend.
///
/// A 404 or an empty page means "no history yet" and yields an empty list;
/// only transport and decode failures surface as errors, and the reconciler
/// treats those as a degraded (empty) view anyway.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(alias = "chats", default)]
    items: Vec<HistoryRecord>,
}

#[derive(Debug, Deserialize)]
struct HistoryRecord {
    id: String,
    #[serde(default)]
    user_message: String,
    #[serde(default)]
    assistant_message: String,
    #[serde(default)]
    created_at: Option<String>,
}

impl HistoryClient {
    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> Result<Vec<PersistedExchange>, HistoryFetchError> {
        let url = format!("{}/sessions/{conversation_id}/chats", self.base_url);
        let mut request = self.http.get(url);
        if let Some(limit) = query.limit {
            request = request.query(&[("limit", limit)]);
        }
        if let Some(skip) = query.skip {
            request = request.query(&[("skip", skip)]);
        }

        let response = request.send().await.map_err(|source| HistoryFetchError {
            stage: "fetch-history",
            detail: source.to_string(),
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryFetchError {
                stage: "fetch-history",
                detail: format!("backend returned status {status}"),
            });
        }

        let page: HistoryPage = response.json().await.map_err(|source| HistoryFetchError {
            stage: "parse-history",
            detail: source.to_string(),
        })?;

        Ok(page
            .items
            .into_iter()
            .map(|record| PersistedExchange {
                record_id: record.id,
                user_message: record.user_message,
                assistant_message: record.assistant_message,
                created_at_unix_ms: record.created_at.as_deref().and_then(parse_created_at_ms),
            })
            .collect())
    }
}

impl HistorySource for HistoryClient {
    fn fetch_exchanges(
        &self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> BoxFuture<'_, Result<Vec<PersistedExchange>, HistoryFetchError>> {
        Box::pin(self.fetch_page(conversation_id, query))
    }
}

/// Parses the backend's `created_at` strings, which arrive either as full
/// RFC 3339 or as a zone-less ISO timestamp (treated as UTC).
fn parse_created_at_ms(raw: &str) -> Option<u64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.timestamp_millis().try_into().ok();
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| naive.and_utc().timestamp_millis().try_into().ok())
}
