use serde::Deserialize;
use snafu::ResultExt;

use super::error::{ClientResult, ParsePayloadSnafu, RequestSnafu, StatusSnafu};

/// One server-known session; identities only, never message content.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPage {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
    #[serde(default)]
    pub total: u64,
}

/// Lists backend sessions, used to seed conversation identities.
#[derive(Debug, Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
}

impl SessionClient {
    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn list_sessions(
        &self,
        limit: Option<u32>,
        skip: Option<u32>,
    ) -> ClientResult<SessionPage> {
        let mut request = self.http.get(format!("{}/sessions", self.base_url));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        if let Some(skip) = skip {
            request = request.query(&[("skip", skip)]);
        }

        let response = request
            .send()
            .await
            .context(RequestSnafu { stage: "list-sessions" })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage: "list-sessions",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        response
            .json()
            .await
            .context(ParsePayloadSnafu { stage: "list-sessions" })
    }
}
