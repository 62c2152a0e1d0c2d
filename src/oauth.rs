use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::accounts::{RefreshedToken, TokenRefresher};
use crate::models::Provider;

const REDACTED_BODY_MAX_LEN: usize = 200;

/// Refreshes access tokens through the app's token exchange endpoint, which
/// holds the refresh tokens and client secrets.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    email: &'a str,
    provider: Provider,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RefreshResponse {
    access_token: Option<String>,
    expires_at: Option<serde_json::Value>,
}

impl HttpTokenRefresher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, email: &str, provider: Provider) -> Result<Option<RefreshedToken>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("accept", "application/json")
            .json(&RefreshRequest { email, provider })
            .send()
            .await
            .with_context(|| format!("request token refresh from {}", self.endpoint))?;

        let status = response.status();
        let body = response.text().await.context("read token refresh response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "token refresh failed: status={} body={}",
                status,
                redact_response_body(&body)
            ));
        }

        decode_refresh_body(&body)
    }
}

fn decode_refresh_body(body: &str) -> Result<Option<RefreshedToken>> {
    if body.trim().is_empty() {
        return Ok(None);
    }

    let payload: RefreshResponse =
        serde_json::from_str(body).context("decode token refresh JSON response")?;

    let Some(access_token) = payload.access_token.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let Some(expires_at) = payload.expires_at.as_ref().and_then(expires_at_millis) else {
        return Ok(None);
    };

    Ok(Some(RefreshedToken {
        access_token,
        expires_at,
    }))
}

/// Epoch milliseconds from either a number or an RFC 3339 timestamp.
fn expires_at_millis(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }),
        _ => None,
    }
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}
