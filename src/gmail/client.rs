use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode, Url};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::accounts::{AccountTokenCache, KeyValueStore, TokenRefresher, TokenStatus};
use crate::gmail::normalize::parse_threads;
use crate::gmail::{RawThread, ThreadList};
use crate::models::EmailThread;
use crate::oauth::redact_response_body;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;

/// Thin Gmail REST client: lists threads and fetches their full MIME trees.
#[derive(Debug, Clone)]
pub struct GmailClient {
    client: Client,
    api_base: String,
}

impl Default for GmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailClient {
    pub fn new() -> Self {
        Self::with_base(GMAIL_API_BASE)
    }

    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn list_thread_ids(
        &self,
        token: &str,
        label: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<String>> {
        let url = threads_url(&self.api_base)?;
        let query = list_query(label, max_results);
        let body = fetch_with_retry(&self.client, token, &url, &query).await?;
        let list: ThreadList = serde_json::from_str(&body).context("decode gmail thread list")?;
        Ok(list.threads.into_iter().map(|stub| stub.id).collect())
    }

    pub async fn get_thread(&self, token: &str, thread_id: &str) -> Result<RawThread> {
        fetch_thread(&self.client, &self.api_base, token, thread_id).await
    }

    /// Fetch and normalize the newest threads for `owner_email`.
    ///
    /// Details are fetched concurrently; results are put back in list order
    /// before normalization. Threads that fail to download are skipped.
    pub async fn fetch_threads<S, R>(
        &self,
        cache: &AccountTokenCache<S, R>,
        owner_email: &str,
        label: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<EmailThread>>
    where
        S: KeyValueStore,
        R: TokenRefresher,
    {
        let access = cache
            .get_valid_access_token(owner_email)
            .await
            .with_context(|| format!("access token for {owner_email}"))?;
        if let TokenStatus::Stale { reason } = &access.status {
            warn!("fetching threads for {owner_email} with a stale token: {reason}");
        }

        let ids = self
            .list_thread_ids(&access.token, label, max_results)
            .await?;
        debug!("gmail {owner_email}: {} thread ids listed", ids.len());

        let mut tasks = JoinSet::new();
        for (index, id) in ids.iter().enumerate() {
            let client = self.client.clone();
            let api_base = self.api_base.clone();
            let token = access.token.clone();
            let id = id.clone();
            tasks.spawn(async move {
                let result = fetch_thread(&client, &api_base, &token, &id).await;
                (index, id, result)
            });
        }

        let mut slots: Vec<Option<RawThread>> = vec![None; ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(thread))) => slots[index] = Some(thread),
                Ok((_, id, Err(error))) => {
                    warn!("skipping gmail thread {id}: {error:#}");
                }
                Err(error) => warn!("gmail thread fetch task failed: {error}"),
            }
        }

        let threads: Vec<RawThread> = slots.into_iter().flatten().collect();
        Ok(parse_threads(&threads, owner_email))
    }
}

async fn fetch_thread(
    client: &Client,
    api_base: &str,
    token: &str,
    thread_id: &str,
) -> Result<RawThread> {
    let url = thread_url(api_base, thread_id)?;
    let body = fetch_with_retry(client, token, &url, &[("format", "full".to_string())]).await?;
    serde_json::from_str(&body).with_context(|| format!("decode gmail thread {thread_id}"))
}

fn threads_url(api_base: &str) -> Result<Url> {
    Url::parse(&format!("{api_base}/users/me/threads"))
        .with_context(|| format!("invalid gmail api base: {api_base}"))
}

fn thread_url(api_base: &str, thread_id: &str) -> Result<Url> {
    let mut url = threads_url(api_base)?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("gmail api base cannot take path segments: {api_base}"))?
        .push(thread_id);
    Ok(url)
}

fn list_query(label: Option<&str>, max_results: usize) -> Vec<(&'static str, String)> {
    let mut query = vec![("maxResults", max_results.to_string())];
    if let Some(label) = label.filter(|l| !l.is_empty()) {
        query.push(("labelIds", label.to_string()));
    }
    query
}

async fn fetch_with_retry(
    client: &Client,
    token: &str,
    url: &Url,
    query: &[(&str, String)],
) -> Result<String> {
    let mut backoff_seconds = 1u64;

    for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
        let response = client
            .get(url.clone())
            .query(query)
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await
            .with_context(|| format!("gmail api request: {url}"))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            if attempt == MAX_RATE_LIMIT_RETRIES {
                let body = response
                    .text()
                    .await
                    .context("read gmail 429 response body")?;
                return Err(anyhow!(
                    "gmail api request exhausted retries: {}",
                    redact_response_body(&body)
                ));
            }

            let retry_after_seconds = retry_after(&response).unwrap_or(backoff_seconds);
            sleep(StdDuration::from_secs(retry_after_seconds)).await;
            backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
            continue;
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .context("read gmail api response body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "gmail api request failed: status={} body={}",
                status,
                redact_response_body(&body)
            ));
        }

        return Ok(body);
    }

    Err(anyhow!("gmail api request failed without response"))
}

fn retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}
