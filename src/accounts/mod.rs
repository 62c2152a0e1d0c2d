use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::{Provider, SelectedAccount};

pub mod store;

pub use store::{KeyValueStore, MemoryStore};

pub const ACCOUNTS_KEY: &str = "accounts";
pub const SELECTED_ACCOUNT_KEY: &str = "selected_account";

/// Tokens this close to expiry are refreshed before use.
pub const EXPIRY_MARGIN_MINUTES: i64 = 2;

#[derive(Debug, Error)]
pub enum TokenCacheError {
    #[error("no stored account for {0}")]
    NoAccessToken(String),

    #[error("account storage: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// Credential returned by the remote token exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: i64,
}

/// Remote exchange that trades an account identity for a fresh access token.
///
/// `Ok(None)` means the exchange answered without usable token data.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, email: &str, provider: Provider) -> anyhow::Result<Option<RefreshedToken>>;
}

#[async_trait]
impl<R: TokenRefresher + ?Sized> TokenRefresher for Arc<R> {
    async fn refresh(&self, email: &str, provider: Provider) -> anyhow::Result<Option<RefreshedToken>> {
        (**self).refresh(email, provider).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TokenStatus {
    Valid,
    Refreshed,
    /// Refresh failed; the stored token is handed out anyway.
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(flatten)]
    pub status: TokenStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub refreshed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

pub fn is_stale(account: &SelectedAccount, now_millis: i64) -> bool {
    account.expires_at < now_millis + Duration::minutes(EXPIRY_MARGIN_MINUTES).num_milliseconds()
}

/// Epoch millis `seconds` after `now_millis`, clamped instead of overflowing.
pub fn expires_at_after(now_millis: i64, seconds: i64) -> i64 {
    now_millis.saturating_add(seconds.saturating_mul(1000))
}

enum RefreshAttempt {
    Refreshed(SelectedAccount),
    Failed(String),
}

pub struct AccountTokenCache<S, R> {
    store: S,
    refresher: R,
    // One lock per email collapses concurrent refreshes into one call.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // Serializes load-modify-store of the persisted account list.
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore, R: TokenRefresher> AccountTokenCache<S, R> {
    pub fn new(store: S, refresher: R) -> Self {
        Self {
            store,
            refresher,
            in_flight: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn accounts(&self) -> Result<Vec<SelectedAccount>, TokenCacheError> {
        self.load_accounts().await
    }

    pub async fn selected_account(&self) -> Result<Option<SelectedAccount>, TokenCacheError> {
        let Some(raw) = self.read(SELECTED_ACCOUNT_KEY).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<SelectedAccount>(&raw) {
            Ok(account) => Ok(Some(account)),
            Err(error) => {
                warn!("ignoring malformed selected account in storage: {error}");
                Ok(None)
            }
        }
    }

    /// Store the result of an OAuth exchange or re-auth, replacing any entry
    /// with the same email.
    pub async fn upsert_account(&self, account: SelectedAccount) -> Result<(), TokenCacheError> {
        let _guard = self.write_lock.lock().await;
        let mut accounts = self.load_accounts().await?;

        if accounts.iter().any(|a| a.email == account.email) {
            replace_by_email(&mut accounts, &account);
        } else {
            accounts.push(account.clone());
        }

        self.persist_accounts(&accounts).await?;
        self.follow_selection(&[account]).await
    }

    pub async fn select_account(&self, email: &str) -> Result<SelectedAccount, TokenCacheError> {
        let accounts = self.load_accounts().await?;
        let account = accounts
            .into_iter()
            .find(|a| a.email == email)
            .ok_or_else(|| TokenCacheError::NoAccessToken(email.to_string()))?;

        self.write_json(SELECTED_ACCOUNT_KEY, &account).await?;
        Ok(account)
    }

    /// Return a usable access token for `email`, refreshing it first when it
    /// is within the expiry margin. A failed refresh hands back the stored
    /// token with [`TokenStatus::Stale`].
    pub async fn get_valid_access_token(&self, email: &str) -> Result<AccessToken, TokenCacheError> {
        let account = self.find_account(email).await?;
        if !is_stale(&account, Utc::now().timestamp_millis()) {
            return Ok(AccessToken {
                token: account.access_token,
                status: TokenStatus::Valid,
            });
        }

        let flight = self.flight_lock(email).await;
        let _flight_guard = flight.lock().await;

        // Another caller may have refreshed while this one waited.
        let account = self.find_account(email).await?;
        if !is_stale(&account, Utc::now().timestamp_millis()) {
            return Ok(AccessToken {
                token: account.access_token,
                status: TokenStatus::Valid,
            });
        }

        match self.attempt_refresh(&account).await {
            RefreshAttempt::Refreshed(updated) => {
                let token = updated.access_token.clone();
                self.apply_updates(&[updated]).await?;
                Ok(AccessToken {
                    token,
                    status: TokenStatus::Refreshed,
                })
            }
            RefreshAttempt::Failed(reason) => Ok(AccessToken {
                token: account.access_token,
                status: TokenStatus::Stale { reason },
            }),
        }
    }

    /// Refresh every stale account, one at a time, and write the list back
    /// once at the end.
    pub async fn refresh_all_access_tokens(&self) -> Result<RefreshSummary, TokenCacheError> {
        let accounts = self.load_accounts().await?;
        let mut summary = RefreshSummary::default();
        let mut updates: Vec<SelectedAccount> = Vec::new();
        // Held until the write-back so single callers wait for the new tokens.
        let mut flight_guards = Vec::new();

        for account in accounts {
            let already_handled = summary.refreshed.contains(&account.email)
                || summary.failed.contains(&account.email)
                || summary.skipped.contains(&account.email);
            if already_handled {
                continue;
            }

            if !is_stale(&account, Utc::now().timestamp_millis()) {
                summary.skipped.push(account.email);
                continue;
            }

            flight_guards.push(self.flight_lock(&account.email).await.lock_owned().await);

            // A single caller may have refreshed this email while the sweep waited.
            let account = match self.find_account(&account.email).await {
                Ok(current) => current,
                Err(TokenCacheError::NoAccessToken(_)) => continue,
                Err(error) => return Err(error),
            };
            if !is_stale(&account, Utc::now().timestamp_millis()) {
                summary.skipped.push(account.email);
                continue;
            }

            match self.attempt_refresh(&account).await {
                RefreshAttempt::Refreshed(updated) => {
                    summary.refreshed.push(updated.email.clone());
                    updates.push(updated);
                }
                RefreshAttempt::Failed(_) => summary.failed.push(account.email),
            }
        }

        if !updates.is_empty() {
            self.apply_updates(&updates).await?;
        }
        drop(flight_guards);

        Ok(summary)
    }

    async fn attempt_refresh(&self, account: &SelectedAccount) -> RefreshAttempt {
        match self.refresher.refresh(&account.email, account.provider).await {
            Ok(Some(fresh)) => {
                info!("refreshed {} token for {}", account.provider, account.email);
                RefreshAttempt::Refreshed(account.with_token(fresh.access_token, fresh.expires_at))
            }
            Ok(None) => {
                warn!(
                    "token refresh for {} returned no data; keeping stored token",
                    account.email
                );
                RefreshAttempt::Failed("refresh returned no token".to_string())
            }
            Err(error) => {
                warn!(
                    "token refresh for {} failed; keeping stored token: {error:#}",
                    account.email
                );
                RefreshAttempt::Failed(format!("{error:#}"))
            }
        }
    }

    async fn apply_updates(&self, updates: &[SelectedAccount]) -> Result<(), TokenCacheError> {
        let _guard = self.write_lock.lock().await;
        let mut accounts = self.load_accounts().await?;

        let mut changed = false;
        for update in updates {
            changed |= replace_by_email(&mut accounts, update);
        }
        if changed {
            self.persist_accounts(&accounts).await?;
        }

        self.follow_selection(updates).await
    }

    async fn follow_selection(&self, updates: &[SelectedAccount]) -> Result<(), TokenCacheError> {
        let Some(selected) = self.selected_account().await? else {
            return Ok(());
        };

        if let Some(update) = updates.iter().find(|u| u.email == selected.email) {
            if *update != selected {
                self.write_json(SELECTED_ACCOUNT_KEY, update).await?;
            }
        }
        Ok(())
    }

    async fn find_account(&self, email: &str) -> Result<SelectedAccount, TokenCacheError> {
        self.load_accounts()
            .await?
            .into_iter()
            .find(|a| a.email == email)
            .ok_or_else(|| TokenCacheError::NoAccessToken(email.to_string()))
    }

    async fn flight_lock(&self, email: &str) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        Arc::clone(in_flight.entry(email.to_string()).or_default())
    }

    async fn load_accounts(&self) -> Result<Vec<SelectedAccount>, TokenCacheError> {
        let Some(raw) = self.read(ACCOUNTS_KEY).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<SelectedAccount>>(&raw) {
            Ok(accounts) => Ok(accounts),
            Err(error) => {
                warn!("stored account list is malformed; treating as empty: {error}");
                Ok(Vec::new())
            }
        }
    }

    async fn persist_accounts(&self, accounts: &[SelectedAccount]) -> Result<(), TokenCacheError> {
        self.write_json(ACCOUNTS_KEY, accounts).await
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TokenCacheError> {
        self.store.get(key).await.map_err(TokenCacheError::Storage)
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), TokenCacheError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| TokenCacheError::Storage(anyhow::Error::new(e)))?;
        self.store
            .set(key, &raw)
            .await
            .map_err(TokenCacheError::Storage)
    }
}

/// Overwrite every entry for `update.email`. Returns whether anything changed.
fn replace_by_email(accounts: &mut [SelectedAccount], update: &SelectedAccount) -> bool {
    let mut changed = false;
    for account in accounts.iter_mut().filter(|a| a.email == update.email) {
        if account != update {
            *account = update.clone();
            changed = true;
        }
    }
    changed
}
