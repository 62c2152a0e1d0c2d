use anyhow::Result;

use crate::accounts::RefreshSummary;
use crate::models::EmailThread;
use crate::output::AccountListItem;

pub fn format_threads(threads: &[EmailThread]) -> Result<String> {
    Ok(serde_json::to_string_pretty(threads)?)
}

pub fn format_accounts(accounts: &[AccountListItem]) -> Result<String> {
    Ok(serde_json::to_string_pretty(accounts)?)
}

pub fn format_refresh_summary(summary: &RefreshSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}
