pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::accounts::RefreshSummary;
use crate::models::{EmailThread, SelectedAccount};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// Account row with its selection marker, as listed by `accounts list`.
#[derive(Debug, Clone, Serialize)]
pub struct AccountListItem {
    #[serde(flatten)]
    pub account: SelectedAccount,
    pub selected: bool,
}

pub fn format_threads(format: OutputFormat, threads: &[EmailThread]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_threads(threads)),
        OutputFormat::Json => json::format_threads(threads),
    }
}

pub fn format_accounts(format: OutputFormat, accounts: &[AccountListItem]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_accounts(accounts)),
        OutputFormat::Json => json::format_accounts(accounts),
    }
}

pub fn format_refresh_summary(format: OutputFormat, summary: &RefreshSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_refresh_summary(summary)),
        OutputFormat::Json => json::format_refresh_summary(summary),
    }
}
