use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::accounts::RefreshSummary;
use crate::models::EmailThread;
use crate::output::AccountListItem;

const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 48;
const DATE_WIDTH: usize = 12;
const FLAGS_WIDTH: usize = 6;
const EMAIL_WIDTH: usize = 36;
const PROVIDER_WIDTH: usize = 8;

pub fn format_threads(threads: &[EmailThread]) -> String {
    if threads.is_empty() {
        return "No threads found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<flags$}  {:<from$}  {:<subject$}  {:<date$}\n",
        "",
        "From",
        "Subject",
        "Date",
        flags = FLAGS_WIDTH,
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH,
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(FLAGS_WIDTH),
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH)
    ));

    for thread in threads {
        let from = pad_to_width(
            &truncate_for_width(non_empty(&thread.from, "(unknown)"), FROM_WIDTH),
            FROM_WIDTH,
        );
        let subject = pad_to_width(
            &truncate_for_width(non_empty(&thread.subject, "(no subject)"), SUBJECT_WIDTH),
            SUBJECT_WIDTH,
        );
        let date = thread
            .date
            .map(relative_date)
            .unwrap_or_else(|| "-".to_string());

        out.push_str(&format!(
            "{:<flags$}  {}  {}  {:<date$}\n",
            thread_flags(thread),
            from,
            subject,
            date,
            flags = FLAGS_WIDTH,
            date = DATE_WIDTH,
        ));
    }

    out
}

pub fn format_accounts(accounts: &[AccountListItem]) -> String {
    if accounts.is_empty() {
        return "No accounts configured.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "   {:<email$}  {:<provider$}  Expires\n",
        "Email",
        "Provider",
        email = EMAIL_WIDTH,
        provider = PROVIDER_WIDTH,
    ));
    for item in accounts {
        let marker = if item.selected { "*" } else { " " };
        let email = pad_to_width(
            &truncate_for_width(&item.account.email, EMAIL_WIDTH),
            EMAIL_WIDTH,
        );
        out.push_str(&format!(
            "{marker}  {}  {:<provider$}  {}\n",
            email,
            item.account.provider.to_string(),
            relative_date(item.account.expires_at),
            provider = PROVIDER_WIDTH,
        ));
    }
    out
}

pub fn format_refresh_summary(summary: &RefreshSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("Refreshed: {}\n", summary.refreshed.len()));
    for email in &summary.refreshed {
        out.push_str(&format!("  + {email}\n"));
    }
    out.push_str(&format!("Failed (stale token kept): {}\n", summary.failed.len()));
    for email in &summary.failed {
        out.push_str(&format!("  ! {email}\n"));
    }
    out.push_str(&format!("Still valid: {}\n", summary.skipped.len()));
    out
}

fn thread_flags(thread: &EmailThread) -> String {
    let mut flags = String::new();
    flags.push(if thread.unread { '●' } else { ' ' });
    if !thread.attachments.is_empty() {
        flags.push('@');
    }
    if thread.messages.len() > 1 {
        flags.push_str(&thread.messages.len().to_string());
    }
    flags
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn relative_date(epoch_millis: i64) -> String {
    let Some(parsed) = DateTime::<Utc>::from_timestamp_millis(epoch_millis) else {
        return epoch_millis.to_string();
    };

    let now = Utc::now();
    let delta = now.signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        let ahead = parsed.signed_duration_since(now);
        if ahead.num_minutes() < 1 {
            return "in <1m".to_string();
        }
        if ahead.num_hours() < 1 {
            return format!("in {}m", ahead.num_minutes());
        }
        if ahead.num_hours() < 24 {
            return format!("in {}h", ahead.num_hours());
        }
        return parsed.format("%Y-%m-%d").to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

// `format!` pads by char count, which misaligns wide glyphs.
fn pad_to_width(value: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(value);
    let mut out = value.to_string();
    out.push_str(&" ".repeat(width.saturating_sub(current)));
    out
}
