use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Outlook,
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Google => write!(f, "google"),
            Self::Outlook => write!(f, "outlook"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gmail" => Ok(Self::Google),
            "outlook" | "microsoft" => Ok(Self::Outlook),
            other => Err(format!("invalid provider: {other}")),
        }
    }
}

/// One signed-in account and its current OAuth access token.
///
/// `expires_at` is epoch milliseconds. The camelCase field names match the
/// account list the desktop client keeps in local storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedAccount {
    pub email: String,
    pub provider: Provider,
    pub access_token: String,
    pub expires_at: i64,
}

impl SelectedAccount {
    /// Same identity, new credential.
    pub fn with_token(&self, access_token: String, expires_at: i64) -> Self {
        Self {
            email: self.email.clone(),
            provider: self.provider,
            access_token,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub attachment_id: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub message_id: String,
    pub thread_id: String,
    pub history_id: String,
    pub label_ids: Vec<String>,
    pub snippet: String,
    pub subject: String,
    pub from: String,
    pub to_recipients: Vec<String>,
    pub cc_recipients: Vec<String>,
    pub bcc_recipients: Vec<String>,
    pub text_data: String,
    pub html_data: String,
    /// Provider `internalDate` in epoch milliseconds; `None` when the raw
    /// value was missing or not an integer.
    pub date: Option<i64>,
    pub attachments: Vec<Attachment>,
}

impl EmailMessage {
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailThread {
    pub id: String,
    pub history_id: String,
    /// Account that owns the thread.
    pub email: String,
    pub from: String,
    pub subject: String,
    pub snippet: String,
    pub date: Option<i64>,
    pub unread: bool,
    pub attachments: Vec<Attachment>,
    pub messages: Vec<EmailMessage>,
}

#[cfg(test)]
mod tests {
    use super::{Provider, SelectedAccount};

    #[test]
    fn provider_display_and_parse() {
        assert_eq!(Provider::Google.to_string(), "google");
        assert_eq!(
            "Outlook".parse::<Provider>().expect("parse provider"),
            Provider::Outlook
        );
        assert_eq!(
            "gmail".parse::<Provider>().expect("parse alias"),
            Provider::Google
        );
        assert!("yahoo".parse::<Provider>().is_err());
    }

    #[test]
    fn selected_account_uses_camel_case_storage_shape() {
        let account = SelectedAccount {
            email: "me@example.com".to_string(),
            provider: Provider::Google,
            access_token: "ya29.token".to_string(),
            expires_at: 1_700_000_000_000,
        };

        let value = serde_json::to_value(&account).expect("serialize account");
        assert_eq!(value["accessToken"], "ya29.token");
        assert_eq!(value["expiresAt"], 1_700_000_000_000i64);
        assert_eq!(value["provider"], "google");

        let decoded: SelectedAccount =
            serde_json::from_value(value).expect("deserialize account");
        assert_eq!(decoded, account);
    }

    #[test]
    fn with_token_keeps_identity() {
        let account = SelectedAccount {
            email: "me@example.com".to_string(),
            provider: Provider::Outlook,
            access_token: "old".to_string(),
            expires_at: 1,
        };
        let updated = account.with_token("new".to_string(), 2);
        assert_eq!(updated.email, "me@example.com");
        assert_eq!(updated.provider, Provider::Outlook);
        assert_eq!(updated.access_token, "new");
        assert_eq!(updated.expires_at, 2);
    }
}
