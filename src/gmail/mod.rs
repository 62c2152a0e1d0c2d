use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::{alphabet, Engine};
use serde::Deserialize;

pub mod client;
pub mod normalize;

pub use client::GmailClient;
pub use normalize::{parse_message, parse_threads, parse_threads_json};

pub const UNREAD_LABEL: &str = "UNREAD";

// Gmail emits unpadded base64url, but archived dumps are not always consistent.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// --- Gmail API response types ---
// Every field is optional: partial responses still deserialize and are
// filtered during normalization instead of failing the whole batch.

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawThread {
    pub id: String,
    pub history_id: Option<String>,
    pub snippet: Option<String>,
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    pub id: Option<String>,
    pub thread_id: Option<String>,
    pub history_id: Option<String>,
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    pub internal_date: Option<String>,
    pub payload: Option<RawPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawPayload {
    pub mime_type: Option<String>,
    pub headers: Vec<RawHeader>,
    pub body: Option<RawBody>,
    pub filename: Option<String>,
    pub parts: Vec<RawPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawPart {
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub body: Option<RawBody>,
    pub parts: Vec<RawPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawBody {
    pub size: Option<u64>,
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

impl RawBody {
    pub(crate) fn data(&self) -> Option<&str> {
        self.data.as_deref().filter(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadList {
    pub threads: Vec<ThreadStub>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadStub {
    pub id: String,
    pub snippet: Option<String>,
    pub history_id: Option<String>,
}

/// Decode a Gmail body: base64url (either padding style) to UTF-8 text.
pub fn decode_body_data(data: &str) -> Result<String, base64::DecodeError> {
    let standard: String = data
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let bytes = BODY_ENGINE.decode(standard)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
