use anyhow::{Context, Result};
use tracing::debug;

use crate::gmail::{decode_body_data, RawBody, RawMessage, RawPart, RawPayload, RawThread, UNREAD_LABEL};
use crate::models::{Attachment, EmailMessage, EmailThread};

const TEXT_PLAIN: &str = "text/plain";
const TEXT_HTML: &str = "text/html";

/// Flatten one raw Gmail message. Returns `None` when the provider sent no
/// payload; callers skip such messages.
pub fn parse_message(message: &RawMessage) -> Option<EmailMessage> {
    let payload = message.payload.as_ref()?;

    let mut text_data = String::new();
    let mut html_data: Option<String> = None;
    let mut attachments = Vec::new();

    // Two levels only: each top-level part, then its direct children.
    for part in &payload.parts {
        apply_body_part(part, &mut text_data, &mut html_data);
        for nested in &part.parts {
            apply_body_part(nested, &mut text_data, &mut html_data);
        }

        if let Some(attachment) = attachment_from_part(part) {
            attachments.push(attachment);
        }
    }

    let html_data = html_data.unwrap_or_else(|| {
        payload
            .body
            .as_ref()
            .and_then(RawBody::data)
            .map(decode_or_empty)
            .unwrap_or_default()
    });

    let mut label_ids: Vec<String> = Vec::with_capacity(message.label_ids.len());
    for label in &message.label_ids {
        if !label_ids.contains(label) {
            label_ids.push(label.clone());
        }
    }

    Some(EmailMessage {
        message_id: message.id.clone().unwrap_or_default(),
        thread_id: message.thread_id.clone().unwrap_or_default(),
        history_id: message.history_id.clone().unwrap_or_default(),
        label_ids,
        snippet: message.snippet.clone().unwrap_or_default(),
        subject: header_value(payload, "Subject").unwrap_or_default(),
        from: header_value(payload, "From").unwrap_or_default(),
        to_recipients: split_recipients(header_value(payload, "To").as_deref()),
        cc_recipients: split_recipients(header_value(payload, "Cc").as_deref()),
        bcc_recipients: split_recipients(header_value(payload, "Bcc").as_deref()),
        text_data,
        html_data,
        date: message
            .internal_date
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok()),
        attachments,
    })
}

/// Normalize raw threads for one account. Threads without a single usable
/// message are dropped; input order is kept.
pub fn parse_threads(threads: &[RawThread], owner_email: &str) -> Vec<EmailThread> {
    threads
        .iter()
        .filter_map(|thread| parse_thread(thread, owner_email))
        .collect()
}

/// Accepts either a JSON array of threads or a single thread object.
pub fn parse_threads_json(raw: &str, owner_email: &str) -> Result<Vec<EmailThread>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("decode raw thread JSON")?;
    let threads: Vec<RawThread> = if value.is_array() {
        serde_json::from_value(value).context("decode raw thread array")?
    } else {
        vec![serde_json::from_value(value).context("decode raw thread object")?]
    };
    Ok(parse_threads(&threads, owner_email))
}

pub fn thread_is_unread(messages: &[EmailMessage]) -> bool {
    messages
        .last()
        .is_some_and(|message| message.has_label(UNREAD_LABEL))
}

fn parse_thread(thread: &RawThread, owner_email: &str) -> Option<EmailThread> {
    let messages: Vec<EmailMessage> = thread.messages.iter().filter_map(parse_message).collect();
    if messages.is_empty() {
        debug!("dropping thread {} with no parseable messages", thread.id);
        return None;
    }

    let first = messages.first()?;
    let last = messages.last()?;
    let attachments = messages
        .iter()
        .flat_map(|message| message.attachments.iter().cloned())
        .collect();

    Some(EmailThread {
        id: thread.id.clone(),
        history_id: thread.history_id.clone().unwrap_or_default(),
        email: owner_email.to_string(),
        from: first.from.clone(),
        subject: first.subject.clone(),
        snippet: last.snippet.clone(),
        date: last.date,
        unread: thread_is_unread(&messages),
        attachments,
        messages,
    })
}

/// Exact MIME match; every matching part overwrites, even one without data.
fn apply_body_part(part: &RawPart, text_data: &mut String, html_data: &mut Option<String>) {
    let body = || {
        part.body
            .as_ref()
            .and_then(RawBody::data)
            .map(decode_or_empty)
            .unwrap_or_default()
    };

    match part.mime_type.as_deref() {
        Some(TEXT_PLAIN) => *text_data = body(),
        Some(TEXT_HTML) => *html_data = Some(body()),
        _ => {}
    }
}

fn attachment_from_part(part: &RawPart) -> Option<Attachment> {
    let filename = part.filename.as_deref().filter(|name| !name.is_empty())?;
    let body = part.body.as_ref();

    Some(Attachment {
        filename: filename.to_string(),
        mime_type: part.mime_type.clone().unwrap_or_default(),
        attachment_id: body
            .and_then(|b| b.attachment_id.clone())
            .unwrap_or_default(),
        size: body.and_then(|b| b.size).unwrap_or(0),
    })
}

fn header_value(payload: &RawPayload, name: &str) -> Option<String> {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn split_recipients(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn decode_or_empty(data: &str) -> String {
    match decode_body_data(data) {
        Ok(decoded) => decoded,
        Err(error) => {
            debug!("undecodable gmail body data: {error}");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_message, parse_threads, parse_threads_json, split_recipients};
    use crate::gmail::{RawMessage, RawThread};

    fn raw_message(value: serde_json::Value) -> RawMessage {
        serde_json::from_value(value).expect("deserialize raw message")
    }

    fn raw_threads(value: serde_json::Value) -> Vec<RawThread> {
        serde_json::from_value(value).expect("deserialize raw threads")
    }

    #[test]
    fn message_without_payload_is_skipped() {
        let message = raw_message(json!({ "id": "m1", "threadId": "t1" }));
        assert!(parse_message(&message).is_none());
    }

    #[test]
    fn headers_are_case_insensitive_and_recipients_trimmed() {
        let message = raw_message(json!({
            "id": "m1",
            "threadId": "t1",
            "historyId": "7",
            "labelIds": ["INBOX", "UNREAD", "INBOX"],
            "snippet": "hey",
            "internalDate": "1735732800000",
            "payload": {
                "headers": [
                    { "name": "subject", "value": "Quarterly Review" },
                    { "name": "FROM", "value": "Alex <alex@example.com>" },
                    { "name": "To", "value": " a@example.com ,b@example.com,  Bob <bob@example.com>" },
                    { "name": "cc", "value": "c@example.com" }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.message_id, "m1");
        assert_eq!(parsed.thread_id, "t1");
        assert_eq!(parsed.history_id, "7");
        assert_eq!(parsed.label_ids, vec!["INBOX", "UNREAD"]);
        assert_eq!(parsed.subject, "Quarterly Review");
        assert_eq!(parsed.from, "Alex <alex@example.com>");
        assert_eq!(
            parsed.to_recipients,
            vec!["a@example.com", "b@example.com", "Bob <bob@example.com>"]
        );
        assert_eq!(parsed.cc_recipients, vec!["c@example.com"]);
        assert!(parsed.bcc_recipients.is_empty());
        assert_eq!(parsed.date, Some(1_735_732_800_000));
    }

    #[test]
    fn missing_or_blank_recipient_headers_give_empty_lists() {
        assert!(split_recipients(None).is_empty());
        assert!(split_recipients(Some("")).is_empty());
        assert!(split_recipients(Some("   ")).is_empty());
        assert_eq!(split_recipients(Some("a@x.com, ,b@x.com")), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn nested_html_overrides_top_level_html() {
        let message = raw_message(json!({
            "payload": {
                "parts": [
                    {
                        "mimeType": "text/html",
                        "body": { "data": "PGRpdj50b3A8L2Rpdj4=" }
                    },
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            { "mimeType": "text/html", "body": { "data": "PGRpdj5uZXN0ZWQ8L2Rpdj4=" } }
                        ]
                    }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.html_data, "<div>nested</div>");
    }

    #[test]
    fn plain_text_is_last_write_wins() {
        let message = raw_message(json!({
            "payload": {
                "parts": [
                    { "mimeType": "text/plain", "body": { "data": "cGxhaW4gb25l" } },
                    { "mimeType": "text/plain", "body": { "data": "cGxhaW4gdHdv" } }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.text_data, "plain two");
    }

    #[test]
    fn later_matching_part_without_data_clears_earlier_body() {
        let message = raw_message(json!({
            "payload": {
                "body": { "data": "PGh0bWw-Ym9keTwvaHRtbD4=" },
                "parts": [
                    { "mimeType": "text/plain", "body": { "data": "cGxhaW4gb25l" } },
                    { "mimeType": "text/html", "body": { "data": "PHA-SGVsbG88L3A-" } },
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            { "mimeType": "text/plain", "body": {} },
                            { "mimeType": "text/html" }
                        ]
                    }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.text_data, "");
        // A text/html part was seen, so the top-level body is not used.
        assert_eq!(parsed.html_data, "");
    }

    #[test]
    fn mime_type_match_is_exact() {
        let message = raw_message(json!({
            "payload": {
                "parts": [
                    { "mimeType": "text/plain", "body": { "data": "cGxhaW4gb25l" } },
                    { "mimeType": "TEXT/PLAIN", "body": { "data": "cGxhaW4gdHdv" } },
                    { "mimeType": "text/plain; charset=utf-8", "body": { "data": "cGxhaW4gdHdv" } }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.text_data, "plain one");
    }

    #[test]
    fn parts_deeper_than_two_levels_are_ignored() {
        let message = raw_message(json!({
            "payload": {
                "parts": [{
                    "mimeType": "multipart/mixed",
                    "parts": [{
                        "mimeType": "multipart/alternative",
                        "parts": [
                            { "mimeType": "text/plain", "body": { "data": "cGxhaW4gb25l" } }
                        ]
                    }]
                }]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert!(parsed.text_data.is_empty());
        assert!(parsed.html_data.is_empty());
    }

    #[test]
    fn top_level_body_is_html_fallback() {
        let message = raw_message(json!({
            "payload": {
                "mimeType": "text/html",
                "body": { "data": "PGh0bWw-Ym9keTwvaHRtbD4=" },
                "parts": [
                    { "mimeType": "text/plain", "body": { "data": "cGxhaW4gb25l" } }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.html_data, "<html>body</html>");
        assert_eq!(parsed.text_data, "plain one");
    }

    #[test]
    fn top_level_body_is_ignored_when_a_part_has_html() {
        let message = raw_message(json!({
            "payload": {
                "body": { "data": "PGh0bWw-Ym9keTwvaHRtbD4=" },
                "parts": [
                    { "mimeType": "text/html", "body": { "data": "PHA-SGVsbG88L3A-" } }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.html_data, "<p>Hello</p>");
    }

    #[test]
    fn attachment_fields_survive_parsing() {
        let message = raw_message(json!({
            "payload": {
                "parts": [
                    { "mimeType": "text/plain", "body": { "data": "cGxhaW4gb25l" } },
                    {
                        "mimeType": "application/pdf",
                        "filename": "report.pdf",
                        "body": { "size": 50000, "attachmentId": "att-1" }
                    },
                    {
                        "mimeType": "multipart/alternative",
                        "filename": "",
                        "parts": [
                            { "mimeType": "image/png", "filename": "nested.png", "body": { "size": 10 } }
                        ]
                    }
                ]
            }
        }));

        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename, "report.pdf");
        assert_eq!(attachment.mime_type, "application/pdf");
        assert_eq!(attachment.attachment_id, "att-1");
        assert_eq!(attachment.size, 50000);
    }

    #[test]
    fn attachment_defaults_when_body_missing() {
        let message = raw_message(json!({
            "payload": { "parts": [{ "filename": "notes.txt" }] }
        }));

        let parsed = parse_message(&message).expect("parse message");
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename, "notes.txt");
        assert_eq!(attachment.mime_type, "");
        assert_eq!(attachment.attachment_id, "");
        assert_eq!(attachment.size, 0);
    }

    #[test]
    fn unparseable_internal_date_is_none() {
        let message = raw_message(json!({
            "internalDate": "yesterday",
            "payload": {}
        }));
        let parsed = parse_message(&message).expect("parse message");
        assert_eq!(parsed.date, None);
    }

    #[test]
    fn single_message_thread_scenario() {
        let threads = raw_threads(json!([{
            "id": "t1",
            "messages": [{
                "payload": {
                    "headers": [{ "name": "Subject", "value": "Hi" }],
                    "parts": [{ "mimeType": "text/plain", "body": { "data": "aGVsbG8=" } }]
                },
                "labelIds": ["UNREAD"],
                "internalDate": "1000"
            }]
        }]));

        let parsed = parse_threads(&threads, "me@example.com");
        assert_eq!(parsed.len(), 1);
        let thread = &parsed[0];
        assert_eq!(thread.id, "t1");
        assert_eq!(thread.email, "me@example.com");
        assert_eq!(thread.subject, "Hi");
        assert_eq!(thread.messages[0].text_data, "hello");
        assert!(thread.unread);
        assert_eq!(thread.date, Some(1000));
    }

    #[test]
    fn thread_identity_from_first_message_news_from_last() {
        let threads = raw_threads(json!([{
            "id": "t1",
            "historyId": "42",
            "messages": [
                {
                    "snippet": "first",
                    "internalDate": "1000",
                    "labelIds": ["UNREAD"],
                    "payload": {
                        "headers": [
                            { "name": "Subject", "value": "Kickoff" },
                            { "name": "From", "value": "alice@example.com" }
                        ],
                        "parts": [{ "mimeType": "text/csv", "filename": "a.csv", "body": { "size": 3 } }]
                    }
                },
                { "id": "broken" },
                {
                    "snippet": "latest",
                    "internalDate": "2000",
                    "labelIds": ["INBOX"],
                    "payload": {
                        "headers": [
                            { "name": "Subject", "value": "Re: Kickoff" },
                            { "name": "From", "value": "bob@example.com" }
                        ],
                        "parts": [{ "mimeType": "image/png", "filename": "b.png", "body": { "size": 4 } }]
                    }
                }
            ]
        }]));

        let parsed = parse_threads(&threads, "me@example.com");
        let thread = &parsed[0];
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.history_id, "42");
        assert_eq!(thread.subject, "Kickoff");
        assert_eq!(thread.from, "alice@example.com");
        assert_eq!(thread.snippet, "latest");
        assert_eq!(thread.date, Some(2000));
        assert!(!thread.unread);
        let names: Vec<&str> = thread.attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.png"]);
    }

    #[test]
    fn empty_threads_are_dropped_and_order_kept() {
        let threads = raw_threads(json!([
            { "id": "t3", "messages": [{ "payload": {}, "internalDate": "3" }] },
            { "id": "empty", "messages": [] },
            { "id": "no-payload", "messages": [{ "id": "m" }] },
            { "id": "t1", "messages": [{ "payload": {}, "internalDate": "1" }] }
        ]));

        let ids: Vec<String> = parse_threads(&threads, "me@example.com")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["t3", "t1"]);
    }

    #[test]
    fn json_entry_point_accepts_object_or_array() {
        let object = r#"{"id":"t1","messages":[{"payload":{}}]}"#;
        assert_eq!(parse_threads_json(object, "me@example.com").expect("object").len(), 1);

        let array = r#"[{"id":"t1","messages":[{"payload":{}}]},{"id":"t2","messages":[]}]"#;
        assert_eq!(parse_threads_json(array, "me@example.com").expect("array").len(), 1);

        assert!(parse_threads_json("not json", "me@example.com").is_err());
    }
}
