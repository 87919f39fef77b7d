use serde_json::Value;

use crate::{
    truncate_text, unix_now_secs, DeliveryChannel, NotificationRecord, NotificationSource,
    DEFAULT_MESSAGE, DEFAULT_TITLE, MESSAGE_MAX_CHARS, TITLE_MAX_CHARS,
};

/// Recognized inbound envelope shapes. Field probing happens against a
/// closed set of variants with an explicit fallback, never ad hoc.
#[derive(Debug)]
enum Envelope<'a> {
    /// Any JSON object: gateway envelopes (`{notification, data}`), stream
    /// frames (`{type: "notification", data: {...}}`) and flat custom
    /// objects all resolve through the same fixed priority table.
    Object(&'a Value),
    /// Payload that is not JSON at all; delivered as the message body.
    Text(&'a str),
    /// Empty push. The source cannot retry an accepted push, so this still
    /// produces a displayable record.
    Empty,
}

fn classify<'a>(raw: Option<&'a str>, parsed: &'a Option<Value>) -> Envelope<'a> {
    let raw = match raw {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Envelope::Empty,
    };
    match parsed {
        Some(value) if value.is_object() => Envelope::Object(value),
        _ => Envelope::Text(raw),
    }
}

/// Converts a raw inbound payload into a canonical record. Total: every
/// input, including malformed JSON and empty payloads, yields a record
/// with a non-empty title.
pub(crate) fn normalize(raw: Option<&str>, channel: DeliveryChannel) -> NotificationRecord {
    let parsed = raw.and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    match classify(raw, &parsed) {
        Envelope::Object(value) => normalize_value(value, channel),
        Envelope::Text(text) => build_record(
            None,
            String::new(),
            text.to_string(),
            None,
            None,
            None,
            None,
            channel.default_source(),
        ),
        Envelope::Empty => build_record(
            None,
            String::new(),
            String::new(),
            None,
            None,
            None,
            None,
            channel.default_source(),
        ),
    }
}

/// Normalizes an already-parsed JSON object (stream frames arrive parsed).
pub(crate) fn normalize_value(value: &Value, channel: DeliveryChannel) -> NotificationRecord {
    let id = resolve(value, &[&["id"], &["notification", "id"], &["data", "id"]]);
    let title = resolve(
        value,
        &[&["title"], &["notification", "title"], &["data", "title"]],
    )
    .unwrap_or_default();
    let message = resolve(
        value,
        &[
            &["message"],
            &["body"],
            &["notification", "message"],
            &["notification", "body"],
            &["data", "message"],
            &["data", "body"],
        ],
    )
    .unwrap_or_default();
    let image_url = resolve(
        value,
        &[
            &["image"],
            &["notification", "image"],
            &["template", "image"],
            &["data", "image"],
        ],
    );
    let icon_url = resolve(
        value,
        &[&["icon"], &["notification", "icon"], &["data", "icon"]],
    );
    let url = resolve(value, &[&["url"], &["notification", "url"], &["data", "url"]]);
    let tag = resolve(value, &[&["tag"], &["notification", "tag"], &["data", "tag"]]);
    let source = resolve(
        value,
        &[&["source"], &["notification", "source"], &["data", "source"]],
    )
    .map(|source| parse_source(&source, channel))
    .unwrap_or_else(|| channel.default_source());

    build_record(id, title, message, image_url, icon_url, url, tag, source)
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    id: Option<String>,
    title: String,
    message: String,
    image_url: Option<String>,
    icon_url: Option<String>,
    url: Option<String>,
    tag: Option<String>,
    source: NotificationSource,
) -> NotificationRecord {
    let (title, message) = if title.trim().is_empty() && message.trim().is_empty() {
        (DEFAULT_TITLE.to_string(), DEFAULT_MESSAGE.to_string())
    } else if title.trim().is_empty() {
        (DEFAULT_TITLE.to_string(), message)
    } else {
        (title, message)
    };

    let title = truncate_text(&title, TITLE_MAX_CHARS);
    let message = truncate_text(&message, MESSAGE_MAX_CHARS);
    let id = match id {
        Some(id) if !id.trim().is_empty() => id,
        // Known heuristic: distinct notifications sharing title and message
        // within the dedup window collapse into one identity.
        _ => derive_identity(&title, &message),
    };
    let tag = match tag {
        Some(tag) if !tag.trim().is_empty() => tag,
        _ => id.clone(),
    };

    NotificationRecord {
        id,
        title,
        message,
        image_url,
        icon_url,
        url,
        tag,
        timestamp: unix_now_secs(),
        source,
    }
}

pub(crate) fn derive_identity(title: &str, message: &str) -> String {
    format!("{title}::{message}")
}

fn parse_source(raw: &str, channel: DeliveryChannel) -> NotificationSource {
    match raw.to_ascii_lowercase().as_str() {
        "push" => NotificationSource::Push,
        "stream" => NotificationSource::Stream,
        "test" => NotificationSource::Test,
        "setup" => NotificationSource::Setup,
        _ => channel.default_source(),
    }
}

/// Walks `paths` in order and returns the first non-empty string value.
/// Numeric values are accepted for id-like fields and stringified.
fn resolve(value: &Value, paths: &[&[&str]]) -> Option<String> {
    for path in paths {
        let mut current = value;
        let mut found = true;
        for key in *path {
            match current.get(key) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        match current {
            Value::String(text) if !text.trim().is_empty() => return Some(text.clone()),
            Value::Number(number) => return Some(number.to_string()),
            _ => {}
        }
    }
    None
}
