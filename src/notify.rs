#[cfg(target_os = "macos")]
use std::{path::PathBuf, process::Command, process::Stdio, thread};

use base64::Engine as _;
#[cfg(target_os = "macos")]
use mac_notification_sys::{MainButton, Notification, NotificationResponse};

#[cfg(target_os = "macos")]
use crate::ICON_MAX_BYTES;
use crate::{debug_log, NotificationRecord};

/// Background/system-level display surface. Implementations are best-effort:
/// a failed `show` makes the dispatcher fall back to a minimal generic
/// record, never to a dropped notification.
pub(crate) trait DisplaySurface: Send + Sync {
    fn show(&self, record: &NotificationRecord) -> Result<(), String>;
}

/// OS notification center. On macOS this drives the native notification
/// APIs; elsewhere it degrades to an operational log line so the agent
/// still runs headless.
pub(crate) struct SystemDisplay;

impl SystemDisplay {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl DisplaySurface for SystemDisplay {
    #[cfg(target_os = "macos")]
    fn show(&self, record: &NotificationRecord) -> Result<(), String> {
        let record = record.clone();
        thread::spawn(move || {
            ensure_macos_notification_application();

            let mut notification = Notification::new();
            notification
                .title(&record.title)
                .message(&record.message)
                .main_button(MainButton::SingleAction("Open"))
                .close_button("Dismiss")
                .default_sound()
                .wait_for_click(record.url.is_some())
                .asynchronous(false);

            let icon_path = record
                .icon_url
                .as_deref()
                .and_then(|icon_url| cache_data_url_icon(&record.tag, icon_url));
            if let Some(icon_path) = icon_path.as_deref() {
                notification.content_image(icon_path);
            }

            match notification.send() {
                Ok(NotificationResponse::Click) | Ok(NotificationResponse::ActionButton(_)) => {
                    if let Some(url) = record.url.as_deref() {
                        open_foreground_url(url);
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    debug_log(&format!("failed to show macOS notification: {error}"));
                }
            }
        });
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn show(&self, record: &NotificationRecord) -> Result<(), String> {
        debug_log(&format!(
            "system notification [{}] {}: {}",
            record.tag, record.title, record.message
        ));
        Ok(())
    }
}

/// Swallows display requests after logging them. Used by tests and by
/// embedders that render notifications themselves.
pub(crate) struct LogDisplay;

impl DisplaySurface for LogDisplay {
    fn show(&self, record: &NotificationRecord) -> Result<(), String> {
        debug_log(&format!(
            "display request [{}] {}: {}",
            record.tag, record.title, record.message
        ));
        Ok(())
    }
}

pub(crate) fn decode_data_url_bytes(data_url: &str, max_bytes: usize) -> Result<Vec<u8>, String> {
    let trimmed = data_url.trim();
    if !trimmed.starts_with("data:") {
        return Err("Not a data URL".to_string());
    }
    let (meta, payload) = trimmed
        .split_once(',')
        .ok_or_else(|| "Malformed data URL".to_string())?;
    let meta_lower = meta.to_ascii_lowercase();
    if !meta_lower.starts_with("data:image/") {
        return Err("Data URL is not an image".to_string());
    }
    if !meta_lower.contains(";base64") {
        return Err("Data URL is not base64 encoded".to_string());
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|error| format!("Invalid base64 payload: {error}"))?;
    if bytes.len() > max_bytes {
        return Err(format!(
            "Data URL image too large ({} bytes > {max_bytes})",
            bytes.len()
        ));
    }
    Ok(bytes)
}

#[cfg(target_os = "macos")]
fn cache_data_url_icon(tag: &str, icon_url: &str) -> Option<String> {
    if !icon_url.trim_start().starts_with("data:") {
        return None;
    }
    let icons_dir = notification_icon_cache_dir()?;
    let safe_tag: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let file_path = icons_dir.join(format!("icon-{safe_tag}.png"));
    if file_path.exists() {
        return Some(file_path.to_string_lossy().to_string());
    }

    match decode_data_url_bytes(icon_url, ICON_MAX_BYTES) {
        Ok(bytes) if !bytes.is_empty() => {
            if let Err(error) = std::fs::write(&file_path, &bytes) {
                debug_log(&format!("failed writing icon cache file: {error}"));
                return None;
            }
            Some(file_path.to_string_lossy().to_string())
        }
        Ok(_) => None,
        Err(error) => {
            debug_log(&format!("failed decoding data-url icon: {error}"));
            None
        }
    }
}

#[cfg(target_os = "macos")]
fn notification_icon_cache_dir() -> Option<PathBuf> {
    let icons_dir = crate::config_dir().ok()?.join("notification-icons");
    if std::fs::create_dir_all(&icons_dir).is_err() {
        return None;
    }
    Some(icons_dir)
}

#[cfg(target_os = "macos")]
fn open_foreground_url(url: &str) {
    if !crate::assets::has_http_scheme(url) {
        debug_log(&format!("refusing to open non-http click url: {url}"));
        return;
    }
    let status = Command::new("open")
        .arg(url)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if !matches!(status, Ok(s) if s.success()) {
        debug_log(&format!("failed to open click url: {url}"));
    }
}

#[cfg(target_os = "macos")]
fn ensure_macos_notification_application() {
    static INIT_NOTIFICATION_APP: std::sync::Once = std::sync::Once::new();
    INIT_NOTIFICATION_APP.call_once(|| {
        for bundle_id in ["com.apple.Terminal", "com.apple.Finder"] {
            match mac_notification_sys::set_application(bundle_id) {
                Ok(_) => return,
                Err(error) => {
                    debug_log(&format!(
                        "failed to set macOS notification bundle id {bundle_id}: {error}"
                    ));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::decode_data_url_bytes;

    // 1x1 transparent PNG.
    const PNG_DATA_URL: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn decodes_image_data_url() {
        let bytes = decode_data_url_bytes(PNG_DATA_URL, 1024).expect("decode");
        assert!(!bytes.is_empty());
    }

    #[test]
    fn rejects_plain_urls() {
        assert!(decode_data_url_bytes("https://example.com/a.png", 1024).is_err());
    }

    #[test]
    fn rejects_non_image_data_urls() {
        assert!(decode_data_url_bytes("data:text/plain;base64,aGk=", 1024).is_err());
    }

    #[test]
    fn rejects_oversized_payloads() {
        assert!(decode_data_url_bytes(PNG_DATA_URL, 4).is_err());
    }
}
