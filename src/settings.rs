use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{debug_log, restrict_file_permissions, unique_time_suffix};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub(crate) struct StoredSettings {
    pub(crate) base_url: String,
    pub(crate) subscriber_id: Option<String>,
    pub(crate) default_icon_url: Option<String>,
}

pub(crate) fn settings_file(config_dir: &Path) -> PathBuf {
    config_dir.join("settings.json")
}

pub(crate) fn read_settings(path: &Path) -> Result<StoredSettings, String> {
    if !path.exists() {
        return Ok(StoredSettings::default());
    }

    let content =
        fs::read_to_string(path).map_err(|error| format!("Failed to read settings: {error}"))?;
    match serde_json::from_str::<StoredSettings>(&content) {
        Ok(settings) => Ok(settings),
        Err(error) => {
            let backup_path = path.with_extension(format!("corrupt-{}.json", unique_time_suffix()));
            if let Err(rename_error) = fs::rename(path, &backup_path) {
                debug_log(&format!(
                    "failed to back up corrupt settings file: {rename_error}"
                ));
            } else {
                debug_log(&format!(
                    "moved corrupt settings file to {}",
                    backup_path.to_string_lossy()
                ));
            }
            debug_log(&format!("settings parse failed, starting fresh: {error}"));
            Ok(StoredSettings::default())
        }
    }
}

pub(crate) fn save_settings(path: &Path, settings: &StoredSettings) -> Result<(), String> {
    let content = serde_json::to_string_pretty(settings)
        .map_err(|error| format!("Failed to serialize settings: {error}"))?;
    let tmp_path = path.with_extension(format!("tmp-{}", unique_time_suffix()));
    fs::write(&tmp_path, content)
        .map_err(|error| format!("Failed to write settings temp file: {error}"))?;
    restrict_file_permissions(&tmp_path);
    fs::rename(&tmp_path, path)
        .map_err(|error| format!("Failed to atomically replace settings: {error}"))
}

/// The server-confirmed id always wins over a locally generated one.
pub(crate) fn persist_subscriber_id(path: &Path, subscriber_id: &str) -> Result<(), String> {
    let mut settings = read_settings(path)?;
    if settings.subscriber_id.as_deref() == Some(subscriber_id) {
        return Ok(());
    }
    settings.subscriber_id = Some(subscriber_id.to_string());
    save_settings(path, &settings)
}

pub(crate) fn normalize_base_url(input: &str) -> Result<String, String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err("Server URL is required".to_string());
    }

    let url =
        reqwest::Url::parse(trimmed).map_err(|error| format!("Invalid server URL: {error}"))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err("Server URL must start with http:// or https://".to_string());
    }

    Ok(trimmed.to_string())
}

/// Builds the streaming endpoint for one subscriber identity: ws(s) scheme,
/// `/ws` path, identity carried as a query parameter.
pub(crate) fn build_stream_ws_url(base_url: &str, subscriber_id: &str) -> Result<String, String> {
    let mut ws_url =
        reqwest::Url::parse(base_url).map_err(|error| format!("Invalid server URL: {error}"))?;

    match ws_url.scheme() {
        "http" => {
            ws_url
                .set_scheme("ws")
                .map_err(|_| "Unable to convert URL scheme to ws".to_string())?;
        }
        "https" => {
            ws_url
                .set_scheme("wss")
                .map_err(|_| "Unable to convert URL scheme to wss".to_string())?;
        }
        _ => return Err("Server URL must start with http:// or https://".to_string()),
    }

    let mut path = ws_url.path().trim_end_matches('/').to_string();
    path.push_str("/ws");
    ws_url.set_path(&path);
    ws_url
        .query_pairs_mut()
        .clear()
        .append_pair("subscriber_id", subscriber_id);
    Ok(ws_url.to_string())
}
