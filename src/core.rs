#[cfg(debug_assertions)]
use std::io::Write as _;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt as _;
use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Monotonic counter for generating unique temp/backup file suffixes and
/// locally generated subscriber ids.
static FILE_SUFFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn config_dir() -> Result<PathBuf, String> {
    let dir = match std::env::var_os("NOTIFY_AGENT_CONFIG_DIR") {
        Some(value) => PathBuf::from(value),
        None => {
            let home = std::env::var_os("HOME")
                .ok_or_else(|| "HOME is not set and NOTIFY_AGENT_CONFIG_DIR is unset".to_string())?;
            PathBuf::from(home).join(".config").join("notify-agent")
        }
    };

    fs::create_dir_all(&dir)
        .map_err(|error| format!("Failed to create config directory: {error}"))?;
    Ok(dir)
}

pub(crate) fn restrict_file_permissions(path: &Path) {
    #[cfg(unix)]
    if path.exists() {
        if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            debug_log(&format!(
                "restrict_file_permissions: failed for {path:?}: {error}"
            ));
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

pub(crate) fn redact_ws_url(url: &str) -> String {
    let mut parsed = match reqwest::Url::parse(url) {
        Ok(url) => url,
        Err(_) => return "<invalid-url>".to_string(),
    };
    if parsed.query().is_some() {
        parsed.set_query(Some("subscriber_id=***"));
    }
    parsed.to_string()
}

pub(crate) fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn unique_time_suffix() -> u64 {
    FILE_SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn generate_subscriber_id() -> String {
    format!("sub-{}-{}", unix_now_secs(), unique_time_suffix())
}

/// Runs `operation` up to `schedule.len()` times, sleeping the scheduled
/// delay after each failed attempt (the last failure is returned as-is).
/// Callers signal a definitive, non-retryable outcome by returning `Ok`
/// with a terminal value instead of `Err`.
pub(crate) async fn retry_with_schedule<T, F, Fut>(
    mut operation: F,
    schedule: &[u64],
) -> Result<T, String>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut last_error = "retry schedule is empty".to_string();
    for (attempt, delay_ms) in schedule.iter().enumerate() {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                debug_log(&format!(
                    "retry attempt {} failed: {error}",
                    attempt.saturating_add(1)
                ));
                last_error = error;
                if attempt + 1 < schedule.len() {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
            }
        }
    }
    Err(last_error)
}

pub(crate) fn debug_log(message: &str) {
    #[cfg(not(debug_assertions))]
    let _ = message;
    #[cfg(debug_assertions)]
    {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[notify-agent][{ts}] {message}\n");
        eprint!("{line}");
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("/tmp/notify-agent.log")
        {
            let _ = file.write_all(line.as_bytes());
        }
    }
}
