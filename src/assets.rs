use std::time::Duration;

use crate::{debug_log, retry_with_schedule, ASSET_PROBE_TIMEOUT_SECS, ASSET_RETRY_DELAYS_MS};

#[derive(Debug)]
enum ProbeVerdict {
    Image,
    NotImage(String),
    /// The probe was refused, not the resource itself. The display surface
    /// may carry credentials this probe does not, so the URL is still
    /// worth handing over.
    AccessDenied(u16),
}

/// Confirms that `url` points at a fetchable image. Returns the URL to use
/// or `None`; never an error, because an image is decorative and must not
/// block delivery. Transient failures are retried on a bounded schedule to
/// allow for images that finish propagating shortly after the event fires.
pub(crate) async fn validate_image_url(client: &reqwest::Client, url: &str) -> Option<String> {
    let url = url.trim();
    if !has_http_scheme(url) {
        debug_log(&format!("image url rejected, not http(s): {url}"));
        return None;
    }

    match retry_with_schedule(|_| probe_once(client, url), &ASSET_RETRY_DELAYS_MS).await {
        Ok(ProbeVerdict::Image) => Some(url.to_string()),
        Ok(ProbeVerdict::NotImage(content_type)) => {
            debug_log(&format!(
                "image url rejected, content-type {content_type}: {url}"
            ));
            None
        }
        Ok(ProbeVerdict::AccessDenied(status)) => {
            debug_log(&format!(
                "image probe denied with HTTP {status}, using url optimistically: {url}"
            ));
            Some(url.to_string())
        }
        Err(error) => {
            debug_log(&format!("image validation exhausted retries: {error}"));
            None
        }
    }
}

pub(crate) fn has_http_scheme(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

async fn probe_once(client: &reqwest::Client, url: &str) -> Result<ProbeVerdict, String> {
    let timeout = Duration::from_secs(ASSET_PROBE_TIMEOUT_SECS);
    let response = client
        .head(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|error| format!("Image probe request failed: {error}"))?;

    // Servers without HEAD support get a full fetch instead.
    let response = if matches!(response.status().as_u16(), 405 | 501) {
        client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|error| format!("Image fallback request failed: {error}"))?
    } else {
        response
    };

    let status = response.status().as_u16();
    if matches!(status, 401 | 403) {
        return Ok(ProbeVerdict::AccessDenied(status));
    }
    if !response.status().is_success() {
        return Err(format!("Image probe returned HTTP {status}"));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if content_type.starts_with("image/") {
        Ok(ProbeVerdict::Image)
    } else {
        Ok(ProbeVerdict::NotImage(content_type))
    }
}
