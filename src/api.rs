use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};

use crate::{
    debug_log, dispatch,
    dispatch::DispatchOutcome,
    settings, truncate_text, unix_now_secs, AgentState, DeliveryChannel,
    API_REQUEST_TIMEOUT_SECS, BACKFILL_LOOKBACK_SECS,
};

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    subscriber_id: &'a str,
    platform: &'a str,
    registered_at: u64,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RegisteredSubscriber {
    subscriber_id: String,
}

/// Registers the subscriber descriptor with the source. The
/// server-confirmed id wins over the locally generated one and is
/// persisted before being returned.
pub(crate) async fn register_subscriber(
    state: &Arc<AgentState>,
    local_id: &str,
) -> Result<String, String> {
    let endpoint = format!("{}/api/subscribers", state.base_url);
    let response = state
        .http
        .post(&endpoint)
        .timeout(Duration::from_secs(API_REQUEST_TIMEOUT_SECS))
        .json(&RegisterRequest {
            subscriber_id: local_id,
            platform: std::env::consts::OS,
            registered_at: unix_now_secs(),
        })
        .send()
        .await
        .map_err(|error| format!("Subscriber registration failed: {error}"))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read response body>".to_string());
        return Err(format!(
            "Subscriber registration failed with HTTP {status}: {}",
            truncate_text(&body, 200)
        ));
    }

    let envelope = response
        .json::<ApiEnvelope<RegisteredSubscriber>>()
        .await
        .map_err(|error| format!("Failed to decode registration response: {error}"))?;

    let confirmed = envelope.success;
    let confirmed = envelope
        .data
        .filter(|_| confirmed)
        .map(|data| data.subscriber_id)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| local_id.to_string());
    if confirmed != local_id {
        debug_log(&format!(
            "server assigned subscriber id {confirmed}, replacing {local_id}"
        ));
    }
    settings::persist_subscriber_id(&state.settings_path, &confirmed)?;
    Ok(confirmed)
}

/// Fetches notifications that arrived while the agent was offline and runs
/// them through the normal delivery pipeline; dedup decides what is new.
/// Returns how many records were actually delivered.
pub(crate) async fn backfill_missed(state: &Arc<AgentState>) -> Result<usize, String> {
    let (subscriber_id, since) = {
        let runtime = state
            .runtime
            .lock()
            .map_err(|_| "Runtime lock poisoned".to_string())?;
        let subscriber_id = runtime
            .subscriber_id
            .clone()
            .ok_or_else(|| "No subscriber identity for backfill".to_string())?;
        let since = runtime
            .last_delivery_at
            .unwrap_or_else(|| unix_now_secs().saturating_sub(BACKFILL_LOOKBACK_SECS));
        (subscriber_id, since)
    };

    let endpoint = format!("{}/api/notifications/missed", state.base_url);
    let response = state
        .http
        .post(&endpoint)
        .timeout(Duration::from_secs(API_REQUEST_TIMEOUT_SECS))
        .json(&serde_json::json!({
            "subscriber_id": subscriber_id,
            "since": since,
        }))
        .send()
        .await
        .map_err(|error| format!("Backfill request failed: {error}"))?;

    if !response.status().is_success() {
        return Err(format!(
            "Backfill request failed with HTTP {}",
            response.status().as_u16()
        ));
    }

    let envelope = response
        .json::<ApiEnvelope<Vec<Value>>>()
        .await
        .map_err(|error| format!("Failed to decode backfill response: {error}"))?;

    let records = envelope.data.unwrap_or_default();
    let total = records.len();
    let mut delivered = 0usize;
    for value in &records {
        if matches!(
            dispatch::dispatch_value(state, value, DeliveryChannel::Push).await,
            DispatchOutcome::Delivered { .. }
        ) {
            delivered += 1;
        }
    }
    debug_log(&format!("backfill delivered {delivered} of {total} records"));
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::{backfill_missed, register_subscriber};
    use crate::{notify::LogDisplay, settings, AgentState};
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    async fn spawn_json_responder(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn server_confirmed_id_wins_and_is_persisted() {
        let body = r#"{"success":true,"data":{"subscriber_id":"srv-9"}}"#;
        let base_url = spawn_json_responder(body).await;
        let state = Arc::new(AgentState::for_tests_with_base_url(
            Box::new(LogDisplay),
            base_url,
        ));

        let confirmed = register_subscriber(&state, "sub-local").await.expect("register");
        assert_eq!(confirmed, "srv-9");

        let stored = settings::read_settings(&state.settings_path).expect("settings");
        assert_eq!(stored.subscriber_id.as_deref(), Some("srv-9"));
        let _ = std::fs::remove_file(&state.settings_path);
    }

    #[tokio::test]
    async fn unconfirmed_registration_keeps_the_local_id() {
        let body = r#"{"success":false}"#;
        let base_url = spawn_json_responder(body).await;
        let state = Arc::new(AgentState::for_tests_with_base_url(
            Box::new(LogDisplay),
            base_url,
        ));

        let confirmed = register_subscriber(&state, "sub-local").await.expect("register");
        assert_eq!(confirmed, "sub-local");
        let _ = std::fs::remove_file(&state.settings_path);
    }

    #[tokio::test]
    async fn backfill_feeds_records_through_dedup() {
        let body = r#"{"success":true,"data":[
            {"id":"m1","title":"A","message":"a"},
            {"id":"m2","title":"B","message":"b"}
        ]}"#;
        let base_url = spawn_json_responder(body).await;
        let state = Arc::new(AgentState::for_tests_with_base_url(
            Box::new(LogDisplay),
            base_url,
        ));
        {
            let mut runtime = state.runtime.lock().expect("runtime lock");
            runtime.subscriber_id = Some("sub-1".to_string());
        }

        assert_eq!(backfill_missed(&state).await.expect("backfill"), 2);
        // a second pass recovers nothing new
        assert_eq!(backfill_missed(&state).await.expect("backfill"), 0);
    }

    #[tokio::test]
    async fn backfill_requires_an_identity() {
        let state = Arc::new(AgentState::for_tests(Box::new(LogDisplay)));
        assert!(backfill_missed(&state).await.is_err());
    }
}
