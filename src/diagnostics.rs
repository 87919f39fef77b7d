use serde::Serialize;

use crate::{debug_log, unix_now_secs, AgentState, ConnectionPhase, ForegroundEvent};

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RuntimeDiagnostics {
    pub(crate) phase: String,
    pub(crate) subscriber_id: Option<String>,
    pub(crate) connected: bool,
    pub(crate) attempt: u64,
    pub(crate) backoff_seconds: u64,
    pub(crate) last_connected_at: Option<u64>,
    pub(crate) last_event_at: Option<u64>,
    pub(crate) last_delivery_at: Option<u64>,
    pub(crate) stale_for_seconds: Option<u64>,
    pub(crate) last_error: Option<String>,
}

pub(crate) fn snapshot_runtime(state: &AgentState) -> Result<RuntimeDiagnostics, String> {
    let runtime = state
        .runtime
        .lock()
        .map_err(|_| "Runtime lock poisoned".to_string())?;

    let now = unix_now_secs();
    let stale_for_seconds = runtime.last_event_at.map(|last| now.saturating_sub(last));

    Ok(RuntimeDiagnostics {
        phase: runtime.phase.as_str().to_string(),
        subscriber_id: runtime.subscriber_id.clone(),
        connected: runtime.phase == ConnectionPhase::Open,
        attempt: runtime.attempt,
        backoff_seconds: runtime.backoff_seconds,
        last_connected_at: runtime.last_connected_at,
        last_event_at: runtime.last_event_at,
        last_delivery_at: runtime.last_delivery_at,
        stale_for_seconds,
        last_error: runtime.last_error.clone(),
    })
}

pub(crate) fn emit_runtime_diagnostics(state: &AgentState) {
    match snapshot_runtime(state) {
        Ok(diag) => {
            let _ = state
                .foreground
                .broadcast(&ForegroundEvent::StoreConnectionState(diag));
        }
        Err(err) => {
            debug_log(&format!("failed to snapshot runtime: {err}"));
        }
    }
}

pub(crate) fn mark_stream_activity(state: &AgentState, at: u64) {
    if let Ok(mut runtime) = state.runtime.lock() {
        runtime.last_event_at = Some(at);
    }
    emit_runtime_diagnostics(state);
}
