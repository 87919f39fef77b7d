use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    debug_log, settings, stream, AgentState, ConnectionPhase, ControlMessage, ControlRequest,
    ForegroundEvent, StatusReply,
};

/// Processes control messages from foreground contexts, one at a time in
/// arrival order. `GET_STATUS` answers synchronously through the message's
/// reply channel; everything else is fire-and-forget.
pub(crate) async fn run_control_loop(
    state: Arc<AgentState>,
    mut rx: mpsc::UnboundedReceiver<ControlMessage>,
) {
    while let Some(message) = rx.recv().await {
        handle_control(&state, message);
    }
    debug_log("control channel closed");
}

fn handle_control(state: &Arc<AgentState>, message: ControlMessage) {
    match &message.request {
        ControlRequest::ConnectWebsocket => match resolve_subscriber_id(state) {
            Ok(subscriber_id) => {
                if let Err(error) = stream::connect(state, &subscriber_id) {
                    debug_log(&format!("connect request failed: {error}"));
                    let _ = state
                        .foreground
                        .broadcast(&ForegroundEvent::WebsocketError { error });
                }
            }
            Err(error) => {
                debug_log(&format!("connect request rejected: {error}"));
                let _ = state
                    .foreground
                    .broadcast(&ForegroundEvent::WebsocketError { error });
            }
        },
        ControlRequest::DisconnectWebsocket => {
            if let Err(error) = stream::disconnect(state) {
                debug_log(&format!("disconnect request failed: {error}"));
            }
        }
        ControlRequest::SetSubscriberId { subscriber_id } => {
            set_subscriber_id(state, subscriber_id);
        }
        ControlRequest::GetStatus => {}
    }

    if let Some(reply) = message.reply {
        let _ = reply.send(status_snapshot(state));
    }
}

fn resolve_subscriber_id(state: &Arc<AgentState>) -> Result<String, String> {
    if let Ok(runtime) = state.runtime.lock() {
        if let Some(subscriber_id) = runtime.subscriber_id.clone() {
            return Ok(subscriber_id);
        }
    }
    let stored = settings::read_settings(&state.settings_path)?;
    stored
        .subscriber_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| "No subscriber id registered".to_string())
}

fn set_subscriber_id(state: &Arc<AgentState>, subscriber_id: &str) {
    if subscriber_id.trim().is_empty() {
        debug_log("ignoring empty subscriber id");
        return;
    }
    if let Err(error) = settings::persist_subscriber_id(&state.settings_path, subscriber_id) {
        debug_log(&format!("failed to persist subscriber id: {error}"));
        return;
    }

    let needs_reconnect = state
        .runtime
        .lock()
        .map(|runtime| {
            !matches!(runtime.phase, ConnectionPhase::Idle | ConnectionPhase::Closing)
                && runtime.subscriber_id.as_deref() != Some(subscriber_id)
        })
        .unwrap_or(false);
    if needs_reconnect {
        debug_log("subscriber id changed, reconnecting under the new identity");
        if let Err(error) = stream::connect(state, subscriber_id) {
            debug_log(&format!("reconnect after identity change failed: {error}"));
        }
    }
}

fn status_snapshot(state: &Arc<AgentState>) -> StatusReply {
    let (subscriber_id, connected) = state
        .runtime
        .lock()
        .map(|runtime| {
            (
                runtime.subscriber_id.clone(),
                runtime.phase == ConnectionPhase::Open,
            )
        })
        .unwrap_or((None, false));
    let subscriber_id = subscriber_id.or_else(|| {
        settings::read_settings(&state.settings_path)
            .ok()
            .and_then(|stored| stored.subscriber_id)
    });
    StatusReply {
        subscriber_id,
        connected,
    }
}
