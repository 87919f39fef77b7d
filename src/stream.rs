use futures_util::{SinkExt, StreamExt};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
};

use crate::{
    debug_log,
    diagnostics::{emit_runtime_diagnostics, mark_stream_activity},
    dispatch, redact_ws_url,
    settings::build_stream_ws_url,
    truncate_text, unix_now_secs, AgentState, ConnectionPhase, DeliveryChannel, ForegroundEvent,
    CLOSE_CODE_AUTH_REJECTED, CONNECT_COOLDOWN_SECS, HEARTBEAT_INTERVAL_SECS,
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BACKOFF_CAP_SECS, RECONNECT_BACKOFF_SEED_SECS,
    STREAM_CONNECT_TIMEOUT_SECS,
};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnectDecision {
    Started,
    AlreadyConnecting,
    AlreadyConnected,
    CooledDown,
}

#[derive(Debug)]
enum StreamExit {
    Stopped,
    NormalClose,
    AuthRejected,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CloseKind {
    Normal,
    Auth,
    Abnormal,
}

pub(crate) fn classify_close(code: Option<u16>) -> CloseKind {
    match code {
        Some(1000) | Some(1001) => CloseKind::Normal,
        Some(1008) => CloseKind::Auth,
        Some(code) if code == CLOSE_CODE_AUTH_REJECTED => CloseKind::Auth,
        _ => CloseKind::Abnormal,
    }
}

pub(crate) fn next_backoff(current_secs: u64) -> u64 {
    std::cmp::min(current_secs.saturating_mul(2), RECONNECT_BACKOFF_CAP_SECS)
}

/// Opens the stream for one subscriber identity. Reentrancy-safe: a call
/// while an attempt is in flight, while already connected for the same
/// identity, or within the cooldown window is a silent no-op. A call for a
/// different identity while connected closes the old stream first.
pub(crate) fn connect(
    state: &Arc<AgentState>,
    subscriber_id: &str,
) -> Result<ConnectDecision, String> {
    if subscriber_id.trim().is_empty() {
        return Err("Subscriber id is required to connect".to_string());
    }
    let ws_url = build_stream_ws_url(&state.base_url, subscriber_id)?;

    let mut runtime = state
        .runtime
        .lock()
        .map_err(|_| "Runtime lock poisoned".to_string())?;

    if runtime.phase == ConnectionPhase::Connecting {
        debug_log("connect ignored: attempt already in flight");
        return Ok(ConnectDecision::AlreadyConnecting);
    }
    if runtime.phase == ConnectionPhase::Open
        && runtime.subscriber_id.as_deref() == Some(subscriber_id)
    {
        debug_log("connect ignored: already connected for this identity");
        return Ok(ConnectDecision::AlreadyConnected);
    }
    if let Some(last_attempt_at) = runtime.last_attempt_at {
        if last_attempt_at.elapsed() < Duration::from_secs(CONNECT_COOLDOWN_SECS) {
            debug_log("connect ignored: within cooldown window");
            return Ok(ConnectDecision::CooledDown);
        }
    }
    if let Some(stop_tx) = runtime.stop_tx.take() {
        debug_log("closing existing stream before identity switch");
        let _ = stop_tx.send(true);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    runtime.stop_tx = Some(stop_tx);
    runtime.stream_epoch = runtime.stream_epoch.wrapping_add(1);
    let task_epoch = runtime.stream_epoch;
    runtime.phase = ConnectionPhase::Connecting;
    runtime.subscriber_id = Some(subscriber_id.to_string());
    runtime.last_attempt_at = Some(Instant::now());
    runtime.attempt = 0;
    runtime.backoff_seconds = 0;
    runtime.last_error = None;
    drop(runtime);

    emit_runtime_diagnostics(state);
    debug_log(&format!("spawning stream task for {}", redact_ws_url(&ws_url)));
    let state_for_task = state.clone();
    let subscriber_for_task = subscriber_id.to_string();
    tokio::spawn(async move {
        run_stream_loop(state_for_task, ws_url, subscriber_for_task, stop_rx, task_epoch).await;
    });
    Ok(ConnectDecision::Started)
}

pub(crate) fn disconnect(state: &Arc<AgentState>) -> Result<(), String> {
    let mut runtime = state
        .runtime
        .lock()
        .map_err(|_| "Runtime lock poisoned".to_string())?;

    match runtime.stop_tx.take() {
        Some(stop_tx) => {
            // the stream task transitions Closing -> Idle on its way out
            runtime.phase = ConnectionPhase::Closing;
            let _ = stop_tx.send(true);
        }
        None => runtime.phase = ConnectionPhase::Idle,
    }
    runtime.subscriber_id = None;
    runtime.attempt = 0;
    runtime.backoff_seconds = 0;
    drop(runtime);

    emit_runtime_diagnostics(state);
    Ok(())
}

async fn run_stream_loop(
    state: Arc<AgentState>,
    ws_url: String,
    subscriber_id: String,
    mut stop_rx: watch::Receiver<bool>,
    task_epoch: u64,
) {
    let mut backoff_secs = RECONNECT_BACKOFF_SEED_SECS;
    let mut close_reason = "stream stopped".to_string();
    debug_log("stream task started");

    loop {
        if *stop_rx.borrow() {
            close_reason = "client disconnect".to_string();
            break;
        }

        set_phase(&state, ConnectionPhase::Connecting);
        match stream_once(&state, &ws_url, &subscriber_id, &mut stop_rx).await {
            Ok(StreamExit::Stopped) => {
                close_reason = "client disconnect".to_string();
                break;
            }
            Ok(StreamExit::NormalClose) => {
                debug_log("stream closed normally, not reconnecting");
                close_reason = "closed by source".to_string();
                break;
            }
            Ok(StreamExit::AuthRejected) => {
                debug_log("stream rejected this identity, not reconnecting");
                let _ = state
                    .foreground
                    .broadcast(&ForegroundEvent::WebsocketAuthFailed {
                        reason: "subscriber identity rejected".to_string(),
                    });
                close_reason = "authentication rejected".to_string();
                break;
            }
            Err(err) => {
                if *stop_rx.borrow() {
                    close_reason = "client disconnect".to_string();
                    break;
                }

                debug_log(&format!("stream loop error: {err}"));
                let attempt = match state.runtime.lock() {
                    Ok(mut runtime) => {
                        runtime.attempt = runtime.attempt.saturating_add(1);
                        runtime.last_error = Some(truncate_text(&err, 300));
                        runtime.backoff_seconds = backoff_secs;
                        runtime.attempt
                    }
                    Err(_) => MAX_RECONNECT_ATTEMPTS.saturating_add(1),
                };
                let _ = state.foreground.broadcast(&ForegroundEvent::WebsocketError {
                    error: truncate_text(&err, 200),
                });
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    debug_log("reconnect attempts exhausted, giving up");
                    close_reason = "reconnect attempts exhausted".to_string();
                    break;
                }

                set_phase(&state, ConnectionPhase::Backoff);
                let jitter_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| (d.subsec_millis() % 500) as u64)
                    .unwrap_or(0);
                let delay =
                    Duration::from_secs(backoff_secs) + Duration::from_millis(jitter_ms);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            close_reason = "client disconnect".to_string();
                            break;
                        }
                    }
                }
                backoff_secs = next_backoff(backoff_secs);
            }
        }
    }

    if let Ok(mut runtime) = state.runtime.lock() {
        if runtime.stream_epoch == task_epoch {
            runtime.stop_tx = None;
            runtime.phase = ConnectionPhase::Idle;
            runtime.backoff_seconds = 0;
        }
    }
    let _ = state
        .foreground
        .broadcast(&ForegroundEvent::WebsocketDisconnected {
            reason: close_reason,
        });
    emit_runtime_diagnostics(&state);
    debug_log("stream task ended");
}

async fn stream_once(
    state: &Arc<AgentState>,
    ws_url: &str,
    subscriber_id: &str,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<StreamExit, String> {
    debug_log(&format!("ws connect {}", redact_ws_url(ws_url)));
    let connect_result = tokio::time::timeout(
        Duration::from_secs(STREAM_CONNECT_TIMEOUT_SECS),
        connect_async(ws_url),
    )
    .await
    .map_err(|_| {
        format!(
            "Stream connection timed out after {} seconds",
            STREAM_CONNECT_TIMEOUT_SECS
        )
    })?;
    let (mut ws_stream, _) = match connect_result {
        Ok(pair) => pair,
        Err(WsError::Http(response)) if matches!(response.status().as_u16(), 401 | 403) => {
            debug_log(&format!(
                "stream handshake rejected with HTTP {}",
                response.status().as_u16()
            ));
            return Ok(StreamExit::AuthRejected);
        }
        Err(error) => return Err(format!("Stream connection failed: {error}")),
    };

    debug_log("ws connected");
    let now = unix_now_secs();
    if let Ok(mut runtime) = state.runtime.lock() {
        runtime.phase = ConnectionPhase::Open;
        runtime.attempt = 0;
        runtime.backoff_seconds = 0;
        runtime.last_connected_at = Some(now);
        runtime.last_event_at = Some(now);
        runtime.last_error = None;
    }
    let _ = state
        .foreground
        .broadcast(&ForegroundEvent::WebsocketConnected {
            subscriber_id: subscriber_id.to_string(),
        });
    emit_runtime_diagnostics(state);

    // recover anything that arrived while the stream was down
    {
        let state_for_backfill = state.clone();
        tokio::spawn(async move {
            if let Err(error) = crate::api::backfill_missed(&state_for_backfill).await {
                debug_log(&format!("backfill failed: {error}"));
            }
        });
    }

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat_interval.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    let _ = ws_stream
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        }))
                        .await;
                    return Ok(StreamExit::Stopped);
                }
            }
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        mark_stream_activity(state, unix_now_secs());
                        handle_text_frame(state, text.as_ref()).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        mark_stream_activity(state, unix_now_secs());
                        ws_stream.send(Message::Pong(payload)).await
                            .map_err(|error| format!("Failed to send pong: {error}"))?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        mark_stream_activity(state, unix_now_secs());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        debug_log(&format!("stream closed by source, code {code:?}"));
                        return match classify_close(code) {
                            CloseKind::Normal => Ok(StreamExit::NormalClose),
                            CloseKind::Auth => Ok(StreamExit::AuthRejected),
                            CloseKind::Abnormal => {
                                Err(format!("Stream closed abnormally (code {code:?})"))
                            }
                        };
                    }
                    Some(Ok(_)) => {
                        mark_stream_activity(state, unix_now_secs());
                    }
                    Some(Err(error)) => return Err(format!("Stream read error: {error}")),
                    None => return Err("Stream ended unexpectedly".to_string()),
                }
            }
            _ = heartbeat_interval.tick() => {
                let heartbeat = serde_json::json!({
                    "type": "heartbeat",
                    "subscriber_id": subscriber_id,
                });
                ws_stream.send(Message::text(heartbeat.to_string())).await
                    .map_err(|error| format!("Failed to send heartbeat: {error}"))?;
                debug_log("heartbeat sent");
            }
        }
    }
}

/// Control frames are acknowledged in place; everything else goes to the
/// dispatcher. Non-JSON payloads are still dispatched, never dropped for
/// a parse failure alone.
async fn handle_text_frame(state: &Arc<AgentState>, text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
            Some("connection_established") => debug_log("stream acknowledged connection"),
            Some("heartbeat_response") => debug_log("heartbeat acknowledged"),
            Some("echo") => {
                debug_log(&format!("echo frame: {}", truncate_text(text, 140)));
            }
            Some("notification") | None => {
                let _ = dispatch::dispatch_value(state, &value, DeliveryChannel::Stream).await;
            }
            Some(other) => {
                debug_log(&format!(
                    "unhandled frame type {other}: {}",
                    truncate_text(text, 140)
                ));
            }
        },
        Err(_) => {
            let _ = dispatch::dispatch_raw(state, Some(text), DeliveryChannel::Stream).await;
        }
    }
}

fn set_phase(state: &Arc<AgentState>, phase: ConnectionPhase) {
    if let Ok(mut runtime) = state.runtime.lock() {
        runtime.phase = phase;
    }
    emit_runtime_diagnostics(state);
}

#[cfg(test)]
mod tests {
    use super::{classify_close, connect, disconnect, next_backoff, CloseKind, ConnectDecision};
    use crate::{notify::LogDisplay, AgentState, ConnectionPhase};
    use std::{sync::Arc, time::Instant};
    use tokio::sync::watch;

    fn test_state() -> Arc<AgentState> {
        Arc::new(AgentState::for_tests(Box::new(LogDisplay)))
    }

    #[test]
    fn normal_closures_do_not_reconnect() {
        assert_eq!(classify_close(Some(1000)), CloseKind::Normal);
        assert_eq!(classify_close(Some(1001)), CloseKind::Normal);
    }

    #[test]
    fn auth_closures_are_fatal() {
        assert_eq!(classify_close(Some(1008)), CloseKind::Auth);
        assert_eq!(classify_close(Some(4401)), CloseKind::Auth);
    }

    #[test]
    fn other_closures_are_abnormal() {
        assert_eq!(classify_close(Some(1006)), CloseKind::Abnormal);
        assert_eq!(classify_close(Some(1011)), CloseKind::Abnormal);
        assert_eq!(classify_close(None), CloseKind::Abnormal);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut delay = 1;
        let mut seen = Vec::new();
        for _ in 0..6 {
            delay = next_backoff(delay);
            seen.push(delay);
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn second_connect_while_in_flight_is_a_no_op() {
        let state = test_state();
        let first = connect(&state, "sub-1").expect("first connect");
        let second = connect(&state, "sub-1").expect("second connect");
        assert_eq!(first, ConnectDecision::Started);
        assert_eq!(second, ConnectDecision::AlreadyConnecting);

        let epoch = state.runtime.lock().expect("runtime lock").stream_epoch;
        assert_eq!(epoch, 1);
    }

    #[tokio::test]
    async fn cooldown_blocks_fresh_attempts_regardless_of_identity() {
        let state = test_state();
        {
            let mut runtime = state.runtime.lock().expect("runtime lock");
            runtime.phase = ConnectionPhase::Idle;
            runtime.last_attempt_at = Some(Instant::now());
        }
        assert_eq!(
            connect(&state, "sub-2").expect("connect"),
            ConnectDecision::CooledDown
        );
    }

    #[tokio::test]
    async fn connect_for_current_identity_while_open_is_a_no_op() {
        let state = test_state();
        {
            let mut runtime = state.runtime.lock().expect("runtime lock");
            runtime.phase = ConnectionPhase::Open;
            runtime.subscriber_id = Some("sub-1".to_string());
        }
        assert_eq!(
            connect(&state, "sub-1").expect("connect"),
            ConnectDecision::AlreadyConnected
        );
    }

    #[tokio::test]
    async fn identity_switch_closes_the_old_stream_first() {
        let state = test_state();
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut runtime = state.runtime.lock().expect("runtime lock");
            runtime.phase = ConnectionPhase::Open;
            runtime.subscriber_id = Some("sub-a".to_string());
            runtime.stop_tx = Some(stop_tx);
            runtime.last_attempt_at = None;
        }

        assert_eq!(
            connect(&state, "sub-b").expect("connect"),
            ConnectDecision::Started
        );
        assert!(*stop_rx.borrow());

        let runtime = state.runtime.lock().expect("runtime lock");
        assert_eq!(runtime.subscriber_id.as_deref(), Some("sub-b"));
        assert_eq!(runtime.phase, ConnectionPhase::Connecting);
    }

    #[tokio::test]
    async fn disconnect_clears_identity_and_signals_the_task() {
        let state = test_state();
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut runtime = state.runtime.lock().expect("runtime lock");
            runtime.phase = ConnectionPhase::Open;
            runtime.subscriber_id = Some("sub-1".to_string());
            runtime.stop_tx = Some(stop_tx);
            runtime.attempt = 3;
        }

        disconnect(&state).expect("disconnect");
        assert!(*stop_rx.borrow());

        let runtime = state.runtime.lock().expect("runtime lock");
        assert_eq!(runtime.phase, ConnectionPhase::Closing);
        assert_eq!(runtime.subscriber_id, None);
        assert_eq!(runtime.attempt, 0);
    }

    #[tokio::test]
    async fn disconnect_without_a_task_goes_straight_to_idle() {
        let state = test_state();
        disconnect(&state).expect("disconnect");
        let runtime = state.runtime.lock().expect("runtime lock");
        assert_eq!(runtime.phase, ConnectionPhase::Idle);
    }
}
