mod api;
mod assets;
mod broadcast;
mod consts;
mod control;
mod core;
mod dedup;
mod diagnostics;
mod dispatch;
mod model;
mod normalize;
mod notify;
mod settings;
mod stream;

pub(crate) use self::consts::*;
pub(crate) use self::core::*;
pub(crate) use self::model::*;

use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("notify-agent: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config_dir = config_dir()?;
    let settings_path = settings::settings_file(&config_dir);
    let stored = settings::read_settings(&settings_path)?;

    let base_url = match std::env::var("NOTIFY_AGENT_BASE_URL") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => stored.base_url.clone(),
    };
    let base_url = settings::normalize_base_url(&base_url)
        .map_err(|error| format!("{error} (set NOTIFY_AGENT_BASE_URL or settings.json)"))?;

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(API_REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|error| format!("Failed to build HTTP client: {error}"))?;

    let state = Arc::new(AgentState::new(
        http,
        base_url,
        settings_path.clone(),
        stored.default_icon_url.clone(),
        Box::new(notify::SystemDisplay::new()),
    ));

    // Identity: reuse the persisted id, else generate one locally and let
    // the registration endpoint confirm or replace it.
    let local_id = stored
        .subscriber_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(generate_subscriber_id);
    let subscriber_id = match api::register_subscriber(&state, &local_id).await {
        Ok(confirmed) => confirmed,
        Err(error) => {
            debug_log(&format!(
                "registration failed, continuing with local id: {error}"
            ));
            settings::persist_subscriber_id(&settings_path, &local_id)?;
            local_id
        }
    };
    debug_log(&format!("agent starting for subscriber {subscriber_id}"));

    // Optional debugging mirror: attach a foreground context that logs
    // every broadcast event.
    if std::env::var_os("NOTIFY_AGENT_MIRROR_EVENTS").is_some() {
        let (_id, mut events) = state.foreground.attach();
        debug_log(&format!(
            "event mirror attached, {} foreground contexts",
            state.foreground.context_count()
        ));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug_log(&format!("foreground event: {event}"));
            }
        });
    }

    // Dedup sweeper runs on its own interval, independent of traffic.
    {
        let state_for_sweep = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                DEDUP_SWEEP_INTERVAL_SECS,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Ok(mut dedup) = state_for_sweep.dedup.lock() {
                    dedup.sweep(unix_now_secs());
                }
            }
        });
    }

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    {
        let state_for_control = state.clone();
        tokio::spawn(async move {
            control::run_control_loop(state_for_control, control_rx).await;
        });
    }

    control_tx
        .send(ControlMessage::fire(ControlRequest::ConnectWebsocket))
        .map_err(|_| "Control channel closed before startup".to_string())?;
    let (status_request, status_reply) = ControlMessage::with_reply(ControlRequest::GetStatus);
    if control_tx.send(status_request).is_ok() {
        if let Ok(status) = status_reply.await {
            debug_log(&format!(
                "startup status: subscriber={:?} connected={}",
                status.subscriber_id, status.connected
            ));
        }
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| format!("Failed to wait for shutdown signal: {error}"))?;
    debug_log("shutdown signal received");
    stream::disconnect(&state)?;
    Ok(())
}
