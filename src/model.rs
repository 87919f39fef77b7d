use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Mutex, time::Instant};
use tokio::sync::{oneshot, watch};

use crate::{
    broadcast::ForegroundRegistry, dedup::DedupCache, diagnostics::RuntimeDiagnostics,
    notify::DisplaySurface, DEFAULT_MESSAGE, DEFAULT_TITLE,
};

/// Which inbound channel produced a record. `Setup` marks locally generated
/// welcome/setup records that must never be delivered as real notifications.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum NotificationSource {
    Push,
    Stream,
    Test,
    Setup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryChannel {
    Push,
    Stream,
}

impl DeliveryChannel {
    pub(crate) fn default_source(self) -> NotificationSource {
        match self {
            DeliveryChannel::Push => NotificationSource::Push,
            DeliveryChannel::Stream => NotificationSource::Stream,
        }
    }
}

/// Canonical notification. Immutable once normalized; re-delivery of the
/// same event produces a new record with the same `id`.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NotificationRecord {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) message: String,
    pub(crate) image_url: Option<String>,
    pub(crate) icon_url: Option<String>,
    pub(crate) url: Option<String>,
    pub(crate) tag: String,
    pub(crate) timestamp: u64,
    pub(crate) source: NotificationSource,
}

impl NotificationRecord {
    pub(crate) fn with_image(self, image_url: Option<String>) -> Self {
        Self { image_url, ..self }
    }

    /// Minimal stand-in shown when the real record cannot be displayed.
    pub(crate) fn display_fallback(&self) -> Self {
        Self {
            id: self.id.clone(),
            title: DEFAULT_TITLE.to_string(),
            message: DEFAULT_MESSAGE.to_string(),
            image_url: None,
            icon_url: None,
            url: self.url.clone(),
            tag: self.tag.clone(),
            timestamp: self.timestamp,
            source: self.source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    Closing,
    Backoff,
}

impl ConnectionPhase {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "Idle",
            ConnectionPhase::Connecting => "Connecting",
            ConnectionPhase::Open => "Open",
            ConnectionPhase::Closing => "Closing",
            ConnectionPhase::Backoff => "Backoff",
        }
    }
}

pub(crate) struct RuntimeState {
    pub(crate) phase: ConnectionPhase,
    /// Identity the current connection is scoped to. Exactly one identity
    /// at a time; a connect for a different identity closes this one first.
    pub(crate) subscriber_id: Option<String>,
    pub(crate) attempt: u64,
    pub(crate) last_attempt_at: Option<Instant>,
    pub(crate) stop_tx: Option<watch::Sender<bool>>,
    /// Incremented every time a new stream task is spawned. The task
    /// captures its epoch at spawn time and only writes cleanup state if it
    /// still matches, so a late-exiting old task cannot clobber the state
    /// of a freshly started replacement.
    pub(crate) stream_epoch: u64,
    pub(crate) last_connected_at: Option<u64>,
    pub(crate) last_event_at: Option<u64>,
    pub(crate) last_delivery_at: Option<u64>,
    pub(crate) last_error: Option<String>,
    pub(crate) backoff_seconds: u64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            subscriber_id: None,
            attempt: 0,
            last_attempt_at: None,
            stop_tx: None,
            stream_epoch: 0,
            last_connected_at: None,
            last_event_at: None,
            last_delivery_at: None,
            last_error: None,
            backoff_seconds: 0,
        }
    }
}

/// Process-wide singleton owned by the background context. All mutation of
/// the runtime and dedup state goes through the connection manager and the
/// dispatcher.
pub(crate) struct AgentState {
    pub(crate) runtime: Mutex<RuntimeState>,
    pub(crate) dedup: Mutex<DedupCache>,
    pub(crate) foreground: ForegroundRegistry,
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) settings_path: PathBuf,
    pub(crate) default_icon_url: Option<String>,
    pub(crate) display: Box<dyn DisplaySurface>,
}

impl AgentState {
    pub(crate) fn new(
        http: reqwest::Client,
        base_url: String,
        settings_path: PathBuf,
        default_icon_url: Option<String>,
        display: Box<dyn DisplaySurface>,
    ) -> Self {
        Self {
            runtime: Mutex::new(RuntimeState::default()),
            dedup: Mutex::new(DedupCache::new(crate::DEDUP_TTL_SECS)),
            foreground: ForegroundRegistry::new(),
            http,
            base_url,
            settings_path,
            default_icon_url,
            display,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(display: Box<dyn DisplaySurface>) -> Self {
        Self::for_tests_with_base_url(display, "http://127.0.0.1:1".to_string())
    }

    #[cfg(test)]
    pub(crate) fn for_tests_with_base_url(
        display: Box<dyn DisplaySurface>,
        base_url: String,
    ) -> Self {
        let settings_path = std::env::temp_dir().join(format!(
            "notify-agent-test-{}.json",
            crate::unique_time_suffix()
        ));
        Self::new(reqwest::Client::new(), base_url, settings_path, None, display)
    }
}

/// Event fanned out to foreground contexts. Serialized as `{type, data}`.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", content = "data")]
pub(crate) enum ForegroundEvent {
    #[serde(rename = "NOTIFICATION_RECEIVED")]
    NotificationReceived(NotificationRecord),
    #[serde(rename = "WEBSOCKET_CONNECTED")]
    WebsocketConnected { subscriber_id: String },
    #[serde(rename = "WEBSOCKET_DISCONNECTED")]
    WebsocketDisconnected { reason: String },
    #[serde(rename = "WEBSOCKET_ERROR")]
    WebsocketError { error: String },
    #[serde(rename = "WEBSOCKET_AUTH_FAILED")]
    WebsocketAuthFailed { reason: String },
    #[serde(rename = "STORE_CONNECTION_STATE")]
    StoreConnectionState(RuntimeDiagnostics),
}

impl ForegroundEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ForegroundEvent::NotificationReceived(_) => "NOTIFICATION_RECEIVED",
            ForegroundEvent::WebsocketConnected { .. } => "WEBSOCKET_CONNECTED",
            ForegroundEvent::WebsocketDisconnected { .. } => "WEBSOCKET_DISCONNECTED",
            ForegroundEvent::WebsocketError { .. } => "WEBSOCKET_ERROR",
            ForegroundEvent::WebsocketAuthFailed { .. } => "WEBSOCKET_AUTH_FAILED",
            ForegroundEvent::StoreConnectionState(_) => "STORE_CONNECTION_STATE",
        }
    }
}

/// Control messages foreground contexts send to the background context.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub(crate) enum ControlRequest {
    #[serde(rename = "CONNECT_WEBSOCKET")]
    ConnectWebsocket,
    #[serde(rename = "DISCONNECT_WEBSOCKET")]
    DisconnectWebsocket,
    #[serde(rename = "SET_SUBSCRIBER_ID")]
    SetSubscriberId {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
    },
    #[serde(rename = "GET_STATUS")]
    GetStatus,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusReply {
    pub(crate) subscriber_id: Option<String>,
    pub(crate) connected: bool,
}

pub(crate) struct ControlMessage {
    pub(crate) request: ControlRequest,
    pub(crate) reply: Option<oneshot::Sender<StatusReply>>,
}

impl ControlMessage {
    pub(crate) fn fire(request: ControlRequest) -> Self {
        Self {
            request,
            reply: None,
        }
    }

    pub(crate) fn with_reply(request: ControlRequest) -> (Self, oneshot::Receiver<StatusReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply: Some(tx),
            },
            rx,
        )
    }
}
