pub(crate) const CONNECT_COOLDOWN_SECS: u64 = 5;
pub(crate) const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(crate) const HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub(crate) const RECONNECT_BACKOFF_SEED_SECS: u64 = 1;
pub(crate) const RECONNECT_BACKOFF_CAP_SECS: u64 = 30;
pub(crate) const MAX_RECONNECT_ATTEMPTS: u64 = 5;

pub(crate) const DEDUP_TTL_SECS: u64 = 60;
pub(crate) const DEDUP_SWEEP_INTERVAL_SECS: u64 = 60;

pub(crate) const ASSET_PROBE_TIMEOUT_SECS: u64 = 12;
pub(crate) const ASSET_RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

pub(crate) const TITLE_MAX_CHARS: usize = 100;
pub(crate) const MESSAGE_MAX_CHARS: usize = 200;
pub(crate) const DEFAULT_TITLE: &str = "New notification";
pub(crate) const DEFAULT_MESSAGE: &str = "You have a new notification.";

pub(crate) const API_REQUEST_TIMEOUT_SECS: u64 = 15;
pub(crate) const BACKFILL_LOOKBACK_SECS: u64 = 3600;

pub(crate) const ICON_MAX_BYTES: usize = 256_000;

/// Server-assigned close code for a rejected subscriber identity.
pub(crate) const CLOSE_CODE_AUTH_REJECTED: u16 = 4401;
