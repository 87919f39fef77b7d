use std::sync::Arc;

use serde_json::Value;

use crate::{
    assets, debug_log, normalize, truncate_text, unix_now_secs, AgentState, DeliveryChannel,
    ForegroundEvent, NotificationRecord, NotificationSource,
};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Delivered { foreground: bool },
    DuplicateSuppressed,
    SetupSuppressed,
}

pub(crate) async fn dispatch_raw(
    state: &Arc<AgentState>,
    raw: Option<&str>,
    channel: DeliveryChannel,
) -> DispatchOutcome {
    deliver(state, normalize::normalize(raw, channel)).await
}

pub(crate) async fn dispatch_value(
    state: &Arc<AgentState>,
    value: &Value,
    channel: DeliveryChannel,
) -> DispatchOutcome {
    deliver(state, normalize::normalize_value(value, channel)).await
}

/// Runs the delivery gates in order: setup suppression, dedup, image
/// validation, then the two independent effects (system display and
/// foreground broadcast). Nothing here returns an error; every failure
/// degrades into a still-delivered notification or an explicit suppression.
async fn deliver(state: &Arc<AgentState>, record: NotificationRecord) -> DispatchOutcome {
    if record.source == NotificationSource::Setup {
        debug_log(&format!("setup record suppressed: {}", record.id));
        return DispatchOutcome::SetupSuppressed;
    }

    let now = unix_now_secs();
    match state.dedup.lock() {
        Ok(mut dedup) => {
            if dedup.seen(&record.id, now) {
                debug_log(&format!("duplicate suppressed: {}", record.id));
                return DispatchOutcome::DuplicateSuppressed;
            }
            dedup.remember(&record.id, now);
        }
        // Cannot verify; duplicate delivery beats a lost notification.
        Err(_) => debug_log("dedup lock poisoned, delivering unchecked"),
    }

    let record = match record.image_url.clone() {
        Some(image_url) => {
            let validated = assets::validate_image_url(&state.http, &image_url).await;
            record.with_image(validated)
        }
        None => record,
    };
    let record = NotificationRecord {
        icon_url: record
            .icon_url
            .clone()
            .or_else(|| state.default_icon_url.clone()),
        ..record
    };

    if let Err(error) = state.display.show(&record) {
        debug_log(&format!("display request failed: {error}"));
        if let Err(error) = state.display.show(&record.display_fallback()) {
            debug_log(&format!("fallback display request failed: {error}"));
        }
    }

    let foreground = state
        .foreground
        .broadcast(&ForegroundEvent::NotificationReceived(record.clone()));
    if !foreground {
        debug_log("no foreground contexts reachable, system notification only");
    }

    if let Ok(mut runtime) = state.runtime.lock() {
        runtime.last_delivery_at = Some(now);
    }
    debug_log(&format!(
        "delivered id={} title={}",
        record.id,
        truncate_text(&record.title, 60)
    ));

    DispatchOutcome::Delivered { foreground }
}

#[cfg(test)]
mod tests {
    use super::{dispatch_raw, DispatchOutcome};
    use crate::{
        notify::DisplaySurface, AgentState, DeliveryChannel, NotificationRecord, DEFAULT_TITLE,
    };
    use std::sync::{Arc, Mutex};

    struct RecordingDisplay {
        shown: Arc<Mutex<Vec<NotificationRecord>>>,
        fail: bool,
    }

    impl DisplaySurface for RecordingDisplay {
        fn show(&self, record: &NotificationRecord) -> Result<(), String> {
            self.shown.lock().expect("shown lock").push(record.clone());
            if self.fail {
                Err("display surface unavailable".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn recording_state(fail: bool) -> (Arc<AgentState>, Arc<Mutex<Vec<NotificationRecord>>>) {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let display = Box::new(RecordingDisplay {
            shown: shown.clone(),
            fail,
        });
        (Arc::new(AgentState::for_tests(display)), shown)
    }

    const STREAM_FRAME: &str =
        r#"{"type":"notification","data":{"id":"n1","title":"Hi","message":"there"}}"#;

    #[tokio::test]
    async fn stream_frame_is_displayed_and_broadcast_once() {
        let (state, shown) = recording_state(false);
        let (_id, mut rx) = state.foreground.attach();

        let outcome = dispatch_raw(&state, Some(STREAM_FRAME), DeliveryChannel::Stream).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { foreground: true });

        let event = rx.try_recv().expect("broadcast event");
        assert_eq!(event["type"], "NOTIFICATION_RECEIVED");
        assert_eq!(event["data"]["id"], "n1");
        assert_eq!(event["data"]["title"], "Hi");
        assert_eq!(event["data"]["message"], "there");

        let shown = shown.lock().expect("shown lock");
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].id, "n1");
    }

    #[tokio::test]
    async fn repeated_frame_within_ttl_is_suppressed() {
        let (state, shown) = recording_state(false);
        let (_id, mut rx) = state.foreground.attach();

        let first = dispatch_raw(&state, Some(STREAM_FRAME), DeliveryChannel::Stream).await;
        let second = dispatch_raw(&state, Some(STREAM_FRAME), DeliveryChannel::Stream).await;
        assert_eq!(first, DispatchOutcome::Delivered { foreground: true });
        assert_eq!(second, DispatchOutcome::DuplicateSuppressed);

        let mut notification_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event["type"] == "NOTIFICATION_RECEIVED" {
                notification_events += 1;
            }
        }
        assert_eq!(notification_events, 1);
        assert_eq!(shown.lock().expect("shown lock").len(), 1);
    }

    #[tokio::test]
    async fn same_identity_across_channels_is_suppressed() {
        let (state, shown) = recording_state(false);

        let push = r#"{"notification":{"title":"Hi","body":"there"},"data":{"id":"n1"}}"#;
        let first = dispatch_raw(&state, Some(push), DeliveryChannel::Push).await;
        let second = dispatch_raw(&state, Some(STREAM_FRAME), DeliveryChannel::Stream).await;
        assert_eq!(first, DispatchOutcome::Delivered { foreground: false });
        assert_eq!(second, DispatchOutcome::DuplicateSuppressed);
        assert_eq!(shown.lock().expect("shown lock").len(), 1);
    }

    #[tokio::test]
    async fn setup_records_are_discarded_silently() {
        let (state, shown) = recording_state(false);
        let raw = r#"{"title":"Welcome","data":{"source":"setup"}}"#;
        let outcome = dispatch_raw(&state, Some(raw), DeliveryChannel::Push).await;
        assert_eq!(outcome, DispatchOutcome::SetupSuppressed);
        assert!(shown.lock().expect("shown lock").is_empty());
    }

    #[tokio::test]
    async fn invalid_image_is_cleared_but_delivery_proceeds() {
        let (state, shown) = recording_state(false);
        let raw = r#"{"id":"img1","title":"Hi","message":"x","image":"not-a-url"}"#;
        let outcome = dispatch_raw(&state, Some(raw), DeliveryChannel::Push).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { foreground: false });

        let shown = shown.lock().expect("shown lock");
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].image_url, None);
    }

    #[tokio::test]
    async fn display_failure_falls_back_to_generic_record() {
        let (state, shown) = recording_state(true);
        let outcome = dispatch_raw(&state, Some(STREAM_FRAME), DeliveryChannel::Stream).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { foreground: false });

        let shown = shown.lock().expect("shown lock");
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[1].title, DEFAULT_TITLE);
        assert_eq!(shown[1].image_url, None);
    }

    #[tokio::test]
    async fn empty_push_still_delivers_a_generic_record() {
        let (state, shown) = recording_state(false);
        let outcome = dispatch_raw(&state, None, DeliveryChannel::Push).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { foreground: false });

        let shown = shown.lock().expect("shown lock");
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, DEFAULT_TITLE);
    }
}
