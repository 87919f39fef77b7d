use std::collections::HashMap;

use crate::debug_log;

/// Time-windowed set of delivered notification identities. `seen` never
/// mutates; callers decide to deliver first and then call `remember`. The
/// sweeper runs on its own interval so the map stays bounded even when no
/// traffic arrives.
pub(crate) struct DedupCache {
    entries: HashMap<String, u64>,
    ttl_secs: u64,
}

impl DedupCache {
    pub(crate) fn new(ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_secs,
        }
    }

    pub(crate) fn seen(&self, identity: &str, now: u64) -> bool {
        match self.entries.get(identity) {
            Some(first_seen_at) => now.saturating_sub(*first_seen_at) <= self.ttl_secs,
            None => false,
        }
    }

    pub(crate) fn remember(&mut self, identity: &str, now: u64) {
        self.entries.insert(identity.to_string(), now);
    }

    pub(crate) fn sweep(&mut self, now: u64) {
        let before = self.entries.len();
        let ttl = self.ttl_secs;
        self.entries
            .retain(|_, first_seen_at| now.saturating_sub(*first_seen_at) <= ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug_log(&format!(
                "dedup sweep removed {removed} expired entries, {} remain",
                self.entries.len()
            ));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
