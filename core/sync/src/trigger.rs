//! Sync trigger sources and the debouncing policy in front of the
//! coordinator.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::connectivity::Connectivity;

/// Where a sync request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerSource {
    /// App came to the foreground.
    Foreground,
    /// Connectivity came back.
    Reconnect,
    /// Background timer tick.
    Timer,
    /// Explicit user action (pull-to-refresh, sync button).
    User,
}

impl TriggerSource {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerSource::Foreground => "foreground",
            TriggerSource::Reconnect => "reconnect",
            TriggerSource::Timer => "timer",
            TriggerSource::User => "user",
        }
    }
}

/// Decides whether a trigger should reach the coordinator at all.
///
/// Offline triggers are always dropped (the mutation queue still
/// accepts writes; they drain on the next online sync). Automatic
/// sources are debounced per source; explicit user requests are not.
pub struct TriggerPolicy {
    connectivity: Connectivity,
    min_spacing: Duration,
    last_fired: Mutex<HashMap<TriggerSource, Instant>>,
}

impl TriggerPolicy {
    pub fn new(connectivity: Connectivity, min_spacing: Duration) -> Self {
        Self {
            connectivity,
            min_spacing,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this trigger should request a sync now. A true return
    /// counts as the source having fired.
    pub fn should_sync(&self, source: TriggerSource) -> bool {
        if !self.connectivity.is_online() {
            debug!(source = source.label(), "trigger dropped: offline");
            return false;
        }
        if source == TriggerSource::User {
            return true;
        }
        let mut last_fired = match self.last_fired.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let now = Instant::now();
        if let Some(last) = last_fired.get(&source) {
            if now.duration_since(*last) < self.min_spacing {
                debug!(source = source.label(), "trigger dropped: too soon");
                return false;
            }
        }
        last_fired.insert(source, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_drops_every_source() {
        let policy = TriggerPolicy::new(Connectivity::offline(), Duration::from_secs(60));
        assert!(!policy.should_sync(TriggerSource::User));
        assert!(!policy.should_sync(TriggerSource::Timer));
    }

    #[test]
    fn test_automatic_sources_debounced() {
        let policy = TriggerPolicy::new(Connectivity::online(), Duration::from_secs(60));
        assert!(policy.should_sync(TriggerSource::Foreground));
        assert!(!policy.should_sync(TriggerSource::Foreground));
        // Sources debounce independently.
        assert!(policy.should_sync(TriggerSource::Timer));
    }

    #[test]
    fn test_user_bypasses_debounce() {
        let policy = TriggerPolicy::new(Connectivity::online(), Duration::from_secs(60));
        assert!(policy.should_sync(TriggerSource::User));
        assert!(policy.should_sync(TriggerSource::User));
    }

    #[test]
    fn test_spacing_elapses() {
        let policy = TriggerPolicy::new(Connectivity::online(), Duration::from_millis(1));
        assert!(policy.should_sync(TriggerSource::Reconnect));
        std::thread::sleep(Duration::from_millis(5));
        assert!(policy.should_sync(TriggerSource::Reconnect));
    }
}
