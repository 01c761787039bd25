//! Enhanced poller: periodic `XStat`+`SawStat` polling for one local node,
//! plus an on-demand debounced poll trigger.
//!
//! Grounded on this crate's GPS poller (`tokio::spawn` owning an interval
//! ticker, a timeout-wrapped device query, `tracing::debug!` on failure with
//! no special recovery beyond the next tick) — the AMI connector's own
//! reconnect loop already handles the "device went away" case, so the
//! poller here only needs to tolerate one bad tick and move on.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::ami::connector::AmiConnector;
use crate::ami::now_millis;
use crate::ami::textid::TextNodeRegistry;
use crate::keying::KeyingTracker;
use crate::state::StateManager;

const POLL_TIMEOUT: Duration = Duration::from_secs(8);
const ON_DEMAND_DEBOUNCE_MS: i64 = 2000;

/// Periodic combined-status poll for one configured local node. Never
/// returns; intended to be spawned once per node alongside its connector's
/// `run()` loop.
pub async fn spawn_enhanced_poller(
    node: i64,
    interval: Duration,
    connector: AmiConnector,
    state: Arc<StateManager>,
    keying: Arc<KeyingTracker>,
    registry: Arc<TextNodeRegistry>,
    on_demand: Arc<OnDemandTrigger>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = on_demand.notified() => {}
        }
        poll_once(node, &connector, &state, &keying, &registry).await;
    }
}

async fn poll_once(
    node: i64,
    connector: &AmiConnector,
    state: &StateManager,
    keying: &KeyingTracker,
    registry: &TextNodeRegistry,
) {
    let now = now_millis();
    match timeout(POLL_TIMEOUT, connector.get_combined_status(node, registry, now)).await {
        Ok(Ok(combined)) => {
            state.apply_combined_status(&combined, keying).await;
        }
        Ok(Err(e)) => {
            tracing::debug!(node, error = %e, "poller: combined status query failed");
        }
        Err(_) => {
            tracing::debug!(node, "poller: combined status query timed out");
        }
    }

    // The 5s tick is the bounded-time backstop for unkey confirmation:
    // without a further RPT_ALINKS event, an armed unkey timer would
    // otherwise never get evaluated and a transmission would never close.
    state.process_timers(node, keying, now).await;
}

/// Debounced on-demand poll request: a WebSocket client asking to refresh
/// sooner than the next tick. Requests inside the debounce window are
/// coalesced into the in-flight one.
pub struct OnDemandTrigger {
    last_trigger_ms: AtomicI64,
    notify: Notify,
}

impl OnDemandTrigger {
    pub fn new() -> Self {
        Self {
            last_trigger_ms: AtomicI64::new(0),
            notify: Notify::new(),
        }
    }

    /// Request an immediate poll. Returns `true` if the request was
    /// accepted, `false` if it fell inside the debounce window.
    pub fn trigger(&self) -> bool {
        let now = now_millis();
        let last = self.last_trigger_ms.load(Ordering::Relaxed);
        if now - last < ON_DEMAND_DEBOUNCE_MS {
            return false;
        }
        self.last_trigger_ms.store(now, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for OnDemandTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_demand_trigger_debounces_rapid_requests() {
        let trigger = OnDemandTrigger::new();
        assert!(trigger.trigger());
        assert!(!trigger.trigger());
    }
}
