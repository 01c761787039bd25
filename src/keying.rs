//! Per-local-node jitter-compensated keying tracker.
//!
//! Converts a noisy stream of ALINKS observations (where a link may briefly
//! drop its keyed flag mid-transmission) into a clean sequence of
//! `TX_START`/`TX_END` session edges with accurate durations.
//!
//! Edges are computed under the tracker's lock and returned to the caller
//! as a plain `Vec<TxEdge>` rather than invoked via re-entrant callbacks,
//! the same pattern this crate uses elsewhere for collecting events under
//! a lock and handing them back to the caller to broadcast outside it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;

use crate::ami::parsers::Direction;

pub const DEFAULT_UNKEY_DELAY_MS: i64 = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct AdjacentNodeStatus {
    pub node: i64,
    pub is_keyed: bool,
    pub is_transmitting: bool,
    pub pending_unkey: bool,
    pub keyed_start_time: Option<i64>,
    pub total_tx_seconds: i64,
    pub last_tx_end: Option<i64>,
    // Display/link fields, mirrored from LinkInfo, kept current by the poller.
    pub mode: Option<char>,
    pub direction: Option<Direction>,
    pub ip: Option<String>,
    pub connected_since: Option<i64>,
    /// Bumped whenever a new unkey timer is armed (or an in-flight one is
    /// cancelled by a re-key); lets a stale timer recognize it no longer
    /// applies without a linear scan-and-remove on the heap.
    #[serde(skip)]
    unkey_generation: u64,
}

impl AdjacentNodeStatus {
    fn new(node: i64) -> Self {
        Self {
            node,
            is_keyed: false,
            is_transmitting: false,
            pending_unkey: false,
            keyed_start_time: None,
            total_tx_seconds: 0,
            last_tx_end: None,
            mode: None,
            direction: None,
            ip: None,
            connected_since: None,
            unkey_generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEdgeKind {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct TxEdge {
    pub source_node_id: i64,
    pub adjacent_node_id: i64,
    pub kind: TxEdgeKind,
    pub at: i64,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    execution_time: i64,
    adjacent_node_id: i64,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execution_time.cmp(&other.execution_time)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SourceState {
    adjacent_nodes: HashMap<i64, AdjacentNodeStatus>,
    timer_queue: BinaryHeap<Reverse<TimerEntry>>,
}

pub struct KeyingTracker {
    unkey_delay_ms: i64,
    inner: Mutex<HashMap<i64, SourceState>>,
}

impl KeyingTracker {
    pub fn new(unkey_delay_ms: i64) -> Self {
        Self {
            unkey_delay_ms,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or refresh display fields on) an adjacent node entry. Called
    /// on link add and by the poller to keep mode/direction/ip current
    /// without touching keying state.
    pub fn upsert_adjacent(
        &self,
        source: i64,
        node: i64,
        mode: Option<char>,
        direction: Option<Direction>,
        ip: Option<String>,
        connected_since: Option<i64>,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = inner.entry(source).or_default();
        let entry = state
            .adjacent_nodes
            .entry(node)
            .or_insert_with(|| AdjacentNodeStatus::new(node));
        entry.mode = mode;
        entry.direction = direction;
        entry.ip = ip;
        entry.connected_since = connected_since;
    }

    pub fn remove_adjacent(&self, source: i64, node: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = inner.get_mut(&source) {
            state.adjacent_nodes.remove(&node);
        }
    }

    pub fn snapshot(&self, source: i64) -> HashMap<i64, AdjacentNodeStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&source)
            .map(|s| s.adjacent_nodes.clone())
            .unwrap_or_default()
    }

    pub fn known_sources(&self) -> Vec<i64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.keys().copied().collect()
    }

    /// Apply one ALINKS observation: evaluate expired timers first, then
    /// run the four-way transition table for every id present in `ids`.
    pub fn process_alinks(
        &self,
        source: i64,
        now: i64,
        ids: &[i64],
        keyed: &HashSet<i64>,
    ) -> Vec<TxEdge> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = inner.entry(source).or_default();

        let mut edges = process_timers_locked(state, source, now);

        for &id in ids {
            let link_keyed = keyed.contains(&id);
            let status = state
                .adjacent_nodes
                .entry(id)
                .or_insert_with(|| AdjacentNodeStatus::new(id));
            if let Some(edge) =
                apply_transition(source, status, link_keyed, now, &mut state.timer_queue, self.unkey_delay_ms)
            {
                edges.push(edge);
            }
        }

        edges
    }

    /// Evaluate expired unkey timers for `source` without an accompanying
    /// ALINKS observation, so quiet periods still close out confirmed
    /// unkeys in bounded time.
    pub fn process_timers(&self, source: i64, now: i64) -> Vec<TxEdge> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = inner.get_mut(&source) else {
            return Vec::new();
        };
        process_timers_locked(state, source, now)
    }
}

fn process_timers_locked(state: &mut SourceState, source: i64, now: i64) -> Vec<TxEdge> {
    let mut edges = Vec::new();
    while let Some(Reverse(top)) = state.timer_queue.peek() {
        if top.execution_time > now {
            break;
        }
        let Reverse(timer) = state.timer_queue.pop().expect("peeked entry exists");
        let Some(status) = state.adjacent_nodes.get_mut(&timer.adjacent_node_id) else {
            continue;
        };
        if status.unkey_generation != timer.generation {
            continue; // superseded by a later ARM or cancelled by a re-key
        }
        if !status.is_keyed && status.is_transmitting {
            let start = status.keyed_start_time.unwrap_or(now);
            let duration = ((now - start) / 1000).max(0);
            status.total_tx_seconds += duration;
            status.keyed_start_time = None;
            status.pending_unkey = false;
            status.is_transmitting = false;
            status.last_tx_end = Some(now);
            edges.push(TxEdge {
                source_node_id: source,
                adjacent_node_id: timer.adjacent_node_id,
                kind: TxEdgeKind::Stop,
                at: now,
                duration_secs: Some(duration),
            });
        }
    }
    edges
}

fn apply_transition(
    source: i64,
    status: &mut AdjacentNodeStatus,
    link_keyed: bool,
    now: i64,
    timer_queue: &mut BinaryHeap<Reverse<TimerEntry>>,
    unkey_delay_ms: i64,
) -> Option<TxEdge> {
    match (link_keyed, status.is_transmitting, status.pending_unkey) {
        (true, false, _) => {
            // START
            status.is_transmitting = true;
            status.pending_unkey = false;
            status.is_keyed = true;
            status.keyed_start_time = Some(now);
            status.unkey_generation += 1;
            Some(TxEdge {
                source_node_id: source,
                adjacent_node_id: status.node,
                kind: TxEdgeKind::Start,
                at: now,
                duration_secs: None,
            })
        }
        (false, true, false) => {
            // ARM
            status.pending_unkey = true;
            status.is_keyed = false;
            status.unkey_generation += 1;
            timer_queue.push(Reverse(TimerEntry {
                execution_time: now + unkey_delay_ms,
                adjacent_node_id: status.node,
                generation: status.unkey_generation,
            }));
            None
        }
        (true, true, _) => {
            // CONTINUE (jitter event; transmission still live)
            status.is_keyed = true;
            status.pending_unkey = false;
            status.unkey_generation += 1; // cancels any queued unkey check
            None
        }
        (false, false, _) => None, // IDLE
        (false, true, true) => None, // already armed, waiting on the timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids_keyed(ids: &[i64], keyed_id: i64) -> (Vec<i64>, HashSet<i64>) {
        let mut keyed = HashSet::new();
        keyed.insert(keyed_id);
        (ids.to_vec(), keyed)
    }

    #[test]
    fn jitter_absorption_produces_single_start_single_end() {
        let tracker = KeyingTracker::new(2000);
        let ids = [100, 200, 300];

        // t=0: 100 keyed -> START
        let (ids_v, keyed) = ids_keyed(&ids, 100);
        let edges = tracker.process_alinks(1, 0, &ids_v, &keyed);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, TxEdgeKind::Start);

        // t=1000: 100 unkeyed -> ARM (no edge yet)
        let edges = tracker.process_alinks(1, 1000, &ids, &HashSet::new());
        assert!(edges.is_empty());

        // t=1500: 100 rekeyed within the 2s window -> CONTINUE, cancels the timer
        let (ids_v, keyed) = ids_keyed(&ids, 100);
        let edges = tracker.process_alinks(1, 1500, &ids_v, &keyed);
        assert!(edges.is_empty());

        // t=3500: 100 unkeyed again -> ARM a fresh timer at t=5500
        let edges = tracker.process_alinks(1, 3500, &ids, &HashSet::new());
        assert!(edges.is_empty());

        // Quiet period: nothing arrives before 5500, so a non-ALINKS event
        // at t=5500 must still close out the confirmed unkey.
        let edges = tracker.process_timers(1, 5500);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, TxEdgeKind::Stop);
        assert_eq!(edges[0].duration_secs, Some(5));

        let snap = tracker.snapshot(1);
        assert_eq!(snap[&100].total_tx_seconds, 5);
        assert!(!snap[&100].is_transmitting);
    }

    #[test]
    fn stale_timer_from_a_cancelled_arm_is_dropped() {
        let tracker = KeyingTracker::new(2000);
        let (ids, keyed) = ids_keyed(&[100], 100);
        tracker.process_alinks(1, 0, &ids, &keyed); // START

        tracker.process_alinks(1, 100, &[100], &HashSet::new()); // ARM, timer at 2100
        let (ids, keyed) = ids_keyed(&[100], 100);
        tracker.process_alinks(1, 200, &ids, &keyed); // CONTINUE, cancels timer

        // The stale timer's execution_time (2100) has passed, but the
        // generation no longer matches, so it must not end the session.
        let edges = tracker.process_timers(1, 2200);
        assert!(edges.is_empty());
        assert!(tracker.snapshot(1)[&100].is_transmitting);
    }

    #[test]
    fn independent_sources_do_not_share_state() {
        let tracker = KeyingTracker::new(2000);
        let (ids, keyed) = ids_keyed(&[100], 100);
        tracker.process_alinks(1, 0, &ids, &keyed);
        assert!(tracker.snapshot(2).is_empty());
        assert!(tracker.snapshot(1).contains_key(&100));
    }
}
