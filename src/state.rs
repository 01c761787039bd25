//! State Manager: the authoritative merged view of NodeState/LinksDetailed.
//!
//! Grounded on this crate's session manager (`RwLock`-guarded map, held
//! through an entire check-and-mutate sequence, never released
//! mid-reconciliation) and its activity journal (broadcast the event, then
//! commit the mutation — a slow receiver never blocks the writer).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::ami::connector::AmiMessage;
use crate::ami::now_millis;
use crate::ami::parsers::{format_last_heard, CombinedNodeStatus};
use crate::ami::textid::TextNodeRegistry;
use crate::collaborators::{LinkStatRow, LinkStatsStore, NodeDirectory, TransmissionLogRow};
use crate::keying::{KeyingTracker, TxEdgeKind};

const STATE_EVENT_CHANNEL_CAPACITY: usize = 1024;
pub const DEFAULT_TALKER_LOG_MAX: usize = 200;
pub const DEFAULT_TALKER_LOG_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub node: i64,
    pub local_node: i64,
    pub connected_since: Option<i64>,
    pub ip: Option<String>,
    pub direction: String,
    pub elapsed: String,
    pub link_type: String,
    pub mode: Option<char>,
    pub is_keyed: bool,
    pub current_tx: bool,
    pub last_tx_start: Option<i64>,
    pub last_tx_end: Option<i64>,
    pub last_heard_at: Option<i64>,
    pub last_keyed_time: Option<i64>,
    pub secs_since_keyed: Option<i64>,
    pub total_tx_seconds: i64,
    pub node_callsign: Option<String>,
    pub node_description: Option<String>,
    pub node_location: Option<String>,
}

impl LinkInfo {
    fn new(local_node: i64, node: i64) -> Self {
        Self {
            node,
            local_node,
            connected_since: None,
            ip: None,
            direction: "OUT".to_string(),
            elapsed: String::new(),
            link_type: String::new(),
            mode: None,
            is_keyed: false,
            current_tx: false,
            last_tx_start: None,
            last_tx_end: None,
            last_heard_at: None,
            last_keyed_time: None,
            secs_since_keyed: None,
            total_tx_seconds: 0,
            node_callsign: None,
            node_description: None,
            node_location: None,
        }
    }

    pub fn last_heard(&self) -> String {
        format_last_heard(self.is_keyed, self.secs_since_keyed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub node_id: i64,
    pub rx_keyed: bool,
    pub tx_keyed: bool,
    pub links: Vec<i64>,
    pub links_detailed: Vec<LinkInfo>,
    pub uptime_sec: i64,
    pub last_reload_sec: i64,
    pub booted_at: Option<i64>,
    pub updated_at: i64,
    pub heartbeat: u64,
    pub session_start: i64,
    pub version: u64,
    pub build_time: String,
    pub title: String,
    pub subtitle: String,
}

impl NodeState {
    fn new(node_id: i64, now: i64) -> Self {
        Self {
            node_id,
            rx_keyed: false,
            tx_keyed: false,
            links: Vec::new(),
            links_detailed: Vec::new(),
            uptime_sec: 0,
            last_reload_sec: 0,
            booted_at: None,
            updated_at: now,
            heartbeat: 0,
            session_start: now,
            version: 1,
            build_time: String::new(),
            title: "rptmond".to_string(),
            subtitle: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkTxEvent {
    pub local_node: i64,
    pub node: i64,
    pub kind: String,
    pub at: i64,
    pub total_tx_seconds: i64,
    pub last_tx_start: Option<i64>,
    pub last_tx_end: Option<i64>,
}

pub type TalkerEntry = LinkTxEvent;

#[derive(Debug, Clone)]
pub enum StateEvent {
    Status(NodeState),
    LinkAdded(i64, Vec<LinkInfo>),
    LinkRemoved(i64, Vec<i64>),
    LinkTx(LinkTxEvent),
    TalkerEvent(TalkerEntry),
    SourceNodeKeying {
        source_node_id: i64,
        adjacent_nodes: HashMap<i64, crate::keying::AdjacentNodeStatus>,
    },
    SourceNodeKeyingEvent {
        source: i64,
        adjacent: i64,
        kind: &'static str,
        at: i64,
        duration: Option<i64>,
    },
}

struct StateInner {
    nodes: HashMap<i64, NodeState>,
    links: HashMap<(i64, i64), LinkInfo>,
    last_talker_state: HashMap<(i64, i64), bool>,
    talker_log: VecDeque<TalkerEntry>,
    seed_stats: HashMap<i64, LinkStatRow>,
}

pub struct StateManager {
    talker_log_max: usize,
    talker_log_ttl_ms: i64,
    inner: RwLock<StateInner>,
    events_tx: broadcast::Sender<StateEvent>,
    persistence: Arc<dyn LinkStatsStore>,
    directory: Arc<dyn NodeDirectory>,
}

impl StateManager {
    pub fn new(
        talker_log_max: usize,
        talker_log_ttl_ms: i64,
        persistence: Arc<dyn LinkStatsStore>,
        directory: Arc<dyn NodeDirectory>,
    ) -> Self {
        let seed_rows = persistence.seed();
        let seed_stats = seed_rows.into_iter().map(|r| (r.node, r)).collect();
        let (events_tx, _) = broadcast::channel(STATE_EVENT_CHANNEL_CAPACITY);
        Self {
            talker_log_max,
            talker_log_ttl_ms,
            inner: RwLock::new(StateInner {
                nodes: HashMap::new(),
                links: HashMap::new(),
                last_talker_state: HashMap::new(),
                talker_log: VecDeque::new(),
                seed_stats,
            }),
            events_tx,
            persistence,
            directory,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events_tx.subscribe()
    }

    pub async fn snapshot(&self, node_id: i64) -> Option<NodeState> {
        self.inner.read().await.nodes.get(&node_id).cloned()
    }

    pub async fn known_nodes(&self) -> Vec<i64> {
        self.inner.read().await.nodes.keys().copied().collect()
    }

    pub async fn talker_log_snapshot(&self) -> Vec<TalkerEntry> {
        let now = now_millis();
        let inner = self.inner.read().await;
        inner
            .talker_log
            .iter()
            .filter(|e| now - e.at <= self.talker_log_ttl_ms)
            .cloned()
            .collect()
    }

    fn emit(&self, event: StateEvent) {
        let _ = self.events_tx.send(event);
    }

    fn push_talker_log(inner: &mut StateInner, entry: TalkerEntry, max: usize) {
        inner.talker_log.push_back(entry);
        while inner.talker_log.len() > max {
            inner.talker_log.pop_front();
        }
    }

    /// Apply one raw AMI event (the event path).
    pub async fn apply(
        &self,
        local_node: i64,
        msg: &AmiMessage,
        keying: &KeyingTracker,
        registry: &TextNodeRegistry,
    ) {
        let now = now_millis();

        if msg.header("Asterisk Call Manager/Version").is_some() {
            let mut inner = self.inner.write().await;
            let state = inner
                .nodes
                .entry(local_node)
                .or_insert_with(|| NodeState::new(local_node, now));
            state.uptime_sec = 0;
            state.last_reload_sec = 0;
            state.booted_at = None;
            state.updated_at = now;
            let snapshot = state.clone();
            drop(inner);
            self.emit(StateEvent::Status(snapshot));
            self.process_timers(local_node, keying, now).await;
            return;
        }

        if msg.event_name() == Some("FullyBooted") {
            let uptime = msg.header("Uptime").and_then(|v| v.parse::<i64>().ok());
            let last_reload = msg.header("LastReload").and_then(|v| v.parse::<i64>().ok());
            let mut inner = self.inner.write().await;
            let state = inner
                .nodes
                .entry(local_node)
                .or_insert_with(|| NodeState::new(local_node, now));
            if let Some(u) = uptime {
                state.uptime_sec = u;
            }
            if let Some(r) = last_reload {
                state.last_reload_sec = r;
            }
            if state.booted_at.is_none() {
                state.booted_at = Some(now);
            }
            state.updated_at = now;
            let snapshot = state.clone();
            drop(inner);
            self.emit(StateEvent::Status(snapshot));
            self.process_timers(local_node, keying, now).await;
            return;
        }

        let Some(event) = msg.event_name() else {
            self.process_timers(local_node, keying, now).await;
            return;
        };
        let (key, value) = if event == "VarSet" {
            let Some(var) = msg.variable() else {
                self.process_timers(local_node, keying, now).await;
                return;
            };
            (var.to_string(), msg.value().unwrap_or_default().to_string())
        } else if let Some(val) = msg.value() {
            (event.to_string(), val.to_string())
        } else {
            self.process_timers(local_node, keying, now).await;
            return;
        };

        match key.as_str() {
            "RPT_TXKEYED" => {
                let mut inner = self.inner.write().await;
                let state = inner
                    .nodes
                    .entry(local_node)
                    .or_insert_with(|| NodeState::new(local_node, now));
                state.tx_keyed = value == "1";
                state.updated_at = now;
                let snapshot = state.clone();
                drop(inner);
                self.emit(StateEvent::Status(snapshot));
            }
            "RPT_RXKEYED" => {
                let mut inner = self.inner.write().await;
                let state = inner
                    .nodes
                    .entry(local_node)
                    .or_insert_with(|| NodeState::new(local_node, now));
                state.rx_keyed = value == "1";
                state.updated_at = now;
                let snapshot = state.clone();
                drop(inner);
                self.emit(StateEvent::Status(snapshot));
            }
            "RPT_LINKS" => {
                let ids = parse_rpt_links(&value, registry);
                self.reconcile_links(local_node, &ids, keying, now).await;
            }
            "RPT_ALINKS" => {
                let (ids, keyed_set) = crate::ami::parsers::parse_alinks(&value, registry);
                self.reconcile_links(local_node, &ids, keying, now).await;
                self.apply_alinks_keying(local_node, &ids, &keyed_set, keying, now).await;
            }
            _ => {}
        }

        // RPT_ALINKS already evaluated expired timers as part of
        // `process_alinks`; every other event path needs this explicit
        // nudge so a quiet period (no further ALINKS) still closes out a
        // confirmed unkey in bounded time (spec §4.3).
        if key != "RPT_ALINKS" {
            self.process_timers(local_node, keying, now).await;
        }
    }

    /// Ensure LinksDetailed contains exactly `ids` for `local_node`,
    /// emitting `added`/`removed` diffs. Does not touch keying state.
    async fn reconcile_links(&self, local_node: i64, ids: &[i64], keying: &KeyingTracker, now: i64) {
        let mut inner = self.inner.write().await;

        let previous: HashSet<i64> = inner
            .links
            .keys()
            .filter(|(ln, _)| *ln == local_node)
            .map(|(_, n)| *n)
            .collect();
        let current: HashSet<i64> = ids.iter().copied().collect();

        let added: Vec<i64> = current.difference(&previous).copied().collect();
        let removed: Vec<i64> = previous.difference(&current).copied().collect();

        for &node in &added {
            let key = (local_node, node);
            let mut link = LinkInfo::new(local_node, node);
            if let Some(row) = inner.seed_stats.get(&node) {
                link.total_tx_seconds = row.total_tx_seconds;
                link.last_tx_start = row.last_tx_start;
                link.last_tx_end = row.last_tx_end;
                link.connected_since = row.connected_since;
            }
            if let Some(dir) = self.directory.lookup(node) {
                link.node_callsign = Some(dir.callsign);
                link.node_description = Some(dir.description);
                link.node_location = Some(dir.location);
            }
            inner.links.insert(key, link);
        }
        for &node in &removed {
            Self::retain_removed_stats(&mut inner, local_node, node);
            inner.links.remove(&(local_node, node));
            inner.last_talker_state.remove(&(local_node, node));
        }

        let added_infos: Vec<LinkInfo> = added
            .iter()
            .filter_map(|n| inner.links.get(&(local_node, *n)).cloned())
            .collect();

        self.recompute_node_links(&mut inner, local_node, now);
        let snapshot = inner.nodes.get(&local_node).cloned();
        drop(inner);

        for &node in &added {
            keying.upsert_adjacent(local_node, node, None, None, None, None);
        }
        for &node in &removed {
            keying.remove_adjacent(local_node, node);
        }

        if !added_infos.is_empty() {
            self.emit(StateEvent::LinkAdded(local_node, added_infos));
        }
        if !removed.is_empty() {
            self.emit(StateEvent::LinkRemoved(local_node, removed));
        }
        if let Some(snapshot) = snapshot {
            self.emit(StateEvent::Status(snapshot));
        }
    }

    async fn apply_alinks_keying(
        &self,
        local_node: i64,
        ids: &[i64],
        keyed: &HashSet<i64>,
        keying: &KeyingTracker,
        now: i64,
    ) {
        let edges = keying.process_alinks(local_node, now, ids, keyed);
        self.emit_tx_edges(local_node, edges, keying, now).await;
    }

    /// Evaluate expired unkey timers for `local_node` without an
    /// accompanying ALINKS observation, so a quiet period (no further
    /// ALINKS, no other event) still closes out a confirmed unkey in
    /// bounded time. Driven by the poller's 5 s tick and by every
    /// non-ALINKS event `apply` handles.
    pub async fn process_timers(&self, local_node: i64, keying: &KeyingTracker, now: i64) {
        let edges = keying.process_timers(local_node, now);
        self.emit_tx_edges(local_node, edges, keying, now).await;
    }

    /// Shared emission path for confirmed keying-tracker edges, whether
    /// produced by a live ALINKS observation or by a standalone timer
    /// sweep: mutates the matching LinkInfo rows, persists totals/log
    /// rows, and broadcasts the resulting deltas.
    async fn emit_tx_edges(&self, local_node: i64, edges: Vec<crate::keying::TxEdge>, keying: &KeyingTracker, now: i64) {
        if edges.is_empty() {
            return;
        }

        let mut inner = self.inner.write().await;
        let mut rows = Vec::new();
        let mut log_rows = Vec::new();
        let mut tx_events = Vec::new();
        let mut keying_events = Vec::new();

        for edge in &edges {
            let key = (local_node, edge.adjacent_node_id);
            if let Some(link) = inner.links.get_mut(&key) {
                let active = edge.kind == TxEdgeKind::Start;
                link.current_tx = active;
                if active {
                    link.last_tx_start = Some(edge.at);
                } else {
                    link.last_tx_end = Some(edge.at);
                    if let Some(dur) = edge.duration_secs {
                        link.total_tx_seconds += dur;
                    }
                    log_rows.push(TransmissionLogRow {
                        source_id: local_node,
                        adjacent_link_id: edge.adjacent_node_id,
                        callsign: link.node_callsign.clone(),
                        timestamp_start: link.last_tx_start.unwrap_or(edge.at),
                        timestamp_end: edge.at,
                        duration_seconds: edge.duration_secs.unwrap_or(0),
                    });
                }
                rows.push(LinkStatRow {
                    node: link.node,
                    total_tx_seconds: link.total_tx_seconds,
                    last_tx_start: link.last_tx_start,
                    last_tx_end: link.last_tx_end,
                    connected_since: link.connected_since,
                });
            }

            let kind_str = match edge.kind {
                TxEdgeKind::Start => "START",
                TxEdgeKind::Stop => "STOP",
            };
            let tx_event = LinkTxEvent {
                local_node,
                node: edge.adjacent_node_id,
                kind: kind_str.to_string(),
                at: edge.at,
                total_tx_seconds: inner.links.get(&key).map_or(0, |l| l.total_tx_seconds),
                last_tx_start: inner.links.get(&key).and_then(|l| l.last_tx_start),
                last_tx_end: inner.links.get(&key).and_then(|l| l.last_tx_end),
            };
            Self::push_talker_log(&mut inner, tx_event.clone(), self.talker_log_max);
            tx_events.push(tx_event);
            keying_events.push((edge.adjacent_node_id, kind_str, edge.at, edge.duration_secs));
        }

        self.recompute_node_links(&mut inner, local_node, now);
        let snapshot = inner.nodes.get(&local_node).cloned();
        drop(inner);

        if !rows.is_empty() {
            self.persistence.upsert(&rows);
        }
        if !log_rows.is_empty() {
            self.persistence.append_transmission_logs(&log_rows);
        }
        for event in tx_events {
            self.emit(StateEvent::LinkTx(event.clone()));
            self.emit(StateEvent::TalkerEvent(event));
        }
        for (adjacent, kind, at, duration) in keying_events {
            self.emit(StateEvent::SourceNodeKeyingEvent {
                source: local_node,
                adjacent,
                kind,
                at,
                duration,
            });
        }
        if let Some(snapshot) = snapshot {
            self.emit(StateEvent::Status(snapshot));
        }
        self.emit(StateEvent::SourceNodeKeying {
            source_node_id: local_node,
            adjacent_nodes: keying.snapshot(local_node),
        });
    }

    /// Poll path. Only touches the rows for `combined.node`; entries under
    /// other local nodes are untouched.
    pub async fn apply_combined_status(&self, combined: &CombinedNodeStatus, keying: &KeyingTracker) {
        let now = now_millis();
        let local_node = combined.node;

        let mut inner = self.inner.write().await;

        let previous: HashSet<i64> = inner
            .links
            .keys()
            .filter(|(ln, _)| *ln == local_node)
            .map(|(_, n)| *n)
            .collect();
        let mut current: HashSet<i64> = HashSet::new();

        let mut tx_events = Vec::new();
        let mut rows = Vec::new();
        let mut enrichment = Vec::new();

        for conn in &combined.connections {
            current.insert(conn.node);
            let key = (local_node, conn.node);

            let seed = inner.seed_stats.get(&conn.node).cloned();
            let directory_entry = self.directory.lookup(conn.node);
            let link = inner.links.entry(key).or_insert_with(|| {
                let mut li = LinkInfo::new(local_node, conn.node);
                if let Some(row) = &seed {
                    li.total_tx_seconds = row.total_tx_seconds;
                    li.last_tx_start = row.last_tx_start;
                    li.last_tx_end = row.last_tx_end;
                    li.connected_since = row.connected_since;
                }
                if let Some(dir) = directory_entry {
                    li.node_callsign = Some(dir.callsign);
                    li.node_description = Some(dir.description);
                    li.node_location = Some(dir.location);
                }
                li
            });

            link.ip = conn.ip.clone();
            link.direction = conn.direction.as_str().to_string();
            link.elapsed = conn.elapsed.clone();
            link.link_type = conn.link_type.clone();
            link.mode = conn.mode;
            link.is_keyed = conn.is_keyed;
            if let Some(k) = &conn.keying {
                link.last_keyed_time = k.last_keyed_time;
                link.secs_since_keyed = k.secs_since_keyed;
            }
            if link.connected_since.is_none() {
                if let Some(secs) = crate::ami::parsers::parse_elapsed_secs(&conn.elapsed) {
                    link.connected_since = Some(now - secs * 1000);
                }
            }

            enrichment.push((conn.node, conn.mode, conn.direction, conn.ip.clone(), link.connected_since));

            let tx_driver = conn.keying.as_ref().map_or(conn.is_keyed, |k| k.is_keyed);
            if tx_driver {
                link.last_heard_at = Some(now);
            }

            let last_seen = inner.last_talker_state.get(&key).copied();
            if last_seen != Some(tx_driver) {
                inner.last_talker_state.insert(key, tx_driver);

                let link = inner.links.get_mut(&key).expect("entry inserted above");
                if tx_driver != link.current_tx {
                    link.current_tx = tx_driver;
                    if tx_driver {
                        link.last_tx_start = Some(now);
                    } else {
                        link.last_tx_end = Some(now);
                        if let Some(start) = link.last_tx_start {
                            link.total_tx_seconds += ((now - start) / 1000).max(0);
                        }
                    }
                }

                let kind = if tx_driver { "START" } else { "STOP" };
                let tx_event = LinkTxEvent {
                    local_node,
                    node: conn.node,
                    kind: kind.to_string(),
                    at: now,
                    total_tx_seconds: link.total_tx_seconds,
                    last_tx_start: link.last_tx_start,
                    last_tx_end: link.last_tx_end,
                };
                tx_events.push(tx_event);
                rows.push(LinkStatRow {
                    node: link.node,
                    total_tx_seconds: link.total_tx_seconds,
                    last_tx_start: link.last_tx_start,
                    last_tx_end: link.last_tx_end,
                    connected_since: link.connected_since,
                });
            }
        }

        let added: Vec<i64> = current.difference(&previous).copied().collect();
        let removed: Vec<i64> = previous.difference(&current).copied().collect();
        for &node in &removed {
            Self::retain_removed_stats(&mut inner, local_node, node);
            inner.links.remove(&(local_node, node));
            inner.last_talker_state.remove(&(local_node, node));
        }

        let added_infos: Vec<LinkInfo> = added
            .iter()
            .filter_map(|n| inner.links.get(&(local_node, *n)).cloned())
            .collect();

        self.recompute_node_links(&mut inner, local_node, now);
        let state = inner
            .nodes
            .get_mut(&local_node)
            .expect("recompute_node_links inserts the entry");
        state.rx_keyed = combined.rx_keyed;
        state.tx_keyed = combined.tx_keyed;
        state.heartbeat += 1;
        if state.heartbeat % 12 == 0 {
            state.version += 1;
        }
        let snapshot = state.clone();

        for entry in &tx_events {
            Self::push_talker_log(&mut inner, entry.clone(), self.talker_log_max);
        }

        drop(inner);

        for (node, mode, direction, ip, connected_since) in enrichment {
            keying.upsert_adjacent(local_node, node, mode, Some(direction), ip, connected_since);
        }
        for &node in &removed {
            keying.remove_adjacent(local_node, node);
        }

        if !rows.is_empty() {
            self.persistence.upsert(&rows);
        }
        if !added_infos.is_empty() {
            self.emit(StateEvent::LinkAdded(local_node, added_infos));
        }
        if !removed.is_empty() {
            self.emit(StateEvent::LinkRemoved(local_node, removed));
        }
        for event in tx_events {
            self.emit(StateEvent::LinkTx(event.clone()));
            self.emit(StateEvent::TalkerEvent(event));
        }
        self.emit(StateEvent::Status(snapshot));
    }

    /// Before a `LinkInfo` is dropped from `inner.links` on a link removal,
    /// write its accumulated total back into `seed_stats` so a later
    /// re-observation of the same composite key resumes from the live
    /// in-session total rather than falling back to the stale snapshot
    /// `StateManager::new` loaded at startup (which would make
    /// `total_tx_seconds` regress across ordinary unlink/relink churn).
    fn retain_removed_stats(inner: &mut StateInner, local_node: i64, node: i64) {
        if let Some(link) = inner.links.get(&(local_node, node)) {
            inner.seed_stats.insert(
                node,
                LinkStatRow {
                    node,
                    total_tx_seconds: link.total_tx_seconds,
                    last_tx_start: link.last_tx_start,
                    last_tx_end: link.last_tx_end,
                    connected_since: link.connected_since,
                },
            );
        }
    }

    fn recompute_node_links(&self, inner: &mut StateInner, local_node: i64, now: i64) {
        let links: Vec<LinkInfo> = inner
            .links
            .values()
            .filter(|l| l.local_node == local_node)
            .cloned()
            .collect();
        let state = inner
            .nodes
            .entry(local_node)
            .or_insert_with(|| NodeState::new(local_node, now));
        state.links = links.iter().map(|l| l.node).collect();
        state.links_detailed = links;
        state.updated_at = now;
    }
}

/// `RPT_LINKS` payload: a leading count followed by comma-separated node
/// tokens, each with the same optional mode prefix XStat's `LinkedNodes:`
/// uses but none of ALINKS's keyed suffixes (this event never carries
/// keying information).
fn parse_rpt_links(payload: &str, registry: &TextNodeRegistry) -> Vec<i64> {
    let mut ids = Vec::new();
    let mut parts = payload.split(',');
    let Some(count_field) = parts.next() else {
        return ids;
    };
    if count_field.trim().parse::<usize>().is_err() {
        tracing::warn!(payload, "rpt_links: missing/invalid leading count");
    }

    for token in parts {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let body = token.strip_prefix(['T', 'R', 'C', 'M']).unwrap_or(token);
        if body.is_empty() {
            continue;
        }
        let id = crate::ami::textid::parse_numeric_node(body).unwrap_or_else(|| registry.intern(body));
        ids.push(id);
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{EmptyNodeDirectory, NullLinkStatsStore};
    use crate::keying::KeyingTracker;

    fn manager() -> StateManager {
        StateManager::new(
            DEFAULT_TALKER_LOG_MAX,
            DEFAULT_TALKER_LOG_TTL_MS,
            Arc::new(NullLinkStatsStore),
            Arc::new(EmptyNodeDirectory),
        )
    }

    fn event(lines: &[&str]) -> AmiMessage {
        crate::ami::connector::test_support::message_from(lines)
    }

    fn conn(node: i64) -> crate::ami::parsers::CombinedConn {
        crate::ami::parsers::CombinedConn {
            node,
            ip: Some("192.0.2.1".to_string()),
            is_keyed: false,
            direction: crate::ami::parsers::Direction::Out,
            elapsed: "000:00:01".to_string(),
            link_type: String::new(),
            mode: Some('T'),
            keying: None,
        }
    }

    fn sorted(v: &[i64]) -> Vec<i64> {
        let mut v = v.to_vec();
        v.sort_unstable();
        v
    }

    #[tokio::test]
    async fn reconnect_banner_resets_uptime() {
        let mgr = manager();
        let keying = KeyingTracker::new(2000);
        let registry = TextNodeRegistry::new();

        let fully_booted = event(&["Event: FullyBooted", "Uptime: 60", "LastReload: 60"]);
        mgr.apply(1, &fully_booted, &keying, &registry).await;
        let snap = mgr.snapshot(1).await.unwrap();
        assert_eq!(snap.uptime_sec, 60);
        assert!(snap.booted_at.is_some());

        let banner = event(&["Asterisk Call Manager/Version: 11.0.0"]);
        mgr.apply(1, &banner, &keying, &registry).await;
        let snap = mgr.snapshot(1).await.unwrap();
        assert_eq!(snap.uptime_sec, 0);
        assert!(snap.booted_at.is_none());
    }

    #[tokio::test]
    async fn multi_local_node_isolation() {
        let mgr = manager();
        let keying = KeyingTracker::new(2000);

        let a = CombinedNodeStatus {
            node: 1,
            connections: vec![conn(100), conn(200)],
            rx_keyed: false,
            tx_keyed: false,
        };
        let b = CombinedNodeStatus {
            node: 2,
            connections: vec![conn(100), conn(300)],
            rx_keyed: false,
            tx_keyed: false,
        };
        mgr.apply_combined_status(&a, &keying).await;
        mgr.apply_combined_status(&b, &keying).await;

        let snap_a = mgr.snapshot(1).await.unwrap();
        let snap_b = mgr.snapshot(2).await.unwrap();
        assert_eq!(sorted(&snap_a.links), vec![100, 200]);
        assert_eq!(sorted(&snap_b.links), vec![100, 300]);

        let a2 = CombinedNodeStatus {
            node: 1,
            connections: vec![conn(200)],
            rx_keyed: false,
            tx_keyed: false,
        };
        mgr.apply_combined_status(&a2, &keying).await;
        let snap_a = mgr.snapshot(1).await.unwrap();
        assert_eq!(sorted(&snap_a.links), vec![200]);
        let snap_b = mgr.snapshot(2).await.unwrap();
        assert_eq!(sorted(&snap_b.links), vec![100, 300]);
    }

    #[tokio::test]
    async fn talker_log_records_tx_transitions_from_poll_path() {
        let mgr = manager();
        let keying = KeyingTracker::new(2000);

        let mut c = conn(546);
        c.is_keyed = true;
        let status = CombinedNodeStatus {
            node: 1,
            connections: vec![c],
            rx_keyed: true,
            tx_keyed: false,
        };
        mgr.apply_combined_status(&status, &keying).await;

        let log = mgr.talker_log_snapshot().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, "START");
        assert_eq!(log[0].node, 546);
    }

    /// A remote that keys, unkeys, and then goes quiet (no further ALINKS
    /// ever arrives) must still have its transmission closed out by a
    /// standalone timer sweep, the way the poller's 5 s tick drives it.
    #[tokio::test]
    async fn process_timers_closes_out_a_quiet_period_unkey() {
        let mgr = manager();
        let keying = KeyingTracker::new(0); // 0 ms unkey delay: ARM timers are due immediately

        let ids = [546];
        let mut keyed = HashSet::new();
        keyed.insert(546);
        mgr.apply_alinks_keying(1, &ids, &keyed, &keying, 0).await; // START
        assert!(keying.snapshot(1)[&546].is_transmitting);

        mgr.apply_alinks_keying(1, &ids, &HashSet::new(), &keying, 10).await; // ARM
        assert!(keying.snapshot(1)[&546].pending_unkey);

        // No further ALINKS arrives; only a direct timer sweep (what the
        // poller and every non-ALINKS `apply` branch now perform) can
        // close this out.
        mgr.process_timers(1, &keying, 20).await;

        assert!(!keying.snapshot(1)[&546].is_transmitting);
        // Synthetic millisecond timestamps fall well outside talker_log_snapshot's
        // real-clock TTL filter, so inspect the raw ring buffer directly here.
        let inner = mgr.inner.read().await;
        assert!(inner
            .talker_log
            .iter()
            .any(|e| e.kind == "STOP" && e.node == 546));
    }

    #[test]
    fn retain_removed_stats_preserves_live_total_for_relink() {
        let mut inner = StateInner {
            nodes: HashMap::new(),
            links: HashMap::new(),
            last_talker_state: HashMap::new(),
            talker_log: VecDeque::new(),
            seed_stats: HashMap::from([(
                546,
                LinkStatRow {
                    node: 546,
                    total_tx_seconds: 10,
                    last_tx_start: None,
                    last_tx_end: None,
                    connected_since: None,
                },
            )]),
        };
        let mut link = LinkInfo::new(1, 546);
        link.total_tx_seconds = 57;
        link.last_tx_start = Some(1_000);
        link.last_tx_end = Some(2_000);
        inner.links.insert((1, 546), link);

        StateManager::retain_removed_stats(&mut inner, 1, 546);

        let seed = inner.seed_stats.get(&546).expect("seed updated on removal");
        assert_eq!(seed.total_tx_seconds, 57);
        assert_eq!(seed.last_tx_start, Some(1_000));
        assert_eq!(seed.last_tx_end, Some(2_000));
    }
}
