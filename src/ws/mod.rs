//! WebSocket subscriber hub.
//!
//! Server → client messages are JSON envelopes `{messageType, data, timestamp}`.
//! Client → server messages are never interpreted; the receive side of every
//! connection exists only to detect the socket closing.
//!
//! | messageType | payload | cadence |
//! |---|---|---|
//! | `STATUS_UPDATE` | full `NodeState` | on every apply + heartbeat + on connect |
//! | `TALKER_LOG_SNAPSHOT` | `[TalkerEvent]` | on connect |
//! | `TALKER_EVENT` | `TalkerEvent` | on TX edge |
//! | `LINK_ADDED` | `[LinkInfo]` | on link add |
//! | `LINK_REMOVED` | `[i64]` | on link removal |
//! | `LINK_TX` | `LinkTxEvent` | on per-link TX edge, unbatched |
//! | `LINK_TX_BATCH` | `[LinkTxEvent]` | 100ms coalesced window |
//! | `SOURCE_NODE_KEYING` | `{source_node_id, adjacent_nodes}` | on tracker update + on connect |
//! | `SOURCE_NODE_KEYING_EVENT` | `{source, adjacent, kind, at, duration?}` | on confirmed START/END |
//! | `GAMIFICATION_TALLY_COMPLETED` | caller-provided object | on external signal via `broadcast_external` |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::ami::now_millis;
use crate::collaborators::SubscriberValidator;
use crate::config::HubConfig;
use crate::keying::{AdjacentNodeStatus, KeyingTracker};
use crate::poller::OnDemandTrigger;
use crate::state::{LinkInfo, NodeState, StateEvent, StateManager};

const BROADCAST_CHANNEL_CAPACITY: usize = 1024;
const CONNECTION_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Fan-out hub: one `StateManager`/`KeyingTracker` pair feeding two broadcast
/// channels (admin, masked-viewer), plus a batching+heartbeat pair of
/// background tasks. Constructed once per process and shared across every
/// `/ws` connection via `axum::extract::State`.
pub struct WebSocketHub {
    state: Arc<StateManager>,
    keying: Arc<KeyingTracker>,
    validator: Arc<dyn SubscriberValidator>,
    on_demand: Vec<Arc<OnDemandTrigger>>,
    admin_tx: broadcast::Sender<Value>,
    viewer_tx: broadcast::Sender<Value>,
    mask_ip_for_non_admin: bool,
    link_tx_batch_window: Duration,
}

impl WebSocketHub {
    pub fn new(
        state: Arc<StateManager>,
        keying: Arc<KeyingTracker>,
        validator: Arc<dyn SubscriberValidator>,
        on_demand: Vec<Arc<OnDemandTrigger>>,
        config: &HubConfig,
    ) -> Arc<Self> {
        let (admin_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        let (viewer_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        let hub = Arc::new(Self {
            state,
            keying,
            validator,
            on_demand,
            admin_tx,
            viewer_tx,
            mask_ip_for_non_admin: config.mask_ip_for_non_admin,
            link_tx_batch_window: Duration::from_millis(config.link_tx_batch_window_ms),
        });
        tokio::spawn(Arc::clone(&hub).run_event_dispatcher());
        tokio::spawn(Arc::clone(&hub).run_heartbeat(Duration::from_millis(config.heartbeat_interval_ms)));
        hub
    }

    /// Inject a message whose shape this hub has no opinion about — e.g. a
    /// `GAMIFICATION_TALLY_COMPLETED` signal produced by an external scorer.
    pub fn broadcast_external(&self, message_type: &str, data: Value) {
        self.send_both(envelope(message_type, data));
    }

    fn send_admin(&self, env: Value) {
        let _ = self.admin_tx.send(env);
    }

    fn send_viewer(&self, env: Value) {
        let _ = self.viewer_tx.send(env);
    }

    fn send_both(&self, env: Value) {
        let _ = self.admin_tx.send(env.clone());
        let _ = self.viewer_tx.send(env);
    }

    /// Translate one `StateEvent` into admin/viewer envelopes, masking IPs
    /// in the viewer copy when configured. Also feeds the LINK_TX batcher.
    fn dispatch_event(
        &self,
        event: StateEvent,
        batch: &mut Vec<crate::state::LinkTxEvent>,
        deadline: &mut Option<Instant>,
    ) {
        match event {
            StateEvent::Status(ns) => {
                self.send_admin(envelope("STATUS_UPDATE", to_value(&ns)));
                let viewer_env = if self.mask_ip_for_non_admin {
                    envelope("STATUS_UPDATE", to_value(&mask_node_state(&ns)))
                } else {
                    envelope("STATUS_UPDATE", to_value(&ns))
                };
                self.send_viewer(viewer_env);
            }
            StateEvent::LinkAdded(_local, links) => {
                self.send_admin(envelope("LINK_ADDED", to_value(&links)));
                let viewer_links = if self.mask_ip_for_non_admin {
                    mask_link_infos(&links)
                } else {
                    links
                };
                self.send_viewer(envelope("LINK_ADDED", to_value(&viewer_links)));
            }
            StateEvent::LinkRemoved(_local, ids) => {
                self.send_both(envelope("LINK_REMOVED", json!(ids)));
            }
            StateEvent::LinkTx(tx_event) => {
                self.send_both(envelope("LINK_TX", to_value(&tx_event)));
                batch.push(tx_event);
                if deadline.is_none() {
                    *deadline = Some(Instant::now() + self.link_tx_batch_window);
                }
            }
            StateEvent::TalkerEvent(entry) => {
                self.send_both(envelope("TALKER_EVENT", to_value(&entry)));
            }
            StateEvent::SourceNodeKeying {
                source_node_id,
                adjacent_nodes,
            } => {
                self.send_admin(envelope(
                    "SOURCE_NODE_KEYING",
                    json!({ "source_node_id": source_node_id, "adjacent_nodes": adjacent_nodes }),
                ));
                let viewer_adjacent = if self.mask_ip_for_non_admin {
                    mask_adjacent_nodes(&adjacent_nodes)
                } else {
                    adjacent_nodes
                };
                self.send_viewer(envelope(
                    "SOURCE_NODE_KEYING",
                    json!({ "source_node_id": source_node_id, "adjacent_nodes": viewer_adjacent }),
                ));
            }
            StateEvent::SourceNodeKeyingEvent {
                source,
                adjacent,
                kind,
                at,
                duration,
            } => {
                self.send_both(envelope(
                    "SOURCE_NODE_KEYING_EVENT",
                    json!({ "source": source, "adjacent": adjacent, "kind": kind, "at": at, "duration": duration }),
                ));
            }
        }
    }

    /// Consumes the State Manager's event broadcast for the lifetime of the
    /// process, translating each event into subscriber envelopes and
    /// coalescing `LinkTx` edges into a `LINK_TX_BATCH`: the flush timer
    /// arms only on the first event landing in an empty buffer.
    async fn run_event_dispatcher(self: Arc<Self>) {
        let mut rx = self.state.subscribe();
        let mut batch: Vec<crate::state::LinkTxEvent> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let sleep = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(event) => self.dispatch_event(event, &mut batch, &mut deadline),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                () = sleep, if deadline.is_some() => {
                    let flushed = std::mem::take(&mut batch);
                    deadline = None;
                    self.send_both(envelope("LINK_TX_BATCH", to_value(&flushed)));
                }
            }
        }
    }

    /// Re-broadcasts a full `STATUS_UPDATE` for every known node on a fixed
    /// interval, independent of activity. Every `TALKER_LOG_REFRESH_TICKS`th
    /// tick (~2 minutes at the default 5s interval) also re-sends the talker
    /// log snapshot, so a subscriber that misses the connect-time snapshot
    /// due to a dropped frame recovers without reconnecting.
    async fn run_heartbeat(self: Arc<Self>, interval: Duration) {
        const TALKER_LOG_REFRESH_MS: u128 = 120_000;
        let refresh_every = (TALKER_LOG_REFRESH_MS / interval.as_millis().max(1)).max(1) as u64;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            tick += 1;
            for node_id in self.state.known_nodes().await {
                if let Some(ns) = self.state.snapshot(node_id).await {
                    let mut unused_batch = Vec::new();
                    let mut unused_deadline = None;
                    self.dispatch_event(StateEvent::Status(ns), &mut unused_batch, &mut unused_deadline);
                }
            }
            if tick % refresh_every == 0 {
                let talker_log = self.state.talker_log_snapshot().await;
                self.send_both(envelope("TALKER_LOG_SNAPSHOT", to_value(&talker_log)));
            }
        }
    }

    /// Builds the connect-sequence envelopes a fresh subscriber expects: one
    /// `STATUS_UPDATE` per known node, one `TALKER_LOG_SNAPSHOT`, then one
    /// `SOURCE_NODE_KEYING` per tracked source. Also kicks an on-demand poll
    /// for every configured node so a fresh subscriber doesn't wait out a
    /// full tick interval for current data.
    async fn send_initial_snapshot(&self, tx: &mpsc::Sender<Value>, is_admin: bool) {
        for node_id in self.state.known_nodes().await {
            if let Some(ns) = self.state.snapshot(node_id).await {
                let data = if is_admin || !self.mask_ip_for_non_admin {
                    ns
                } else {
                    mask_node_state(&ns)
                };
                let _ = tx.try_send(envelope("STATUS_UPDATE", to_value(&data)));
            }
        }

        let talker_log = self.state.talker_log_snapshot().await;
        let _ = tx.try_send(envelope("TALKER_LOG_SNAPSHOT", to_value(&talker_log)));

        for source in self.keying.known_sources() {
            let adjacent = self.keying.snapshot(source);
            let adjacent = if is_admin || !self.mask_ip_for_non_admin {
                adjacent
            } else {
                mask_adjacent_nodes(&adjacent)
            };
            let _ = tx.try_send(envelope(
                "SOURCE_NODE_KEYING",
                json!({ "source_node_id": source, "adjacent_nodes": adjacent }),
            ));
        }

        for trigger in &self.on_demand {
            trigger.trigger();
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, is_admin: bool) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut out_rx) = mpsc::channel::<Value>(CONNECTION_QUEUE_CAPACITY);

        let send_task = tokio::spawn(async move {
            while let Some(env) = out_rx.recv().await {
                if sink.send(Message::Text(env.to_string().into())).await.is_err() {
                    break;
                }
            }
        });

        self.send_initial_snapshot(&tx, is_admin).await;

        let mut broadcast_rx = if is_admin {
            self.admin_tx.subscribe()
        } else {
            self.viewer_tx.subscribe()
        };

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(_)) => continue,
                        _ => break,
                    }
                }
                event = broadcast_rx.recv() => {
                    match event {
                        Ok(env) => {
                            // A slow client drops this frame rather than
                            // stalling the shared broadcast fan-out.
                            let _ = tx.try_send(env);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        drop(tx);
        send_task.abort();
    }
}

fn envelope(message_type: &str, data: Value) -> Value {
    json!({
        "messageType": message_type,
        "data": data,
        "timestamp": now_millis(),
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Rewrites `A.B.C.D` to `A.B.*.*`. Non-IPv4-shaped strings (including
/// already-masked ones, since `*` is not an ASCII digit) pass through
/// unchanged, which makes the rewrite idempotent for free.
fn mask_ipv4(ip: &str) -> String {
    let parts: Vec<&str> = ip.split('.').collect();
    let looks_like_ipv4 = parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if looks_like_ipv4 {
        format!("{}.{}.*.*", parts[0], parts[1])
    } else {
        ip.to_string()
    }
}

fn mask_node_state(ns: &NodeState) -> NodeState {
    let mut masked = ns.clone();
    for link in &mut masked.links_detailed {
        if let Some(ip) = &link.ip {
            link.ip = Some(mask_ipv4(ip));
        }
    }
    masked
}

fn mask_link_infos(links: &[LinkInfo]) -> Vec<LinkInfo> {
    links
        .iter()
        .map(|l| {
            let mut masked = l.clone();
            if let Some(ip) = &masked.ip {
                masked.ip = Some(mask_ipv4(ip));
            }
            masked
        })
        .collect()
}

fn mask_adjacent_nodes(map: &HashMap<i64, AdjacentNodeStatus>) -> HashMap<i64, AdjacentNodeStatus> {
    map.iter()
        .map(|(id, status)| {
            let mut masked = status.clone();
            if let Some(ip) = &masked.ip {
                masked.ip = Some(mask_ipv4(ip));
            }
            (*id, masked)
        })
        .collect()
}

/// `GET /ws?token=...` — validates the subscriber, then upgrades: a
/// query-string token is checked through a validator callback returning
/// `(allowed, is_admin)`, with `401` on rejection.
pub async fn ws_upgrade(
    State(hub): State<Arc<WebSocketHub>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (allowed, is_admin) = hub.validator.validate(query.token.as_deref());
    if !allowed {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| hub.handle_socket(socket, is_admin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ami::parsers::{CombinedConn, CombinedNodeStatus, Direction};
    use crate::collaborators::{AllowAllAdmin, EmptyNodeDirectory, NullLinkStatsStore};
    use crate::state::{DEFAULT_TALKER_LOG_MAX, DEFAULT_TALKER_LOG_TTL_MS};
    use std::time::Duration as StdDuration;

    fn conn(node: i64, ip: &str, keyed: bool) -> CombinedConn {
        CombinedConn {
            node,
            ip: Some(ip.to_string()),
            is_keyed: keyed,
            direction: Direction::Out,
            elapsed: "000:00:01".to_string(),
            link_type: String::new(),
            mode: Some('T'),
            keying: None,
        }
    }

    fn manager() -> Arc<StateManager> {
        Arc::new(StateManager::new(
            DEFAULT_TALKER_LOG_MAX,
            DEFAULT_TALKER_LOG_TTL_MS,
            Arc::new(NullLinkStatsStore),
            Arc::new(EmptyNodeDirectory),
        ))
    }

    #[test]
    fn mask_ipv4_rewrites_last_two_octets() {
        assert_eq!(mask_ipv4("192.168.1.42"), "192.168.*.*");
    }

    #[test]
    fn mask_ipv4_is_idempotent() {
        let once = mask_ipv4("10.0.0.5");
        let twice = mask_ipv4(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn mask_ipv4_passes_through_non_ipv4_strings() {
        assert_eq!(mask_ipv4("not-an-ip"), "not-an-ip");
        assert_eq!(mask_ipv4("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn envelope_has_message_type_data_and_timestamp() {
        let env = envelope("STATUS_UPDATE", json!({"node_id": 546}));
        assert_eq!(env["messageType"], "STATUS_UPDATE");
        assert_eq!(env["data"]["node_id"], 546);
        assert!(env["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn status_update_is_masked_on_viewer_channel_only() {
        let state = manager();
        let keying = Arc::new(KeyingTracker::new(2000));
        let hub = WebSocketHub::new(
            Arc::clone(&state),
            Arc::clone(&keying),
            Arc::new(AllowAllAdmin),
            vec![],
            &HubConfig::default(),
        );
        let mut admin_rx = hub.admin_tx.subscribe();
        let mut viewer_rx = hub.viewer_tx.subscribe();

        let combined = CombinedNodeStatus {
            node: 546,
            connections: vec![conn(100, "192.168.1.42", false)],
            rx_keyed: false,
            tx_keyed: false,
        };
        state.apply_combined_status(&combined, &keying).await;

        let admin_env = tokio::time::timeout(StdDuration::from_millis(500), async {
            loop {
                let env = admin_rx.recv().await.unwrap();
                if env["messageType"] == "STATUS_UPDATE" {
                    return env;
                }
            }
        })
        .await
        .unwrap();
        let viewer_env = tokio::time::timeout(StdDuration::from_millis(500), async {
            loop {
                let env = viewer_rx.recv().await.unwrap();
                if env["messageType"] == "STATUS_UPDATE" {
                    return env;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(admin_env["data"]["links_detailed"][0]["ip"], "192.168.1.42");
        assert_eq!(viewer_env["data"]["links_detailed"][0]["ip"], "192.168.*.*");
    }

    #[tokio::test]
    async fn link_tx_events_within_the_window_coalesce_into_one_batch() {
        let state = manager();
        let keying = Arc::new(KeyingTracker::new(2000));
        let mut config = HubConfig::default();
        config.link_tx_batch_window_ms = 50;
        let hub = WebSocketHub::new(
            Arc::clone(&state),
            Arc::clone(&keying),
            Arc::new(AllowAllAdmin),
            vec![],
            &config,
        );
        let mut admin_rx = hub.admin_tx.subscribe();

        for node in [100_i64, 200, 300] {
            let combined = CombinedNodeStatus {
                node: 1,
                connections: vec![conn(node, "10.0.0.1", true)],
                rx_keyed: true,
                tx_keyed: false,
            };
            state.apply_combined_status(&combined, &keying).await;
        }

        let batch = tokio::time::timeout(StdDuration::from_millis(500), async {
            loop {
                let env = admin_rx.recv().await.unwrap();
                if env["messageType"] == "LINK_TX_BATCH" {
                    return env;
                }
            }
        })
        .await
        .unwrap();

        let items = batch["data"].as_array().expect("batch data is an array");
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn broadcast_external_wraps_caller_supplied_value() {
        let state = manager();
        let keying = Arc::new(KeyingTracker::new(2000));
        let hub = WebSocketHub::new(state, keying, Arc::new(AllowAllAdmin), vec![], &HubConfig::default());
        let mut rx = hub.admin_tx.subscribe();
        hub.broadcast_external("GAMIFICATION_TALLY_COMPLETED", json!({"tally": 7}));
        let env = rx.try_recv().expect("message delivered");
        assert_eq!(env["messageType"], "GAMIFICATION_TALLY_COMPLETED");
        assert_eq!(env["data"]["tally"], 7);
    }
}
