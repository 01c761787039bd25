//! Parsers for AMI Command/RptStatus response bodies.
//!
//! Each parser consumes the text body already extracted between the
//! response header and the `--END COMMAND--` sentinel (see
//! [`super::connector::extract_command_body`]). A malformed individual line
//! is skipped with a `tracing::warn!`; parsing never aborts on a bad line —
//! the caller always gets a partial-but-usable result.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::textid::{parse_numeric_node, TextNodeRegistry};

/// A link is "EchoLink" when its node number is at or above this threshold;
/// the Conn: line then omits the IP field.
pub const ECHOLINK_NODE_THRESHOLD: i64 = 3_000_000;

/// Above this many seconds since last keyed, a node is reported as "Never".
pub const NEVER_HEARD_THRESHOLD_SECS: i64 = 31_536_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(Self::In),
            "OUT" => Some(Self::Out),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
        }
    }
}

/// One `Conn:` line from an XStat response.
#[derive(Debug, Clone)]
pub struct Conn {
    pub node: i64,
    pub ip: Option<String>,
    pub is_keyed: bool,
    pub direction: Direction,
    pub elapsed: String,
    pub link_type: String,
}

/// One entry from a `LinkedNodes:` line.
#[derive(Debug, Clone, Copy)]
pub struct LinkedNode {
    pub node: i64,
    pub mode: char,
}

#[derive(Debug, Clone, Default)]
pub struct XStatResult {
    pub node: i64,
    pub connections: Vec<Conn>,
    pub linked_nodes: Vec<LinkedNode>,
    pub rx_keyed: bool,
    pub tx_keyed: bool,
    pub variables: HashMap<String, String>,
}

/// Per-remote keying history derived from a SawStat response.
#[derive(Debug, Clone)]
pub struct KeyingInfo {
    pub node: i64,
    pub is_keyed: bool,
    /// Unix millis; `None` when never heard.
    pub last_keyed_time: Option<i64>,
    pub last_unkeyed_time: Option<i64>,
    pub secs_since_keyed: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SawStatResult {
    pub node: i64,
    pub nodes: HashMap<i64, KeyingInfo>,
}

/// One entry in a [`CombinedNodeStatus`] — an XStat connection enriched with
/// SawStat keying history and LinkedNodes mode, where available.
#[derive(Debug, Clone)]
pub struct CombinedConn {
    pub node: i64,
    pub ip: Option<String>,
    pub is_keyed: bool,
    pub direction: Direction,
    pub elapsed: String,
    pub link_type: String,
    pub mode: Option<char>,
    pub keying: Option<KeyingInfo>,
}

#[derive(Debug, Clone)]
pub struct CombinedNodeStatus {
    pub node: i64,
    pub connections: Vec<CombinedConn>,
    pub rx_keyed: bool,
    pub tx_keyed: bool,
}

/// Parse an XStat response body.
pub fn parse_xstat(node: i64, body: &str, registry: &TextNodeRegistry) -> XStatResult {
    let mut result = XStatResult {
        node,
        ..Default::default()
    };

    for line in body.lines() {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("Conn:") {
            match parse_conn_line(rest.trim()) {
                Some(conn) => result.connections.push(conn),
                None => tracing::warn!(line, "xstat: skipping malformed Conn: line"),
            }
        } else if let Some(rest) = line.strip_prefix("LinkedNodes:") {
            for token in rest.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                match parse_linked_node_token(token, registry) {
                    Some(ln) => result.linked_nodes.push(ln),
                    None => tracing::warn!(token, "xstat: skipping malformed LinkedNodes token"),
                }
            }
        } else if let Some(rest) = line.strip_prefix("Var:") {
            if let Some((k, v)) = rest.trim().split_once('=') {
                let k = k.trim().to_string();
                let v = v.trim().to_string();
                if k == "RPT_RXKEYED" {
                    result.rx_keyed = v == "1";
                } else if k == "RPT_TXKEYED" {
                    result.tx_keyed = v == "1";
                }
                result.variables.insert(k, v);
            } else {
                tracing::warn!(line = rest, "xstat: skipping malformed Var: line");
            }
        }
    }

    result
}

fn parse_conn_line(rest: &str) -> Option<Conn> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Standard: <n> <ip> <keyed> <dir> <elapsed> [<link_type>]
    // EchoLink: <n> <keyed> <dir> <elapsed> [<link_type>]  (n >= threshold, no ip)
    if fields.len() < 4 {
        return None;
    }
    let node: i64 = fields[0].parse().ok()?;

    if node >= ECHOLINK_NODE_THRESHOLD {
        let is_keyed = fields.get(1)? == &"1";
        let direction = Direction::parse(fields.get(2)?)?;
        let elapsed = (*fields.get(3)?).to_string();
        let link_type = fields.get(4).map(|s| (*s).to_string()).unwrap_or_default();
        return Some(Conn {
            node,
            ip: None,
            is_keyed,
            direction,
            elapsed,
            link_type,
        });
    }

    if fields.len() < 5 {
        return None;
    }
    let ip = Some((*fields.get(1)?).to_string());
    let is_keyed = fields.get(2)? == &"1";
    let direction = Direction::parse(fields.get(3)?)?;
    let elapsed = (*fields.get(4)?).to_string();
    let link_type = fields.get(5).map(|s| (*s).to_string()).unwrap_or_default();
    Some(Conn {
        node,
        ip,
        is_keyed,
        direction,
        elapsed,
        link_type,
    })
}

fn parse_linked_node_token(token: &str, registry: &TextNodeRegistry) -> Option<LinkedNode> {
    let mut chars = token.chars();
    let mode = chars.next()?;
    if !matches!(mode, 'T' | 'R' | 'C' | 'M') {
        return None;
    }
    let rest: String = chars.collect();
    let node = if let Some(n) = parse_numeric_node(&rest) {
        n
    } else {
        if rest.is_empty() {
            return None;
        }
        registry.intern(&rest)
    };
    Some(LinkedNode { node, mode })
}

/// Parse a SawStat response body. `now_ms` is injected so tests are
/// deterministic; production callers pass `now_millis()`.
pub fn parse_sawstat(node: i64, body: &str, now_ms: i64) -> SawStatResult {
    let mut result = SawStatResult {
        node,
        ..Default::default()
    };

    for line in body.lines() {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(rest) = line.strip_prefix("Conn:") else {
            continue;
        };
        match parse_sawstat_conn(rest.trim(), now_ms) {
            Some(info) => {
                result.nodes.insert(info.node, info);
            }
            None => tracing::warn!(line, "sawstat: skipping malformed Conn: line"),
        }
    }

    result
}

fn parse_sawstat_conn(rest: &str, now_ms: i64) -> Option<KeyingInfo> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let node: i64 = fields[0].parse().ok()?;
    let is_keyed = fields[1] == "1";
    let secs_since_keyed: i64 = fields[2].parse().ok()?;
    let secs_since_unkeyed: i64 = fields[3].parse().ok()?;

    let never_heard = secs_since_keyed > NEVER_HEARD_THRESHOLD_SECS;
    let last_keyed_time = if never_heard {
        None
    } else {
        Some(now_ms - secs_since_keyed * 1000)
    };
    let last_unkeyed_time = if secs_since_unkeyed > NEVER_HEARD_THRESHOLD_SECS {
        None
    } else {
        Some(now_ms - secs_since_unkeyed * 1000)
    };

    Some(KeyingInfo {
        node,
        is_keyed,
        last_keyed_time,
        last_unkeyed_time,
        secs_since_keyed: if never_heard {
            None
        } else {
            Some(secs_since_keyed)
        },
    })
}

/// Parse an RPT_ALINKS VarSet payload: a leading count followed by
/// comma-separated tokens, each an optional `T` prefix and a `TU`/`TK`/`K`
/// (keyed) suffix, with `R`/`C`/`M` suffixes stripped but not interpreted.
pub fn parse_alinks(payload: &str, registry: &TextNodeRegistry) -> (Vec<i64>, HashSet<i64>) {
    let mut ids = Vec::new();
    let mut keyed = HashSet::new();

    let mut parts = payload.split(',');
    let Some(count_field) = parts.next() else {
        return (ids, keyed);
    };
    if count_field.trim().parse::<usize>().is_err() {
        tracing::warn!(payload, "alinks: missing/invalid leading count");
    }

    for token in parts {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match parse_alink_token(token, registry) {
            Some((id, is_keyed)) => {
                ids.push(id);
                if is_keyed {
                    keyed.insert(id);
                }
            }
            None => tracing::warn!(token, "alinks: skipping malformed token"),
        }
    }

    (ids, keyed)
}

fn parse_alink_token(token: &str, registry: &TextNodeRegistry) -> Option<(i64, bool)> {
    let rest = token.strip_prefix('T').unwrap_or(token);

    const SUFFIXES: &[&str] = &["TK", "TU", "K"];
    let mut body = rest;
    let mut is_keyed = false;
    for suffix in SUFFIXES {
        if let Some(stripped) = rest.strip_suffix(suffix) {
            body = stripped;
            is_keyed = matches!(*suffix, "TK" | "K");
            break;
        }
    }

    if body.is_empty() {
        return None;
    }

    let id = if let Some(n) = parse_numeric_node(body) {
        n
    } else {
        registry.intern(body)
    };
    Some((id, is_keyed))
}

/// Merge an XStat result with an optional SawStat result into one combined
/// per-node status. A LinkedNodes entry absent from the Conn: lines
/// (typical for text-only identifiers) becomes a synthetic connection with
/// only `node`/`mode` populated.
pub fn combine_xstat_sawstat(
    xstat: &XStatResult,
    sawstat: Option<&SawStatResult>,
) -> CombinedNodeStatus {
    let mode_by_node: HashMap<i64, char> = xstat.linked_nodes.iter().map(|l| (l.node, l.mode)).collect();
    let mut seen: HashSet<i64> = HashSet::new();

    let mut connections: Vec<CombinedConn> = xstat
        .connections
        .iter()
        .map(|conn| {
            seen.insert(conn.node);
            CombinedConn {
                node: conn.node,
                ip: conn.ip.clone(),
                is_keyed: conn.is_keyed,
                direction: conn.direction,
                elapsed: conn.elapsed.clone(),
                link_type: conn.link_type.clone(),
                mode: mode_by_node.get(&conn.node).copied(),
                keying: sawstat.and_then(|s| s.nodes.get(&conn.node).cloned()),
            }
        })
        .collect();

    for linked in &xstat.linked_nodes {
        if seen.contains(&linked.node) {
            continue;
        }
        connections.push(CombinedConn {
            node: linked.node,
            ip: None,
            is_keyed: false,
            direction: Direction::Out,
            elapsed: String::new(),
            link_type: String::new(),
            mode: Some(linked.mode),
            keying: sawstat.and_then(|s| s.nodes.get(&linked.node).cloned()),
        });
    }

    CombinedNodeStatus {
        node: xstat.node,
        connections,
        rx_keyed: xstat.rx_keyed,
        tx_keyed: xstat.tx_keyed,
    }
}

/// Render the human-readable last-heard string: "Keying" while active,
/// "Never" past the never-heard threshold, else `HHH:MM:SS`.
pub fn format_last_heard(is_keyed: bool, secs_since_keyed: Option<i64>) -> String {
    if is_keyed {
        return "Keying".to_string();
    }
    let Some(secs) = secs_since_keyed else {
        return "Never".to_string();
    };
    if secs > NEVER_HEARD_THRESHOLD_SECS {
        return "Never".to_string();
    }
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{h:03}:{m:02}:{s:02}")
}

/// Parse a `Conn:` line's `HHH:MM:SS` elapsed field into whole seconds.
pub fn parse_elapsed_secs(elapsed: &str) -> Option<i64> {
    let mut parts = elapsed.splitn(3, ':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let s: i64 = parts.next()?.parse().ok()?;
    Some(h * 3600 + m * 60 + s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_conn_line() {
        let reg = TextNodeRegistry::new();
        let body = "Conn: 546 192.0.2.17 1 IN 000:01:23 IAXRPT\r\n";
        let xstat = parse_xstat(546, body, &reg);
        assert_eq!(xstat.connections.len(), 1);
        let conn = &xstat.connections[0];
        assert_eq!(conn.node, 546);
        assert_eq!(conn.ip.as_deref(), Some("192.0.2.17"));
        assert!(conn.is_keyed);
        assert_eq!(conn.direction, Direction::In);
        assert_eq!(conn.elapsed, "000:01:23");
    }

    #[test]
    fn parses_echolink_conn_line_without_ip() {
        let reg = TextNodeRegistry::new();
        let body = "Conn: 3100123 0 OUT 000:00:05\r\n";
        let xstat = parse_xstat(1, body, &reg);
        let conn = &xstat.connections[0];
        assert_eq!(conn.node, 3_100_123);
        assert!(conn.ip.is_none());
        assert!(!conn.is_keyed);
    }

    #[test]
    fn parses_rx_tx_keyed_vars() {
        let reg = TextNodeRegistry::new();
        let body = "Var: RPT_RXKEYED=1\r\nVar: RPT_TXKEYED=0\r\n";
        let xstat = parse_xstat(1, body, &reg);
        assert!(xstat.rx_keyed);
        assert!(!xstat.tx_keyed);
    }

    #[test]
    fn linked_nodes_text_token_uses_registry() {
        let reg = TextNodeRegistry::new();
        let body = "LinkedNodes: T550465, TKF8S\r\n";
        let xstat = parse_xstat(1, body, &reg);
        assert_eq!(xstat.linked_nodes.len(), 2);
        assert_eq!(xstat.linked_nodes[0].node, 550_465);
        assert!(xstat.linked_nodes[1].node < 0);
        assert_eq!(reg.resolve(xstat.linked_nodes[1].node).as_deref(), Some("KF8S"));
    }

    #[test]
    fn parses_sawstat_and_derives_never_heard() {
        let now_ms = 1_000_000_000_000;
        let body = "Conn: 546 1 5 120\r\nConn: 547 0 40000000 90\r\n";
        let saw = parse_sawstat(1, body, now_ms);
        let a = &saw.nodes[&546];
        assert!(a.is_keyed);
        assert_eq!(a.last_keyed_time, Some(now_ms - 5000));

        let b = &saw.nodes[&547];
        assert!(!b.is_keyed);
        assert!(b.last_keyed_time.is_none());
    }

    #[test]
    fn parses_alinks_keyed_suffixes() {
        let reg = TextNodeRegistry::new();
        let (ids, keyed) = parse_alinks("3,100TK,200TU,300TU", &reg);
        assert_eq!(ids, vec![100, 200, 300]);
        assert!(keyed.contains(&100));
        assert!(!keyed.contains(&200));
    }

    #[test]
    fn format_last_heard_variants() {
        assert_eq!(format_last_heard(true, Some(0)), "Keying");
        assert_eq!(format_last_heard(false, None), "Never");
        assert_eq!(format_last_heard(false, Some(NEVER_HEARD_THRESHOLD_SECS + 1)), "Never");
        assert_eq!(format_last_heard(false, Some(3725)), "001:02:05");
    }

    #[test]
    fn parses_elapsed_into_seconds() {
        assert_eq!(parse_elapsed_secs("000:01:23"), Some(83));
        assert_eq!(parse_elapsed_secs("001:02:05"), Some(3725));
        assert_eq!(parse_elapsed_secs("garbage"), None);
    }

    #[test]
    fn combine_attaches_mode_and_keying_history() {
        let reg = TextNodeRegistry::new();
        let xstat_body = "Conn: 546 192.0.2.17 1 IN 000:01:23 IAXRPT\r\nLinkedNodes: T546\r\n";
        let xstat = parse_xstat(1, xstat_body, &reg);
        let saw_body = "Conn: 546 1 0 50\r\n";
        let saw = parse_sawstat(1, saw_body, 1_000_000);

        let combined = combine_xstat_sawstat(&xstat, Some(&saw));
        assert_eq!(combined.connections.len(), 1);
        assert_eq!(combined.connections[0].mode, Some('T'));
        assert!(combined.connections[0].keying.is_some());
    }

    #[test]
    fn combine_synthesizes_text_only_connection() {
        let reg = TextNodeRegistry::new();
        let xstat_body = "LinkedNodes: TKF8S\r\n";
        let xstat = parse_xstat(1, xstat_body, &reg);
        let combined = combine_xstat_sawstat(&xstat, None);
        assert_eq!(combined.connections.len(), 1);
        assert!(combined.connections[0].node < 0);
        assert_eq!(combined.connections[0].mode, Some('T'));
    }
}
