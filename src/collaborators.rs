//! Narrow trait seams for out-of-scope external collaborators: a persisted
//! link-stats/transmission-log store, a node-directory enrichment lookup,
//! and the WebSocket subscriber auth gate. Each trait has a safe, inert
//! default so the core runs standalone; production deployments supply
//! their own implementation without this crate taking on their storage or
//! auth stack.

use std::collections::HashMap;
use std::sync::RwLock;

/// One row of the `link_stats` table: per-node transmit totals that survive
/// a restart.
#[derive(Debug, Clone)]
pub struct LinkStatRow {
    pub node: i64,
    pub total_tx_seconds: i64,
    pub last_tx_start: Option<i64>,
    pub last_tx_end: Option<i64>,
    pub connected_since: Option<i64>,
}

/// One row appended to `transmission_logs` on a confirmed TX_END edge.
#[derive(Debug, Clone)]
pub struct TransmissionLogRow {
    pub source_id: i64,
    pub adjacent_link_id: i64,
    pub callsign: Option<String>,
    pub timestamp_start: i64,
    pub timestamp_end: i64,
    pub duration_seconds: i64,
}

/// The persistence hook. Must not block — an implementation that needs to
/// do blocking I/O has to trampoline to its own background task and
/// capture values, since this is invoked synchronously under the State
/// Manager's writer lock.
pub trait LinkStatsStore: Send + Sync {
    /// Upsert the current totals for the given rows.
    fn upsert(&self, rows: &[LinkStatRow]);
    /// Append confirmed-end rows to the transmission log.
    fn append_transmission_logs(&self, rows: &[TransmissionLogRow]);
    /// Load all persisted rows at startup to seed LinksDetailed without
    /// emitting diff events.
    fn seed(&self) -> Vec<LinkStatRow>;
}

/// No-op store used when no persistence collaborator is configured.
/// Startup and runtime never fail because of it.
pub struct NullLinkStatsStore;

impl LinkStatsStore for NullLinkStatsStore {
    fn upsert(&self, _rows: &[LinkStatRow]) {}
    fn append_transmission_logs(&self, _rows: &[TransmissionLogRow]) {}
    fn seed(&self) -> Vec<LinkStatRow> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct NodeDirectoryEntry {
    pub callsign: String,
    pub description: String,
    pub location: String,
}

/// Enrichment lookup joining a numeric node id to callsign/description/
/// location. Must never block the hot path.
pub trait NodeDirectory: Send + Sync {
    fn lookup(&self, node: i64) -> Option<NodeDirectoryEntry>;
}

pub struct EmptyNodeDirectory;

impl NodeDirectory for EmptyNodeDirectory {
    fn lookup(&self, _node: i64) -> Option<NodeDirectoryEntry> {
        None
    }
}

/// Loads a pipe-delimited `node|callsign|description|location` file once at
/// construction. Periodic re-download of that file is an out-of-scope
/// external collaborator; this type only does the one-shot parse-and-hold
/// half of that job.
pub struct FileNodeDirectory {
    entries: RwLock<HashMap<i64, NodeDirectoryEntry>>,
}

impl FileNodeDirectory {
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_str(&text))
    }

    pub fn from_str(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.splitn(4, '|').collect();
            if fields.len() != 4 {
                tracing::warn!(line, "node directory: skipping malformed line");
                continue;
            }
            let Ok(node) = fields[0].trim().parse::<i64>() else {
                tracing::warn!(line, "node directory: skipping non-numeric node id");
                continue;
            };
            entries.insert(
                node,
                NodeDirectoryEntry {
                    callsign: fields[1].trim().to_string(),
                    description: fields[2].trim().to_string(),
                    location: fields[3].trim().to_string(),
                },
            );
        }
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl NodeDirectory for FileNodeDirectory {
    fn lookup(&self, node: i64) -> Option<NodeDirectoryEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node)
            .cloned()
    }
}

/// WebSocket subscriber auth gate: returns `(allowed, is_admin)`.
pub trait SubscriberValidator: Send + Sync {
    fn validate(&self, token: Option<&str>) -> (bool, bool);
}

/// Permits every connection as admin. Suitable only for local development —
/// production deployments must supply a real validator.
pub struct AllowAllAdmin;

impl SubscriberValidator for AllowAllAdmin {
    fn validate(&self, _token: Option<&str>) -> (bool, bool) {
        (true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_directory_parses_and_skips_blank_and_comment_lines() {
        let dir = FileNodeDirectory::from_str(
            "# comment\n\n546|KF8S|Repeater One|Columbus OH\n600|invalid\n",
        );
        let entry = dir.lookup(546).expect("entry present");
        assert_eq!(entry.callsign, "KF8S");
        assert!(dir.lookup(600).is_none());
        assert!(dir.lookup(999).is_none());
    }
}
