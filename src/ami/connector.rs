//! AMI TCP connector: dial, login, CRLF framing, reconnect with backoff,
//! and `ActionID`-based action/response correlation.
//!
//! The reconnect loop classifies failures into [`ConnectError::Permanent`]
//! (stop trying) vs [`ConnectError::Transient`] (exponential backoff) and
//! resets the delay on a clean connection. Outstanding actions are tracked
//! in a pending-action map keyed by a correlation id with a oneshot reply
//! channel per entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use uuid::Uuid;

use super::parsers::{
    combine_xstat_sawstat, parse_sawstat, parse_xstat, CombinedNodeStatus, SawStatResult,
    XStatResult,
};
use super::textid::TextNodeRegistry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACTION_TIMEOUT: Duration = Duration::from_secs(5);
const RAW_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Backoff,
}

/// Classifies a connection attempt's failure so the supervising loop knows
/// whether to keep retrying. The wire protocol gives no reliable way to
/// distinguish a login rejection from any other negative response, so every
/// disconnect is in practice retryable — `Permanent` exists to make the
/// classification explicit at each call site even though nothing currently
/// produces it.
#[derive(Debug)]
enum ConnectError {
    Permanent(String),
    Transient(String),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Permanent(msg) | ConnectError::Transient(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Debug)]
pub enum ActionError {
    /// No reply arrived before the internal action timeout.
    Timeout,
    /// Not connected to the AMI session at send time.
    Disconnected,
    /// The socket write failed mid-action.
    WriteFailed(String),
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::Timeout => write!(f, "action timed out waiting for a reply"),
            ActionError::Disconnected => write!(f, "not connected"),
            ActionError::WriteFailed(e) => write!(f, "write failed: {e}"),
        }
    }
}

/// One AMI frame: the ordered list of lines received before the blank-line
/// terminator.
#[derive(Debug, Clone, Default)]
pub struct AmiMessage {
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Event,
    Response,
}

/// Header keys that are always genuine key:value headers, never command
/// output. Everything after the last recognized header line (up to the
/// `--END COMMAND--` sentinel) is command body, even when it contains a
/// colon (`Conn:`, `Var:`, `LinkedNodes:` all look like headers syntactically).
const KNOWN_HEADER_KEYS: &[&str] = &[
    "Response",
    "ActionID",
    "Message",
    "Privilege",
    "Event",
    "EventValue",
    "Variable",
    "Value",
];

impl AmiMessage {
    fn from_lines(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            if k.trim().eq_ignore_ascii_case(key) {
                Some(v.trim())
            } else {
                None
            }
        })
    }

    pub fn action_id(&self) -> Option<&str> {
        self.header("ActionID")
    }

    pub fn kind(&self) -> FrameKind {
        if self.header("Event").is_some() {
            FrameKind::Event
        } else {
            FrameKind::Response
        }
    }

    /// The variable name for a `VarSet` event (`Variable:`) or an
    /// AllStar-style `RPT_*` event (`EventValue:` carries the value; the
    /// `Event:` header itself is the canonical header name in that case).
    pub fn event_name(&self) -> Option<&str> {
        self.header("Event")
    }

    pub fn variable(&self) -> Option<&str> {
        self.header("Variable")
    }

    pub fn value(&self) -> Option<&str> {
        self.header("Value").or_else(|| self.header("EventValue"))
    }

    /// Extract the command body: lines after the header block, up to
    /// (excluding) the `--END COMMAND--` sentinel.
    pub fn command_body(&self) -> String {
        let mut in_body = false;
        let mut out = Vec::new();
        for line in &self.lines {
            if !in_body {
                if let Some((key, _)) = line.split_once(':') {
                    if KNOWN_HEADER_KEYS.contains(&key.trim()) {
                        continue;
                    }
                }
                in_body = true;
            }
            if line.trim() == "--END COMMAND--" {
                break;
            }
            out.push(line.clone());
        }
        out.join("\n")
    }
}

pub struct AmiConnectorConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub events: bool,
    pub retry_min: Duration,
    pub retry_max: Duration,
}

struct Inner {
    config: AmiConnectorConfig,
    state_tx: watch::Sender<ConnectorState>,
    pending: StdMutex<HashMap<String, oneshot::Sender<AmiMessage>>>,
    raw_tx: broadcast::Sender<AmiMessage>,
    write_half: AsyncMutex<Option<OwnedWriteHalf>>,
}

/// Handle to one AMI session. Cheap to clone; all clones share the same
/// socket, pending-action map, and state.
#[derive(Clone)]
pub struct AmiConnector {
    inner: Arc<Inner>,
}

impl AmiConnector {
    pub fn new(config: AmiConnectorConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectorState::Disconnected);
        let (raw_tx, _) = broadcast::channel(RAW_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                pending: StdMutex::new(HashMap::new()),
                raw_tx,
                write_half: AsyncMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state_tx.subscribe()
    }

    /// The `Raw()` stream: events and any response not correlated to a
    /// waiter, consumed by the State Manager.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<AmiMessage> {
        self.inner.raw_tx.subscribe()
    }

    fn set_state(&self, state: ConnectorState) {
        let _ = self.inner.state_tx.send(state);
    }

    /// Supervising reconnect loop. Never returns; intended to be spawned
    /// once per configured node at startup.
    pub async fn run(self) {
        let mut delay = self.inner.config.retry_min;
        loop {
            match self.connect_and_run().await {
                Ok(()) => {
                    tracing::info!(host = %self.inner.config.host, "ami: session ended cleanly");
                    delay = self.inner.config.retry_min;
                }
                Err(ConnectError::Permanent(msg)) => {
                    tracing::error!(host = %self.inner.config.host, error = %msg, "ami: permanent failure, will still retry after backoff");
                    self.set_state(ConnectorState::Backoff);
                }
                Err(ConnectError::Transient(msg)) => {
                    tracing::warn!(host = %self.inner.config.host, error = %msg, delay_ms = delay.as_millis() as u64, "ami: connection lost, backing off");
                    self.set_state(ConnectorState::Backoff);
                }
            }
            self.fail_all_pending();
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.inner.config.retry_max);
        }
    }

    fn fail_all_pending(&self) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.clear();
    }

    async fn connect_and_run(&self) -> Result<(), ConnectError> {
        self.set_state(ConnectorState::Connecting);
        let addr = format!("{}:{}", self.inner.config.host, self.inner.config.port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectError::Transient(format!("connect timed out to {addr}")))?
            .map_err(|e| ConnectError::Transient(format!("connect failed to {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        *self.inner.write_half.lock().await = Some(write_half);

        self.set_state(ConnectorState::Authenticating);
        self.write_action(
            "Login",
            &[
                ("Username", self.inner.config.user.as_str()),
                ("Secret", self.inner.config.password.as_str()),
                ("Events", if self.inner.config.events { "on" } else { "off" }),
            ],
        )
        .await
        .map_err(|e| ConnectError::Transient(format!("login write failed: {e}")))?;

        self.set_state(ConnectorState::Connected);
        tracing::info!(host = %self.inner.config.host, "ami: connected and logged in");

        let mut reader = BufReader::new(read_half);
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(msg)) => {
                    self.dispatch(msg);
                }
                Ok(None) => {
                    return Err(ConnectError::Transient("peer closed connection".to_string()));
                }
                Err(e) => {
                    return Err(ConnectError::Transient(format!("read error: {e}")));
                }
            }
        }
    }

    fn dispatch(&self, msg: AmiMessage) {
        if let Some(action_id) = msg.action_id() {
            let waiter = {
                let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(action_id)
            };
            if let Some(tx) = waiter {
                let _ = tx.send(msg);
                return;
            }
        }
        let _ = self.inner.raw_tx.send(msg);
    }

    async fn write_action(&self, action: &str, headers: &[(&str, &str)]) -> std::io::Result<String> {
        let action_id = generate_action_id();
        let mut frame = format!("Action: {action}\r\nActionID: {action_id}\r\n");
        for (k, v) in headers {
            frame.push_str(&format!("{k}: {v}\r\n"));
        }
        frame.push_str("\r\n");

        let mut guard = self.inner.write_half.lock().await;
        let Some(write_half) = guard.as_mut() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "no active socket"));
        };
        write_half.write_all(frame.as_bytes()).await?;
        Ok(action_id)
    }

    async fn send_action_awaiting_reply(
        &self,
        action: &str,
        headers: &[(&str, &str)],
    ) -> Result<AmiMessage, ActionError> {
        if self.state() != ConnectorState::Connected {
            return Err(ActionError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        let action_id = self
            .write_action(action, headers)
            .await
            .map_err(|e| ActionError::WriteFailed(e.to_string()))?;
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(action_id.clone(), tx);

        match timeout(ACTION_TIMEOUT, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(ActionError::Disconnected),
            Err(_) => {
                self.inner
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&action_id);
                Err(ActionError::Timeout)
            }
        }
    }

    /// Generic AMI `Action: Command`.
    pub async fn send_command(&self, cmd: &str) -> Result<AmiMessage, ActionError> {
        self.send_action_awaiting_reply("Command", &[("Command", cmd)]).await
    }

    /// AllStar-specific status query.
    pub async fn rpt_status(&self, node: i64, subcommand: &str) -> Result<AmiMessage, ActionError> {
        let node_str = node.to_string();
        self.send_action_awaiting_reply(
            "RptStatus",
            &[("Command", subcommand), ("Node", node_str.as_str())],
        )
        .await
    }

    pub async fn get_xstat(
        &self,
        node: i64,
        registry: &TextNodeRegistry,
    ) -> Result<XStatResult, ActionError> {
        let msg = self.rpt_status(node, "XStat").await?;
        Ok(parse_xstat(node, &msg.command_body(), registry))
    }

    pub async fn get_sawstat(&self, node: i64, now_ms: i64) -> Result<SawStatResult, ActionError> {
        let msg = self.rpt_status(node, "SawStat").await?;
        Ok(parse_sawstat(node, &msg.command_body(), now_ms))
    }

    /// SawStat failure does not fail the combined status; the combined
    /// result simply omits keying history in that case.
    pub async fn get_combined_status(
        &self,
        node: i64,
        registry: &TextNodeRegistry,
        now_ms: i64,
    ) -> Result<CombinedNodeStatus, ActionError> {
        let xstat = self.get_xstat(node, registry).await?;
        let sawstat = self.get_sawstat(node, now_ms).await.ok();
        Ok(combine_xstat_sawstat(&xstat, sawstat.as_ref()))
    }
}

async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<AmiMessage>> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        if trimmed.is_empty() {
            if lines.is_empty() {
                continue;
            }
            return Ok(Some(AmiMessage::from_lines(lines)));
        }
        lines.push(trimmed);
    }
}

/// Cryptographically random 48-bit ActionID rendered as hex, drawn from a
/// v4 UUID's random bytes rather than pulling in a separate RNG crate.
fn generate_action_id() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    bytes[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Test-only helper for building `AmiMessage` fixtures outside this module.
#[cfg(test)]
pub mod test_support {
    use super::AmiMessage;

    pub fn message_from(lines: &[&str]) -> AmiMessage {
        AmiMessage::from_lines(lines.iter().map(|s| (*s).to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_event_vs_response() {
        let event = AmiMessage::from_lines(vec!["Event: RPT_ALINKS".to_string(), "Value: 3,100K".to_string()]);
        assert_eq!(event.kind(), FrameKind::Event);

        let response = AmiMessage::from_lines(vec!["Response: Success".to_string(), "ActionID: abc123".to_string()]);
        assert_eq!(response.kind(), FrameKind::Response);

        let bare_action_id = AmiMessage::from_lines(vec!["ActionID: abc123".to_string()]);
        assert_eq!(bare_action_id.kind(), FrameKind::Response);
    }

    #[test]
    fn extracts_command_body_skipping_headers() {
        let msg = AmiMessage::from_lines(vec![
            "Response: Follows".to_string(),
            "Privilege: Command".to_string(),
            "Conn: 546 192.0.2.17 1 IN 000:01:23 IAXRPT".to_string(),
            "LinkedNodes: T546".to_string(),
            "--END COMMAND--".to_string(),
            "ActionID: abc123".to_string(),
        ]);
        let body = msg.command_body();
        assert!(body.contains("Conn: 546"));
        assert!(body.contains("LinkedNodes: T546"));
        assert!(!body.contains("END COMMAND"));
    }

    #[test]
    fn action_id_is_twelve_hex_chars() {
        let id = generate_action_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
