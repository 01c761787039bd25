//! Asterisk Manager Interface client: wire framing, login, reconnect,
//! action/response correlation, and the XStat/SawStat/ALINKS parsers.

pub mod connector;
pub mod parsers;
pub mod textid;

/// Milliseconds since the Unix epoch. Used for every timestamp in this
/// crate's domain model.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
