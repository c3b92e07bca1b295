//! Query parameters and origin policy for the bridge endpoints
//!
//! Parameters are deserialized leniently from the query string and checked
//! with `validate`, so a bad request is answered with a plain 400 naming the
//! offending parameter.

use serde::{Deserialize, Deserializer};

use super::BridgeError;

pub const TERMINAL_PATH: &str = "/ws/terminal";
pub const VNC_PATH: &str = "/ws/vnc";

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Only same-machine frontends may open a bridge
pub fn is_allowed_origin(origin: Option<&str>) -> bool {
    match origin {
        None => true,
        Some(o) => {
            o.is_empty()
                || o.starts_with("wails://")
                || o.starts_with("tauri://")
                || o.starts_with("http://localhost")
                || o.starts_with("http://127.0.0.1")
                || o.starts_with("https://localhost")
                || o.starts_with("https://127.0.0.1")
        }
    }
}

/// `/ws/terminal?host=..&rows=..&cols=..&cmd=..`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TerminalParams {
    #[serde(rename = "host", default)]
    pub host_id: String,
    #[serde(default = "default_rows", deserialize_with = "rows_or_default")]
    pub rows: u16,
    #[serde(default = "default_cols", deserialize_with = "cols_or_default")]
    pub cols: u16,
    /// Run this instead of a login shell (e.g. `virsh console <vm>`)
    #[serde(rename = "cmd", default, deserialize_with = "non_empty")]
    pub command: Option<String>,
}

impl TerminalParams {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.host_id.is_empty() {
            return Err(BridgeError::BadRequest("missing host".into()));
        }
        Ok(())
    }
}

/// `/ws/vnc?host=..&port=..&ip=..`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VncParams {
    #[serde(rename = "host", default)]
    pub host_id: String,
    /// Zero when missing or not a port number
    #[serde(default, deserialize_with = "port_or_zero")]
    pub port: u16,
    /// Host address to try before loopback
    #[serde(rename = "ip", default, deserialize_with = "non_empty")]
    pub hint_ip: Option<String>,
}

impl VncParams {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.host_id.is_empty() {
            return Err(BridgeError::BadRequest("missing host".into()));
        }
        if self.port == 0 {
            return Err(BridgeError::BadRequest("missing or invalid port".into()));
        }
        Ok(())
    }

    /// Addresses to dial on the remote side, in order
    pub fn dial_targets(&self) -> Vec<String> {
        let mut targets = Vec::with_capacity(2);
        if let Some(ip) = &self.hint_ip {
            if ip.contains(':') && !ip.starts_with('[') {
                targets.push(format!("[{}]:{}", ip, self.port));
            } else {
                targets.push(format!("{}:{}", ip, self.port));
            }
        }
        targets.push(format!("127.0.0.1:{}", self.port));
        targets
    }
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

/// Missing, unparsable or zero values fall back to the default
fn positive_or<'de, D: Deserializer<'de>>(deserializer: D, default: u16) -> Result<u16, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default))
}

fn rows_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    positive_or(deserializer, DEFAULT_ROWS)
}

fn cols_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    positive_or(deserializer, DEFAULT_COLS)
}

fn port_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    positive_or(deserializer, 0)
}

fn non_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|v| !v.is_empty()))
}
