//! Switch-matrix command construction and the operator command grammar.
//!
//! Route commands take the shape `ROUTE:<VERB>:<arg1>:<arg2>`; queries end in
//! `?`. The typed builders check the numeric domains before a string exists,
//! and [`parse_matrix_command`] applies the same domains to operator-typed
//! lines.

use crate::error::ValidationError;
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

/// Highest switch channel selectable on the first common port. `0` connects
/// every channel directly to the common port.
pub const COM1_MAX: u32 = 72;

/// Channels reachable on the second common port. `0` disconnects it.
pub const COM2_RANGE: RangeInclusive<u32> = 73..=76;

/// Switch indices addressable by `ROUTE:CHANGETO`.
pub const SWITCH_INDEX_RANGE: RangeInclusive<u32> = 1..=83;

/// A command string that passed validation.
///
/// Only this module can construct one, so a `CommandString` in hand means the
/// text obeys the matrix command grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandString(String);

impl CommandString {
    pub(crate) fn new(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Query commands end in `?`.
    pub fn is_query(&self) -> bool {
        self.0.ends_with('?')
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CommandString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CommandString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Allowed target ports for a `CHANGETO` on `switch_index`, or `None` when the
/// index is not addressable.
pub fn target_port_domain(switch_index: u32) -> Option<RangeInclusive<u32>> {
    match switch_index {
        1..=72 => Some(1..=2),
        73..=81 => Some(0..=8),
        82 => Some(0..=9),
        83 => Some(0..=4),
        _ => None,
    }
}

fn check_path_switch(com1: u32, com2: u32) -> Result<(), ValidationError> {
    if com1 > COM1_MAX {
        return Err(ValidationError::OutOfRange {
            field: "com1",
            value: com1.to_string(),
            allowed: format!("0..={COM1_MAX}"),
        });
    }
    if com2 != 0 && !COM2_RANGE.contains(&com2) {
        return Err(ValidationError::OutOfRange {
            field: "com2",
            value: com2.to_string(),
            allowed: format!("0 or {}..={}", COM2_RANGE.start(), COM2_RANGE.end()),
        });
    }
    Ok(())
}

fn check_switch_index(switch_index: u32) -> Result<RangeInclusive<u32>, ValidationError> {
    target_port_domain(switch_index).ok_or_else(|| ValidationError::OutOfRange {
        field: "switch_index",
        value: switch_index.to_string(),
        allowed: format!("{}..={}", SWITCH_INDEX_RANGE.start(), SWITCH_INDEX_RANGE.end()),
    })
}

fn check_change_to(switch_index: u32, target_port: u32) -> Result<(), ValidationError> {
    let domain = check_switch_index(switch_index)?;
    if !domain.contains(&target_port) {
        return Err(ValidationError::OutOfRange {
            field: "target_port",
            value: target_port.to_string(),
            allowed: format!("{}..={}", domain.start(), domain.end()),
        });
    }
    Ok(())
}

/// Build `ROUTE:PATHSWITCH:{com1}:{com2}`.
///
/// `com1` must be in `0..=72` and `com2` either `0` or in `73..=76`.
pub fn build_path_switch(com1: u32, com2: u32) -> Result<CommandString, ValidationError> {
    check_path_switch(com1, com2)?;
    Ok(MatrixCommand::PathSwitch { com1, com2 }.to_command_string())
}

/// Build `ROUTE:CHANGETO:{switch_index}:{target_port}`.
///
/// The target domain depends on the switch index, see [`target_port_domain`].
pub fn build_change_to(
    switch_index: u32,
    target_port: u32,
) -> Result<CommandString, ValidationError> {
    check_change_to(switch_index, target_port)?;
    Ok(MatrixCommand::ChangeTo {
        switch_index,
        target_port,
    }
    .to_command_string())
}

/// A parsed matrix command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixCommand {
    /// `*IDN?`
    Identify,
    /// `ifconfig`
    IfConfig,
    /// `ROUTE:COUNT?`
    RouteCount,
    /// `ROUTE:PATHSWITCH?`
    PathSwitchQuery,
    PathSwitch { com1: u32, com2: u32 },
    ChangeTo { switch_index: u32, target_port: u32 },
    ChangeToQuery { switch_index: u32 },
    SetIp(Ipv4Addr),
    SetNetMask(Ipv4Addr),
    SetGateway(Ipv4Addr),
    TcpPort(u16),
    /// MAC address as typed (colon, dash or bare hex).
    SetMac(String),
}

impl MatrixCommand {
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            MatrixCommand::Identify
                | MatrixCommand::RouteCount
                | MatrixCommand::PathSwitchQuery
                | MatrixCommand::ChangeToQuery { .. }
        )
    }

    pub fn to_command_string(&self) -> CommandString {
        CommandString::new(self.to_string())
    }
}

impl fmt::Display for MatrixCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixCommand::Identify => write!(f, "*IDN?"),
            MatrixCommand::IfConfig => write!(f, "ifconfig"),
            MatrixCommand::RouteCount => write!(f, "ROUTE:COUNT?"),
            MatrixCommand::PathSwitchQuery => write!(f, "ROUTE:PATHSWITCH?"),
            MatrixCommand::PathSwitch { com1, com2 } => {
                write!(f, "ROUTE:PATHSWITCH:{com1}:{com2}")
            }
            MatrixCommand::ChangeTo {
                switch_index,
                target_port,
            } => write!(f, "ROUTE:CHANGETO:{switch_index}:{target_port}"),
            MatrixCommand::ChangeToQuery { switch_index } => {
                write!(f, "ROUTE:CHANGETO:{switch_index}?")
            }
            MatrixCommand::SetIp(ip) => write!(f, "SetIP:{ip}"),
            MatrixCommand::SetNetMask(mask) => write!(f, "SetNetMask:{mask}"),
            MatrixCommand::SetGateway(gw) => write!(f, "SetGateway:{gw}"),
            MatrixCommand::TcpPort(port) => write!(f, "TcpPort:{port}"),
            MatrixCommand::SetMac(mac) => write!(f, "SetMac:{mac}"),
        }
    }
}

#[allow(clippy::expect_used)]
static ROUTE_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ROUTE:(COUNT|PATHSWITCH)[?？]$").expect("route query regex"));

#[allow(clippy::expect_used)]
static ROUTE_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ROUTE:(PATHSWITCH|CHANGETO):(\d+):(\d+)$").expect("route pair regex")
});

#[allow(clippy::expect_used)]
static CHANGE_TO_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ROUTE:CHANGETO:(\d+)[?？]$").expect("changeto query regex"));

#[allow(clippy::expect_used)]
static NETWORK_SETTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(SetIP|SetNetMask|SetGateway|SetGetway|TcpPort|SetMac):(.+)$")
        .expect("network setting regex")
});

#[allow(clippy::expect_used)]
static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[0-9A-Fa-f]{2}(?:[:-][0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{12})$")
        .expect("mac regex")
});

fn malformed(line: &str) -> ValidationError {
    ValidationError::MalformedCommand(line.to_string())
}

fn parse_number(text: &str, line: &str) -> Result<u32, ValidationError> {
    text.parse().map_err(|_| malformed(line))
}

fn parse_ipv4(field: &'static str, text: &str) -> Result<Ipv4Addr, ValidationError> {
    text.trim()
        .parse()
        .map_err(|_| ValidationError::OutOfRange {
            field,
            value: text.to_string(),
            allowed: "dotted IPv4 address".to_string(),
        })
}

/// Validate an operator-typed matrix command and classify it.
///
/// Leading and trailing whitespace is ignored. Route arguments are checked
/// against the same domains as the typed builders.
pub fn parse_matrix_command(line: &str) -> Result<MatrixCommand, ValidationError> {
    let s = line.trim();
    if s.is_empty() {
        return Err(ValidationError::MissingField("command"));
    }

    if s == "*IDN?" || s == "*IDN？" {
        return Ok(MatrixCommand::Identify);
    }
    if s.eq_ignore_ascii_case("ifconfig") {
        return Ok(MatrixCommand::IfConfig);
    }

    if let Some(caps) = ROUTE_QUERY.captures(s) {
        return Ok(match &caps[1] {
            "COUNT" => MatrixCommand::RouteCount,
            _ => MatrixCommand::PathSwitchQuery,
        });
    }

    if let Some(caps) = ROUTE_PAIR.captures(s) {
        let a = parse_number(&caps[2], s)?;
        let b = parse_number(&caps[3], s)?;
        return if &caps[1] == "PATHSWITCH" {
            check_path_switch(a, b)?;
            Ok(MatrixCommand::PathSwitch { com1: a, com2: b })
        } else {
            check_change_to(a, b)?;
            Ok(MatrixCommand::ChangeTo {
                switch_index: a,
                target_port: b,
            })
        };
    }

    if let Some(caps) = CHANGE_TO_QUERY.captures(s) {
        let switch_index = parse_number(&caps[1], s)?;
        check_switch_index(switch_index)?;
        return Ok(MatrixCommand::ChangeToQuery { switch_index });
    }

    if let Some(caps) = NETWORK_SETTING.captures(s) {
        let value = &caps[2];
        return match &caps[1] {
            "SetIP" => Ok(MatrixCommand::SetIp(parse_ipv4("ip", value)?)),
            "SetNetMask" => Ok(MatrixCommand::SetNetMask(parse_ipv4("netmask", value)?)),
            "SetGateway" | "SetGetway" => {
                Ok(MatrixCommand::SetGateway(parse_ipv4("gateway", value)?))
            }
            "TcpPort" => match value.parse::<u16>() {
                Ok(port) if port > 0 => Ok(MatrixCommand::TcpPort(port)),
                _ => Err(ValidationError::OutOfRange {
                    field: "tcp_port",
                    value: value.to_string(),
                    allowed: "1..=65535".to_string(),
                }),
            },
            _ if MAC_ADDRESS.is_match(value) => Ok(MatrixCommand::SetMac(value.to_string())),
            _ => Err(malformed(s)),
        };
    }

    Err(malformed(s))
}

/// One successfully sent raw command.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub command: String,
    pub sent_at: DateTime<Local>,
}

/// Most-recent-first list of sent raw commands.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl CommandHistory {
    pub const DEFAULT_CAPACITY: usize = 10;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, command: impl Into<String>) {
        self.entries.push_front(HistoryEntry {
            command: command.into(),
            sent_at: Local::now(),
        });
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new()
    }
}
