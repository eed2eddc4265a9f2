//! Classification of raw switch-matrix replies.

use serde::Serialize;
use std::fmt;

/// Error tokens in match order. Matching is by substring on the upper-cased
/// reply, so `ERROR` is already covered once `ERR` is checked.
const ERROR_TOKENS: &[(&str, &str)] = &[
    ("NAK", "command refused (negative acknowledgement)"),
    ("NUB_RANG", "parameter out of range"),
    ("NUM_RANG", "parameter out of range"),
    ("ERR", "execution error"),
    ("INVALID", "invalid command"),
    ("FAIL", "execution failed"),
    ("TIMEOUT", "execution timed out"),
    ("BUSY", "device busy"),
];

const SUCCESS_TOKENS: &[&str] = &["OK", "ACK", "SUCCESS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseStatus {
    Ok,
    Err,
    Warn,
}

impl ResponseStatus {
    /// Bracketed tag used in the console log, e.g. `[OK]`.
    pub fn tag(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "[OK]",
            ResponseStatus::Err => "[ERR]",
            ResponseStatus::Warn => "[WARN]",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Outcome of interpreting a device reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseReport {
    pub status: ResponseStatus,
    pub message: String,
}

impl ResponseReport {
    fn new(status: ResponseStatus, message: String) -> Self {
        Self { status, message }
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Err
    }
}

/// Interpret the device's reply to `command`.
///
/// An empty reply is a success: many set commands return nothing.
pub fn classify_response(command: &str, response: &str) -> ResponseReport {
    let response = response.trim();
    if response.is_empty() {
        return ResponseReport::new(
            ResponseStatus::Ok,
            "command sent, no reply from device".to_string(),
        );
    }

    let upper = response.to_uppercase();
    if let Some((_, meaning)) = ERROR_TOKENS.iter().find(|(token, _)| upper.contains(token)) {
        return ResponseReport::new(ResponseStatus::Err, format!("{meaning} - {response}"));
    }
    if SUCCESS_TOKENS.iter().any(|token| upper.contains(token)) {
        return ResponseReport::new(ResponseStatus::Ok, format!("command succeeded - {response}"));
    }

    let command = command.trim();
    if command.ends_with('?') || command.ends_with('？') {
        return ResponseReport::new(ResponseStatus::Ok, format!("query answered - {response}"));
    }
    if response.contains(':') {
        return ResponseReport::new(ResponseStatus::Ok, format!("command succeeded - {response}"));
    }

    ResponseReport::new(
        ResponseStatus::Warn,
        format!("unrecognised reply format - {response}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_reply_is_ok() {
        let report = classify_response("ROUTE:CHANGETO:1:1", "  ");
        assert_eq!(report.status, ResponseStatus::Ok);
    }

    #[test]
    fn test_error_tokens_win_over_success_tokens() {
        let report = classify_response("ROUTE:CHANGETO:1:1", "NAK OK");
        assert_eq!(report.status, ResponseStatus::Err);
        assert!(report.message.ends_with("NAK OK"));

        assert!(classify_response("x", "num_rang").is_error());
        assert!(classify_response("x", "Device BUSY").is_error());
    }

    #[test]
    fn test_success_and_query_replies() {
        assert_eq!(classify_response("SetIP:1.2.3.4", "ack").status, ResponseStatus::Ok);
        assert_eq!(classify_response("ROUTE:COUNT?", "83").status, ResponseStatus::Ok);
        assert_eq!(classify_response("ifconfig", "IP:192.168.2.11").status, ResponseStatus::Ok);
    }

    #[test]
    fn test_unknown_reply_warns() {
        let report = classify_response("ifconfig", "hello");
        assert_eq!(report.status, ResponseStatus::Warn);
        assert_eq!(report.status.tag(), "[WARN]");
    }
}
