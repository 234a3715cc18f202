//! Protocol error type plus the wire-level error codes carried in
//! `task:error` payloads.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type: '{0}'")]
    UnknownMessageType(String),
}

/// Wire-level error codes. `EXIT_<n>` / `EXIT_<signal>` are synthesised per
/// child exit via [`exit_code`].
pub mod codes {
    pub const AUTH_FAILURE: &str = "AUTH_FAILURE";
    pub const QUEUE_FULL: &str = "QUEUE_FULL";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const SPAWN_ERROR: &str = "SPAWN_ERROR";
    pub const DIRECTORY_NOT_ALLOWED: &str = "DIRECTORY_NOT_ALLOWED";
    pub const WORKER_DISCONNECT: &str = "WORKER_DISCONNECT";
    pub const TRANSFER_FAILURE: &str = "TRANSFER_FAILURE";
    pub const PROTOCOL: &str = "PROTOCOL";

    /// Code for an abnormal child exit: `EXIT_<n>` for an exit status,
    /// `EXIT_<signal>` when the child was killed by a signal.
    pub fn exit_code(status: Option<i32>, signal: Option<&str>) -> String {
        match (status, signal) {
            (Some(n), _) => format!("EXIT_{}", n),
            (None, Some(sig)) => format!("EXIT_{}", sig),
            (None, None) => "EXIT_UNKNOWN".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::codes;

    #[test]
    fn test_exit_code_formats() {
        assert_eq!(codes::exit_code(Some(1), None), "EXIT_1");
        assert_eq!(codes::exit_code(None, Some("SIGKILL")), "EXIT_SIGKILL");
        assert_eq!(codes::exit_code(None, None), "EXIT_UNKNOWN");
    }
}
