use thiserror::Error;

/// Hypervisor-level failure classes surfaced by the remote RPC channel.
///
/// A subset of these indicates the host itself is in a bad state, in which
/// case the fleet registry schedules a fresh probe of the affected host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorErrorKind {
    SystemError,
    NoConnect,
    InternalError,
    OperationFailed,
    Other,
}

impl HypervisorErrorKind {
    pub fn warrants_reprobe(self) -> bool {
        matches!(
            self,
            HypervisorErrorKind::SystemError
                | HypervisorErrorKind::NoConnect
                | HypervisorErrorKind::InternalError
        )
    }

    /// Classify a virsh stderr message into a failure class.
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("failed to connect")
            || lower.contains("unable to connect")
            || lower.contains("cannot recv data")
            || lower.contains("connection reset")
        {
            HypervisorErrorKind::NoConnect
        } else if lower.contains("internal error") {
            HypervisorErrorKind::InternalError
        } else if lower.contains("system error") || lower.contains("cannot open") {
            HypervisorErrorKind::SystemError
        } else if lower.contains("operation failed") {
            HypervisorErrorKind::OperationFailed
        } else {
            HypervisorErrorKind::Other
        }
    }
}

#[derive(Debug, Error)]
pub enum StratoError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no capacity: {0}")]
    NoCapacity(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("remote command exited with status {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("hypervisor error ({kind:?}): {message}")]
    Hypervisor {
        kind: HypervisorErrorKind,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state parse error: {0}")]
    Serde(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StratoError {
    fn from(err: serde_json::Error) -> Self {
        StratoError::Serde(err.to_string())
    }
}

impl From<toml::de::Error> for StratoError {
    fn from(err: toml::de::Error) -> Self {
        StratoError::Serde(err.to_string())
    }
}

impl StratoError {
    /// Whether the fleet should re-probe the host this error came from.
    pub fn warrants_reprobe(&self) -> bool {
        match self {
            StratoError::Hypervisor { kind, .. } => kind.warrants_reprobe(),
            StratoError::HostUnreachable(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_connect_failures() {
        let kind = HypervisorErrorKind::classify("error: failed to connect to the hypervisor");
        assert_eq!(kind, HypervisorErrorKind::NoConnect);
        assert!(kind.warrants_reprobe());
    }

    #[test]
    fn classify_domain_errors() {
        let kind =
            HypervisorErrorKind::classify("error: operation failed: domain is already running");
        assert_eq!(kind, HypervisorErrorKind::OperationFailed);
        assert!(!kind.warrants_reprobe());
    }
}
