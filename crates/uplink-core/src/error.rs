use thiserror::Error;

/// Errors produced by the uplink daemon and its protocol layer.
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    NotFound(String),

    #[error("PIN required")]
    PinRequired,

    #[error("Locked. Try again in {remaining_secs}s.")]
    Locked { remaining_secs: u64 },

    #[error("{0}")]
    Disabled(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl UplinkError {
    /// Whether the failure is worth retrying (timeouts, resets, TLS trouble).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::Io(_))
    }
}

pub type UplinkResult<T> = Result<T, UplinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_carries_remaining_time() {
        let err = UplinkError::Locked { remaining_secs: 12 };
        assert_eq!(err.to_string(), "Locked. Try again in 12s.");
    }

    #[test]
    fn transient_classification() {
        assert!(UplinkError::Timeout.is_transient());
        assert!(UplinkError::Transport("reset".into()).is_transient());
        assert!(!UplinkError::PinRequired.is_transient());
        assert!(!UplinkError::InvalidParams("pin".into()).is_transient());
    }
}
