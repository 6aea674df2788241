use thiserror::Error;

/// Typed error hierarchy for scintilla.
///
/// Use at component boundaries (registry lookups, MCP transport, broker
/// dispatch, provider calls). Internal/leaf functions can continue using
/// `anyhow::Result` — the `Internal` variant allows seamless conversion via
/// the `?` operator.
#[derive(Debug, Error)]
pub enum ScintillaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source credentials not found: {0}")]
    AuthMissing(String),

    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("MCP server error: {0}")]
    McpServer(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("No capable agent registered for capability '{0}'")]
    NoCapableAgent(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ScintillaError {
    /// Whether this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } | Self::Provider { retryable, .. } => *retryable,
            Self::Internal(_) => true,
            Self::Config(_)
            | Self::AuthMissing(_)
            | Self::McpServer(_)
            | Self::ToolNotFound(_)
            | Self::NoCapableAgent(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retryable_flag_is_respected() {
        let e = ScintillaError::Transport {
            message: "connection reset".into(),
            retryable: true,
        };
        assert!(e.is_retryable());

        let e = ScintillaError::Transport {
            message: "tls handshake rejected".into(),
            retryable: false,
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn mcp_server_errors_are_not_retryable() {
        assert!(!ScintillaError::McpServer("invalid params".into()).is_retryable());
    }

    #[test]
    fn internal_errors_are_retryable() {
        let e = ScintillaError::Internal(anyhow::anyhow!("boom"));
        assert!(e.is_retryable());
    }
}
