use std::fmt;

/// Bridge error taxonomy.
///
/// The `kind()` strings are part of the outward surface: they appear in frame
/// error codes and in rendered tool results, and must stay stable.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown server: {0}")]
    UnknownServer(String),
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),
    #[error("downstream error: {0}")]
    DownstreamError(String),
    #[error("execution timed out after {0}s")]
    SandboxTimeout(u64),
    #[error("sandbox crashed: {0}")]
    SandboxCrash(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownServer(_) => "unknown_server",
            Self::DownstreamUnavailable(_) => "downstream_unavailable",
            Self::DownstreamError(_) => "downstream_error",
            Self::SandboxTimeout(_) => "sandbox_timeout",
            Self::SandboxCrash(_) => "sandbox_crash",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::Protocol(_) => "protocol_error",
        }
    }

    /// `kind: message`, the form used in frame errors and stderr surfaces.
    pub fn tagged(&self) -> TaggedError<'_> {
        TaggedError(self)
    }
}

pub struct TaggedError<'a>(&'a BridgeError);

impl fmt::Display for TaggedError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind(), self.0)
    }
}

impl From<sandbox_jsonrpc::Error> for BridgeError {
    fn from(err: sandbox_jsonrpc::Error) -> Self {
        match err {
            sandbox_jsonrpc::Error::Rpc { code, message, .. } => {
                Self::DownstreamError(format!("json-rpc error {code}: {message}"))
            }
            err if err.is_closed() => Self::DownstreamUnavailable(err.to_string()),
            err if err.is_wait_timeout() => Self::DownstreamError(err.to_string()),
            err => Self::DownstreamUnavailable(err.to_string()),
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let cases = [
            (BridgeError::InvalidRequest("x".into()), "invalid_request"),
            (BridgeError::UnknownServer("x".into()), "unknown_server"),
            (
                BridgeError::DownstreamUnavailable("x".into()),
                "downstream_unavailable",
            ),
            (BridgeError::DownstreamError("x".into()), "downstream_error"),
            (BridgeError::SandboxTimeout(5), "sandbox_timeout"),
            (BridgeError::SandboxCrash("x".into()), "sandbox_crash"),
            (
                BridgeError::RuntimeUnavailable("x".into()),
                "runtime_unavailable",
            ),
            (BridgeError::Protocol("x".into()), "protocol_error"),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn tagged_form_prefixes_kind() {
        let err = BridgeError::UnknownServer("stub".into());
        assert_eq!(err.tagged().to_string(), "unknown_server: unknown server: stub");
    }
}
