use hickory_resolver::proto::op::ResponseCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("no healthy upstreams")]
    NoHealthyUpstream,

    #[error("no upstream defined: {0}")]
    NoUpstreamConfigured(String),

    /// 复用的连接已被对端关闭（仅 TCP/TLS）
    #[error("cached connection was closed by peer")]
    CachedConnectionClosed,

    #[error("upstream {upstream} failed: {reason}")]
    Transport { upstream: String, reason: String },

    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("wrong reply for id {id}: {question}")]
    ResponseMismatch { id: u16, question: String },

    #[error("concurrent queries exceeded maximum {0}")]
    LimitExceeded(usize),

    #[error("all upstreams failed")]
    AllUpstreamsFailed,

    #[error("no next handler for {0}")]
    NoNextHandler(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ForwardError {
    pub fn transport(upstream: impl Into<String>, reason: impl ToString) -> Self {
        ForwardError::Transport {
            upstream: upstream.into(),
            reason: reason.to_string(),
        }
    }

    /// Retried transparently against the same candidates without counting a failure.
    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }

    /// Whether this error should be charged to the upstream's failure counter.
    pub fn counts_against_upstream(&self) -> bool {
        self.kind().counts_against_upstream()
    }

    /// DNS rcode used when this error is turned into a reply for the client.
    pub fn response_code(&self) -> ResponseCode {
        self.kind().response_code()
    }

    pub fn kind(&self) -> ForwardErrorKind {
        match self {
            ForwardError::Io(_) => ForwardErrorKind::Io,
            ForwardError::Protocol(_) => ForwardErrorKind::Protocol,
            ForwardError::Config(_) => ForwardErrorKind::Config,
            ForwardError::NoHealthyUpstream => ForwardErrorKind::NoHealthyUpstream,
            ForwardError::NoUpstreamConfigured(_) => ForwardErrorKind::NoUpstreamConfigured,
            ForwardError::CachedConnectionClosed => ForwardErrorKind::CachedConnectionClosed,
            ForwardError::Transport { .. } => ForwardErrorKind::Transport,
            ForwardError::Timeout(_) => ForwardErrorKind::Timeout,
            ForwardError::ResponseMismatch { .. } => ForwardErrorKind::ResponseMismatch,
            ForwardError::LimitExceeded(_) => ForwardErrorKind::LimitExceeded,
            ForwardError::AllUpstreamsFailed => ForwardErrorKind::AllUpstreamsFailed,
            ForwardError::NoNextHandler(_) => ForwardErrorKind::NoNextHandler,
            ForwardError::Other(_) => ForwardErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardErrorKind {
    Io,
    Protocol,
    Config,
    NoHealthyUpstream,
    NoUpstreamConfigured,
    CachedConnectionClosed,
    Transport,
    Timeout,
    ResponseMismatch,
    LimitExceeded,
    AllUpstreamsFailed,
    NoNextHandler,
    Other,
}

impl ForwardErrorKind {
    pub fn is_recoverable(self) -> bool {
        matches!(self, ForwardErrorKind::CachedConnectionClosed)
    }

    pub fn counts_against_upstream(self) -> bool {
        matches!(
            self,
            ForwardErrorKind::Io
                | ForwardErrorKind::Protocol
                | ForwardErrorKind::Transport
                | ForwardErrorKind::Timeout
                | ForwardErrorKind::AllUpstreamsFailed
        )
    }

    pub fn response_code(self) -> ResponseCode {
        match self {
            ForwardErrorKind::ResponseMismatch => ResponseCode::FormErr,
            ForwardErrorKind::LimitExceeded => ResponseCode::Refused,
            _ => ResponseCode::ServFail,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForwardErrorKind::Io => "IO",
            ForwardErrorKind::Protocol => "PROTOCOL",
            ForwardErrorKind::Config => "CONFIG",
            ForwardErrorKind::NoHealthyUpstream => "NO_HEALTHY",
            ForwardErrorKind::NoUpstreamConfigured => "NO_UPSTREAM",
            ForwardErrorKind::CachedConnectionClosed => "CACHED_CLOSED",
            ForwardErrorKind::Transport => "TRANSPORT",
            ForwardErrorKind::Timeout => "TIMEOUT",
            ForwardErrorKind::ResponseMismatch => "MISMATCH",
            ForwardErrorKind::LimitExceeded => "LIMIT_EXCEEDED",
            ForwardErrorKind::AllUpstreamsFailed => "ALL_FAILED",
            ForwardErrorKind::NoNextHandler => "NO_NEXT",
            ForwardErrorKind::Other => "OTHER",
        }
    }
}

impl From<ForwardError> for std::io::Error {
    fn from(e: ForwardError) -> Self {
        std::io::Error::other(e.to_string())
    }
}
