use std::sync::Arc;

/// Errors produced by the coordination layer.
///
/// Variants are split by where the failure is detected: `Config`, `SdpParse`
/// and `InFlight` are local and raised before any engine call is made, the
/// rest surface through promise rejection once the engine has been involved.
/// The type is `Clone` because a single rejection may be observed by several
/// continuations plus a blocking waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Structurally invalid configuration. Raised synchronously, before the
    /// engine sees anything.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed candidate or description text that fails local parsing.
    #[error("SDP parse error: {0}")]
    SdpParse(String),

    /// Well-formed description text that the engine refused, either while
    /// translating into engine form or while applying it.
    #[error("SDP translation rejected by engine: {0}")]
    SdpTranslation(String),

    /// The engine declined to synthesize an offer or answer.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The engine refused an otherwise parseable ICE candidate.
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),

    /// Data channel parameters were rejected by the engine.
    #[error("data channel creation failed: {0}")]
    ChannelCreation(String),

    /// An executor thread or its reactor could not be started or joined.
    #[error("runtime failure: {0}")]
    Runtime(String),

    /// Operation attempted against a resource that does not exist yet or has
    /// been torn down (e.g. scheduling after runtime shutdown).
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// A second set-description call of the same kind was issued while one is
    /// still outstanding. The caller is notified instead of silently dropped.
    #[error("{0} is already in flight")]
    InFlight(&'static str),

    /// The coordinator or channel has been closed.
    #[error("connection closed")]
    Closed,

    /// Engine failure with no more specific mapping.
    #[error(transparent)]
    Engine(#[from] Arc<webrtc::Error>),
}

impl Error {
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Engine(Arc::new(value))
    }
}
