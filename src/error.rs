use thiserror::Error;

/// Errors surfaced to callers of send / receive operations.
///
/// The core never raises errors towards the *network* - malformed or
/// undecryptable inbound data is dropped silently to avoid acting as an
/// oracle. These are strictly for the local caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// The operation did not complete within the caller's deadline. Retryable.
    #[error("operation timed out")]
    Timeout,
    /// All transmission slots of the connection are in use. Retryable after backoff.
    #[error("transmission capacity exhausted")]
    NoTransmission,
    /// The connection is closed; no further operations on it will succeed.
    #[error("connection closed")]
    Closed,
    /// The connection was disposed while the operation was pending.
    #[error("operation canceled")]
    Canceled,
    /// The requested stream length exceeds the negotiated agreement.
    #[error("stream length exceeds the negotiated limit")]
    StreamLengthLimit,
    /// The block exceeds the negotiated maximum block size.
    #[error("block size exceeds the negotiated limit")]
    BlockSizeLimit,
    /// The data does not fit into a single packet where it must.
    #[error("data exceeds the packet size limit")]
    PacketSizeLimit,
    #[error("serialization failed")]
    SerializationError,
    #[error("deserialization failed")]
    DeserializationError,
}

/// Errors surfaced from [`crate::terminal::ConnectionTerminal::connect`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The peer address could not be resolved or is unreachable.
    #[error("no endpoint for peer")]
    NoEndpoint,
    /// The peer did not answer the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The peer answered but rejected the handshake.
    #[error("handshake rejected by peer")]
    HandshakeRejected,
    /// The negotiated agreement does not allow bidirectional connections.
    #[error("bidirectional connections are not allowed by the agreement")]
    BidirectionalNotAllowed,
}
