use thiserror::Error;

/// The error type for netloop operations.
///
/// This encompasses all errors that can occur when using the netloop library:
/// connection-handle operations, server setup, and configuration. Per-connection
/// I/O failures are not surfaced as errors; they trigger the connection's
/// terminal transition and are observed through
/// [`Handler::on_close`](crate::Handler::on_close).
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Connection Errors
    // ============================================================================
    /// The connection is no longer usable.
    ///
    /// Returned synchronously from [`Conn::send`](crate::Conn::send),
    /// [`Conn::close`](crate::Conn::close) and related APIs once the connection
    /// has been closed or its write side shut down.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The event loop owning the connection has terminated.
    ///
    /// Work can no longer be queued onto it. This should not happen during
    /// normal operation and usually means the server was stopped while
    /// connection handles were still live.
    #[error("Event loop terminated")]
    LoopTerminated,

    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    // ============================================================================
    // Protocol Errors
    // ============================================================================
    /// A framing protocol failed irrecoverably.
    ///
    /// Returned from [`Protocol::unpack`](crate::Protocol::unpack) to fail
    /// loudly; the connection runs its terminal transition and the failure
    /// surfaces through [`Handler::on_close`](crate::Handler::on_close).
    /// [`LengthPrefixProtocol`](crate::LengthPrefixProtocol) uses it for
    /// frames that exceed its size limit.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
