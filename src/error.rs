use std::io;

/// Error kinds surfaced by the protocol core.
///
/// Stream-shaped APIs (`AsyncRead`/`AsyncWrite` impls) return `std::io::Error`
/// values that wrap one of these, so callers on those seams can downcast via
/// `io::Error::get_ref`.
#[derive(Debug, thiserror::Error)]
pub enum HysteriaError {
    #[error("dial failed: {0}")]
    DialFailure(#[source] io::Error),
    #[error("TLS handshake failed: {0}")]
    TlsFailure(String),
    #[error("authentication failed, status code: {status}")]
    AuthenticationFailed { status: u16 },
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("UDP disabled by server")]
    UdpDisabledByServer,
    #[error("UDP not enabled")]
    Invalid,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("cancelled")]
    Cancelled,
    #[error("handshake response already written")]
    HandshakeAlreadyWritten,
    #[error(transparent)]
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, HysteriaError>;

impl HysteriaError {
    /// Whether this error represents an orderly teardown rather than a
    /// protocol or I/O failure. Drives the debug-vs-error log level split
    /// when closing sessions.
    pub fn is_closed_or_canceled(&self) -> bool {
        match self {
            HysteriaError::ConnectionClosed | HysteriaError::Cancelled => true,
            HysteriaError::DialFailure(e) | HysteriaError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<HysteriaError> for io::Error {
    fn from(err: HysteriaError) -> io::Error {
        let kind = match &err {
            HysteriaError::DialFailure(e) => e.kind(),
            HysteriaError::TlsFailure(_) => io::ErrorKind::InvalidData,
            HysteriaError::AuthenticationFailed { .. } => io::ErrorKind::PermissionDenied,
            HysteriaError::MalformedFrame(_) => io::ErrorKind::InvalidData,
            HysteriaError::RemoteError(_) => io::ErrorKind::Other,
            HysteriaError::UdpDisabledByServer => io::ErrorKind::Unsupported,
            HysteriaError::Invalid => io::ErrorKind::InvalidInput,
            HysteriaError::ConnectionClosed => io::ErrorKind::ConnectionAborted,
            HysteriaError::Cancelled => io::ErrorKind::Interrupted,
            HysteriaError::HandshakeAlreadyWritten => io::ErrorKind::BrokenPipe,
            HysteriaError::Io(e) => e.kind(),
        };
        io::Error::new(kind, err)
    }
}

/// Classifies quinn connection errors so that orderly shutdown is
/// distinguishable from abnormal termination.
pub fn from_connection_error(err: quinn::ConnectionError) -> HysteriaError {
    match err {
        quinn::ConnectionError::ApplicationClosed(_)
        | quinn::ConnectionError::ConnectionClosed(_)
        | quinn::ConnectionError::LocallyClosed
        | quinn::ConnectionError::Reset
        | quinn::ConnectionError::TimedOut => HysteriaError::ConnectionClosed,
        other => HysteriaError::Io(io::Error::other(other)),
    }
}

pub fn from_write_error(err: quinn::WriteError) -> HysteriaError {
    match err {
        quinn::WriteError::ConnectionLost(e) => from_connection_error(e),
        quinn::WriteError::Stopped(_) | quinn::WriteError::ClosedStream => {
            HysteriaError::ConnectionClosed
        }
        other => HysteriaError::Io(io::Error::other(other)),
    }
}
