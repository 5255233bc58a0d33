use std::{io, time::Duration};

use thiserror::Error;

/// Errors raised by the cluster protocol.
///
/// Timeouts inside a broadcast round are not errors: a slot that misses its
/// deadline contributes `None` to the gathered results. `Timeout` only
/// surfaces from point-to-point calls made outside a round.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or mismatched partition/table, or a lookup before setup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The peer is gone. Distinguished from the peer returning an error so
    /// the coordinator can drop the link for the rest of the session.
    #[error("peer disconnected: {0}")]
    Disconnected(String),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("transform failed: {0}")]
    TransformFailure(String),
    #[error("invalid resolution stride {0}, must be >= 1")]
    InvalidResolution(i64),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("message length overflowed")]
    MessageLengthOverflowed,
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("io: {0}")]
    Io(io::Error),
    #[cfg(feature = "quic")]
    #[error("connect: {0}")]
    Connect(quinn::ConnectError),
    #[cfg(feature = "quic")]
    #[error("tls: {0}")]
    Tls(rustls::Error),
    #[cfg(feature = "quic")]
    #[error("certificate: {0}")]
    Certificate(rcgen::RcgenError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Returns true if this error means the remote end is unreachable for
    /// good, as opposed to having answered with a failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Returns true for out-of-memory conditions that may succeed after a
    /// reclamation pass.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::Disconnected(e.to_string()),
            _ => Self::Io(e),
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(e: std::collections::TryReserveError) -> Self {
        Self::ResourceExhausted(e.to_string())
    }
}

#[cfg(feature = "quic")]
mod quic {
    use quinn::{
        ConnectError, ConnectionError, ReadError, ReadExactError,
        ReadToEndError, WriteError,
    };

    use super::Error;

    impl From<ConnectError> for Error {
        fn from(error: ConnectError) -> Self {
            match error {
                ConnectError::EndpointStopping => {
                    Error::Disconnected("endpoint stopping".into())
                }
                other => Error::Connect(other),
            }
        }
    }

    // every connection-level failure means the peer is gone
    impl From<ConnectionError> for Error {
        fn from(error: ConnectionError) -> Self {
            Error::Disconnected(error.to_string())
        }
    }

    impl From<WriteError> for Error {
        fn from(error: WriteError) -> Self {
            match error {
                WriteError::ConnectionLost(e) => e.into(),
                other => Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    other,
                )),
            }
        }
    }

    impl From<ReadError> for Error {
        fn from(error: ReadError) -> Self {
            match error {
                ReadError::ConnectionLost(e) => e.into(),
                other => Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    other,
                )),
            }
        }
    }

    impl From<ReadExactError> for Error {
        fn from(error: ReadExactError) -> Self {
            match error {
                ReadExactError::ReadError(e) => e.into(),
                ReadExactError::FinishedEarly => Error::CouldNotDecodeMessage,
            }
        }
    }

    impl From<ReadToEndError> for Error {
        fn from(error: ReadToEndError) -> Self {
            match error {
                ReadToEndError::Read(e) => e.into(),
                ReadToEndError::TooLong => Error::MessageLengthOverflowed,
            }
        }
    }

    impl From<rustls::Error> for Error {
        fn from(error: rustls::Error) -> Self {
            Error::Tls(error)
        }
    }

    impl From<rcgen::RcgenError> for Error {
        fn from(error: rcgen::RcgenError) -> Self {
            Error::Certificate(error)
        }
    }
}
