use thiserror::Error;

/// Errors produced while decoding, validating, or exchanging NTP messages.
///
/// Every per-datagram error is recovered locally by the caller (logged and
/// the datagram dropped) — see `node.rs`. None of these propagate out of
/// the event loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NtpError {
    #[error("invalid NTP message format: {0}")]
    InvalidFormat(&'static str),

    #[error("bogus response: {0}")]
    BogusResponse(&'static str),

    #[error("unsynchronized response")]
    UnsynchronizedResponse,

    #[error("unsupported timescale")]
    UnsupportedTimescale,

    #[error("transient I/O error: {0}")]
    TransientIoError(String),
}

impl From<std::io::Error> for NtpError {
    fn from(e: std::io::Error) -> Self {
        NtpError::TransientIoError(e.to_string())
    }
}
