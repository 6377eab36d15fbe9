use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

/// Crate-wide error taxonomy.
///
/// Variants that concern a particular transaction, dialog or peer carry the
/// identifying context along so callers can log or route on it.
#[derive(Debug)]
pub enum Error {
    Error(String),
    /// A request failed to parse.
    BadRequest(String),
    /// A response failed to parse.
    BadResponse(String),
    /// The UAC target set was exhausted before a single attempt was made.
    NoDestinations,
    /// Cancellation was requested for an unknown request id.
    NoRequest,
    /// Timer B/F/H expired before a final response.
    Timeout(TransactionKey),
    TransactionError(String, TransactionKey),
    TransportLayerError(String, SipAddr),
    DnsResolutionError(String),
    DialogError(String, DialogId),
    /// The request method is not in the UAS Allow set.
    MethodNotAllowed(String),
    /// A merged request was detected per RFC 3261 section 8.2.2.2.
    LoopDetected,
    /// Require lists extensions the UAS does not support.
    BadExtension(Vec<String>),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Error(msg) => write!(f, "{}", msg),
            Error::BadRequest(msg) => write!(f, "bad request: {}", msg),
            Error::BadResponse(msg) => write!(f, "bad response: {}", msg),
            Error::NoDestinations => write!(f, "no destinations to try"),
            Error::NoRequest => write!(f, "no matching request"),
            Error::Timeout(key) => write!(f, "transaction timeout: {}", key),
            Error::TransactionError(msg, key) => write!(f, "transaction {}: {}", key, msg),
            Error::TransportLayerError(msg, addr) => write!(f, "transport {}: {}", addr, msg),
            Error::DnsResolutionError(msg) => write!(f, "dns resolution: {}", msg),
            Error::DialogError(msg, id) => write!(f, "dialog {}: {}", id, msg),
            Error::MethodNotAllowed(method) => write!(f, "method not allowed: {}", method),
            Error::LoopDetected => write!(f, "loop detected"),
            Error::BadExtension(exts) => write!(f, "bad extension: {}", exts.join(", ")),
            Error::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
