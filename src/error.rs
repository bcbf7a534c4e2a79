use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

/// A convenience wrapper around `Result` for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Set of errors that can occur on the link and in connection handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening the capture channel on the interface failed.
    #[error("link open: {0}")]
    LinkOpen(io::Error),
    /// No ARP reply from the gateway within the discovery deadline.
    #[error("no ARP reply from gateway within {0:?}")]
    ArpTimeout(Duration),
    /// An ARP reply addressed to us came from an unexpected sender.
    #[error("ARP reply from unexpected sender {0}")]
    ArpBadReply(Ipv4Addr),
    /// Handing a frame to the link driver failed.
    #[error("link send: {0}")]
    Send(io::Error),
    /// The flow tuple is already registered.
    #[error("flow tuple already registered")]
    TupleInUse,
    /// Read or write on a finished connection.
    #[error("connection closed")]
    Closed,
    /// An inbound segment fell outside the advertised receive window.
    #[error("segment outside receive window")]
    OutOfWindow,
    /// A read blocked past its deadline.
    #[error("read deadline exceeded")]
    DeadlineExceeded,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::Closed => io::ErrorKind::ConnectionAborted,
            Error::DeadlineExceeded => io::ErrorKind::TimedOut,
            Error::Send(ref e) | Error::LinkOpen(ref e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
