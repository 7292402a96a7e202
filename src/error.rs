//! Error type for the resolver core.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

use crate::base::Rcode;

/// Error type for the resolver core.
///
/// The variants carrying an [`io::Error`] wrap it in an arc so the type
/// stays cheaply clonable.
#[derive(Clone, Debug)]
pub enum Error {
    /// The transport was dropped before the query settled.
    Closed,

    /// A single-record lookup received an answer without records.
    Empty,

    /// The message ID is already in flight on the chosen socket.
    IdCollision,

    /// An address family other than 4 or 6 was requested.
    InvalidFamily(u32),

    /// The domain name is not a valid lookup name.
    InvalidName,

    /// There are no servers to send a query to.
    NoServers,

    /// The server answered with an error code.
    ServerFailed(Rcode),

    /// The socket was retired while the query was in flight.
    ServerRetired,

    /// No answer arrived before the deadline.
    Timeout,

    /// Sending or receiving a datagram gave an error.
    Transport(Arc<io::Error>),

    /// The response was truncated.
    Truncated,
}

impl Error {
    /// Creates a transport error from an I/O error.
    pub fn transport(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }

    /// Returns whether failing over to another server can help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::Transport(_)
                | Error::ServerFailed(_)
                | Error::ServerRetired
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::Closed => write!(f, "transport closed"),
            Error::Empty => write!(f, "no records in answer"),
            Error::IdCollision => {
                write!(f, "message ID already in flight")
            }
            Error::InvalidFamily(family) => {
                write!(f, "invalid address family {}", family)
            }
            Error::InvalidName => write!(f, "invalid domain name"),
            Error::NoServers => write!(f, "no servers available"),
            Error::ServerFailed(rcode) => {
                write!(f, "server answered with {}", rcode)
            }
            Error::ServerRetired => {
                write!(f, "server retired while query was in flight")
            }
            Error::Timeout => write!(f, "timeout waiting for response"),
            Error::Transport(_) => write!(f, "datagram transport error"),
            Error::Truncated => write!(f, "response was truncated"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
