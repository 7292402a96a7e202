//! The interface to the wire-format codec.
//!
//! The core does not read or write RFC 1035 wire format itself. It hands a
//! [`Question`] to a [`Codec`] for serialization and gets a [`Response`]
//! back for every datagram that parses. Queries produced by implementations
//! are expected to carry a single question with the RD bit set and no
//! additional records; responses only need their answer section decoded
//! into typed records.

use std::{error, fmt};

use bytes::Bytes;

use crate::base::{Question, Response};

//------------ Codec ---------------------------------------------------------

/// Encodes queries and decodes responses.
pub trait Codec: Send + Sync + 'static {
    /// Encodes a query for the given question.
    fn encode(&self, question: &Question) -> Result<Bytes, WireError>;

    /// Decodes a response from a received datagram.
    ///
    /// Packets larger than the classic 512 octet limit are passed in
    /// unchanged; whether they parse is the implementation's call.
    fn decode(&self, octets: &[u8]) -> Result<Response, WireError>;
}

//------------ WireError -----------------------------------------------------

/// A codec failed to encode a query or decode a response.
///
/// Decode failures never surface to callers of the resolver; the offending
/// packet is logged and dropped.
#[derive(Clone, Debug)]
pub struct WireError(&'static str);

impl WireError {
    /// Creates a new error with a static description.
    pub fn new(msg: &'static str) -> Self {
        WireError(msg)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl error::Error for WireError {}
