//! An asynchronous DNS stub resolver core.
//!
//! A stub resolver forwards every question to a recursive upstream server
//! rather than walking the DNS tree itself. This crate implements the
//! lifecycle of such queries atop the [Tokio](https://tokio.rs/) async
//! runtime: one long-lived UDP socket per upstream server shared by all
//! queries to it, message-ID based demultiplexing of responses, timeouts
//! with failover across servers, races between several record types where
//! the first real answer wins, and a TTL-bounded cache of prior answers.
//!
//! What the crate deliberately does not do is speak the DNS wire format.
//! Encoding queries and decoding responses is the business of a [`Codec`]
//! implementation supplied by the application. Likewise, reading the
//! operating system's resolver configuration is left to a
//! [`SystemServers`] collaborator; the crate merely validates and merges
//! whatever nameservers it is handed.
//!
//! The entry point is [`StubResolver`]. It is configured through
//! [`ResolvConf`], starts out with a set of well-known public resolvers,
//! and hands out typed lookups for host addresses, mail exchanges,
//! service, text, and name records, as well as reverse lookups from an
//! address back to its names.
//!
//! # Example
//!
//! ```ignore
//! let resolver = StubResolver::new(MyCodec);
//! let addrs = resolver.resolve4("example.com").await?;
//! ```

pub use self::base::{
    Mx, Question, Rcode, Record, RecordData, Response, Rtype,
    ServerAddress, Srv,
};
pub use self::codec::{Codec, WireError};
pub use self::conf::{ResolvConf, SystemServers, REQUEST_TIMEOUT};
pub use self::error::Error;
pub use self::lookup::{reverse_name, Family};
pub use self::resolver::StubResolver;

pub mod base;
pub mod cache;
pub mod codec;
pub mod conf;
pub mod dispatch;
pub mod error;
pub mod ident;
pub mod lookup;
pub mod net;
pub mod pool;
pub mod resolver;
