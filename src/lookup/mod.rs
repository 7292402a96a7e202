//! High-level lookups.
//!
//! The functions in this module turn the raw query machinery into the
//! lookups applications actually want: host addresses by family and
//! reverse lookups from an address back to its names. They are also
//! available as methods on [`StubResolver`][crate::resolver::StubResolver].

pub mod addr;
pub mod host;

pub use self::addr::{lookup_addr, reverse_name};
pub use self::host::{lookup_host, Family};
