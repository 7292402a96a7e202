//! Resolver configuration.
//!
//! A [`ResolvConf`] collects everything the resolver needs to know before
//! it sends its first query: which upstream servers to use, how long to
//! wait for answers, and how the cache should behave. The default value
//! seeds the server list with well-known public resolvers so a resolver
//! works out of the box; servers announced by the operating system can be
//! merged in through the [`SystemServers`] collaborator.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::base::ServerAddress;

/// The time to wait for an answer from a server before moving on.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Default number of entries the cache holds before evicting.
const DEF_CACHE_CAPACITY: usize = 4_096;

/// Default time to live for negative answers, in seconds.
const DEF_NEGATIVE_TTL: u32 = 15;

/// Default name resolved when validating a server.
const DEF_CANARY: &str = "google.com";

/// Default number of consecutive failures before a socket is retired.
const DEF_RETIRE_THRESHOLD: u32 = 3;

/// The public resolvers every configuration starts out with.
const DEF_SERVERS: [Ipv4Addr; 4] = [
    // Google Public DNS.
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
    // OpenDNS.
    Ipv4Addr::new(208, 67, 222, 222),
    Ipv4Addr::new(208, 67, 220, 220),
];

//------------ ResolvConf ----------------------------------------------------

/// Resolver configuration.
#[derive(Clone, Debug)]
pub struct ResolvConf {
    /// The upstream servers in the order they are tried.
    pub servers: Vec<ServerAddress>,

    /// Timeout to wait for a response to a single query.
    ///
    /// Failing over to another server starts the timeout afresh.
    pub timeout: Duration,

    /// Number of cache entries kept before the earliest-expiring ones are
    /// evicted.
    pub cache_capacity: usize,

    /// Time to live for cached negative answers, in seconds.
    ///
    /// Setting this to zero disables negative caching.
    pub negative_ttl: u32,

    /// The name used to validate a server's reachability.
    ///
    /// `None` disables validation; [`SystemServers`] entries are then
    /// accepted unchecked.
    pub canary: Option<String>,

    /// Consecutive timeouts or transport errors before a server's socket
    /// is retired. The server is re-tried, on a fresh socket, by the next
    /// request that selects it.
    pub retire_threshold: u32,
}

impl ResolvConf {
    /// Creates a configuration with the default server list.
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for ResolvConf {
    fn default() -> Self {
        ResolvConf {
            servers: DEF_SERVERS
                .iter()
                .map(|&addr| ServerAddress::from(addr))
                .collect(),
            timeout: REQUEST_TIMEOUT,
            cache_capacity: DEF_CACHE_CAPACITY,
            negative_ttl: DEF_NEGATIVE_TTL,
            canary: Some(DEF_CANARY.into()),
            retire_threshold: DEF_RETIRE_THRESHOLD,
        }
    }
}

//------------ SystemServers -------------------------------------------------

/// Access to the nameservers the operating system is configured with.
///
/// The core does not read resolver configuration files itself. An
/// implementation of this trait supplies the nameserver addresses as
/// strings, dotted IPv4 or colon IPv6; the resolver parses and validates
/// them before appending them to its server list.
pub trait SystemServers {
    /// Returns the configured nameservers in preference order.
    fn nameservers(&self) -> Vec<String>;
}

impl SystemServers for Vec<String> {
    fn nameservers(&self) -> Vec<String> {
        self.clone()
    }
}

//============ Testing =======================================================
