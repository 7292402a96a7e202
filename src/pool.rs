//! The pool of upstream servers.
//!
//! A [`ServerPool`] keeps the ordered list of configured resolver
//! addresses and, per address, the one long-lived socket all queries to
//! that server share. Sockets are opened lazily on first use and stay
//! open until they are retired, either explicitly or automatically after
//! too many consecutive failures. The address itself stays on the list
//! when its socket goes; the next request simply opens a fresh one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::base::{normalize_name, Question, Rtype, ServerAddress};
use crate::codec::Codec;
use crate::conf::ResolvConf;
use crate::dispatch::{Dispatcher, EncodedQuery, Transport};
use crate::error::Error;
use crate::ident::IdAllocator;
use crate::net::AsyncBind;

//------------ ServerPool ----------------------------------------------------

/// The ordered upstream servers and their sockets.
pub struct ServerPool<C, B: AsyncBind> {
    /// The servers in the order they are tried.
    servers: RwLock<Vec<ServerAddress>>,

    /// The open sockets, at most one per address.
    entries: RwLock<HashMap<ServerAddress, PoolEntry<B::Socket>>>,

    /// Serializes socket creation.
    ///
    /// Concurrent callers asking for the same address end up observing
    /// the one socket the first of them opened.
    open_lock: tokio::sync::Mutex<()>,

    /// Creates the sockets.
    binder: B,

    /// The dispatcher receiving each socket once bound.
    dispatcher: Arc<Dispatcher<C>>,

    /// Consecutive failures before a socket is retired. Zero disables
    /// automatic retirement.
    retire_threshold: u32,
}

impl<C: Codec, B: AsyncBind> ServerPool<C, B> {
    /// Creates a pool seeded with the configured servers.
    pub fn new(
        conf: &ResolvConf,
        binder: B,
        dispatcher: Arc<Dispatcher<C>>,
    ) -> Self {
        ServerPool {
            servers: RwLock::new(conf.servers.clone()),
            entries: RwLock::new(HashMap::new()),
            open_lock: tokio::sync::Mutex::new(()),
            binder,
            dispatcher,
            retire_threshold: conf.retire_threshold,
        }
    }

    /// Appends a server unless it is already listed.
    pub fn add(&self, addr: ServerAddress) -> bool {
        let mut servers = self.servers.write();
        if servers.contains(&addr) {
            false
        } else {
            servers.push(addr);
            true
        }
    }

    /// Removes a server from the list.
    ///
    /// An open socket for the address is left alone; queries already
    /// routed to it finish normally.
    pub fn remove(&self, addr: ServerAddress) -> bool {
        let mut servers = self.servers.write();
        match servers.iter().position(|&listed| listed == addr) {
            Some(index) => {
                servers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns the server at the given position.
    pub fn get(&self, index: usize) -> Option<ServerAddress> {
        self.servers.read().get(index).copied()
    }

    /// Returns the first server on the list.
    pub fn primary(&self) -> Option<ServerAddress> {
        self.get(0)
    }

    /// Returns the current server list.
    pub fn snapshot(&self) -> Vec<ServerAddress> {
        self.servers.read().clone()
    }

    /// Returns the number of listed servers.
    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    /// Returns whether the server list is empty.
    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Returns the transport for a server, opening its socket if needed.
    pub async fn socket_for(
        &self,
        addr: ServerAddress,
    ) -> Result<Arc<Transport<B::Socket>>, Error> {
        if let Some(transport) = self.lookup_socket(addr) {
            return Ok(transport);
        }
        let _open = self.open_lock.lock().await;
        if let Some(transport) = self.lookup_socket(addr) {
            return Ok(transport);
        }
        let sock = self
            .binder
            .bind(addr.socket_addr())
            .await
            .map_err(Error::transport)?;
        let transport = self.dispatcher.attach(sock, addr);
        self.entries.write().insert(
            addr,
            PoolEntry {
                transport: transport.clone(),
                last_used: Mutex::new(Instant::now()),
                failures: AtomicU32::new(0),
            },
        );
        debug!(server = %addr, "opened server socket");
        Ok(transport)
    }

    /// Returns the open transport for an address, if there is one.
    fn lookup_socket(
        &self,
        addr: ServerAddress,
    ) -> Option<Arc<Transport<B::Socket>>> {
        let entries = self.entries.read();
        entries.get(&addr).map(|entry| {
            *entry.last_used.lock() = Instant::now();
            entry.transport.clone()
        })
    }

    /// Returns whether the address currently has an open socket.
    pub fn has_socket(&self, addr: ServerAddress) -> bool {
        self.entries.read().contains_key(&addr)
    }

    /// Returns when the address's socket was last handed out.
    pub fn last_used(&self, addr: ServerAddress) -> Option<Instant> {
        self.entries
            .read()
            .get(&addr)
            .map(|entry| *entry.last_used.lock())
    }

    /// Closes the socket for an address.
    ///
    /// All queries pending on it fail with [`Error::ServerRetired`]. The
    /// address keeps its place on the server list.
    pub fn retire(&self, addr: ServerAddress) -> bool {
        let entry = self.entries.write().remove(&addr);
        match entry {
            Some(entry) => {
                entry.transport.shutdown();
                true
            }
            None => false,
        }
    }

    /// Notes a timeout or transport error on a server.
    ///
    /// Reaching the configured threshold retires the socket.
    pub fn record_failure(&self, addr: ServerAddress) {
        if self.retire_threshold == 0 {
            return;
        }
        let retire = {
            let entries = self.entries.read();
            match entries.get(&addr) {
                Some(entry) => {
                    entry.failures.fetch_add(1, Ordering::SeqCst) + 1
                        >= self.retire_threshold
                }
                None => false,
            }
        };
        if retire {
            debug!(
                server = %addr,
                "retiring server socket after repeated failures"
            );
            self.retire(addr);
        }
    }

    /// Notes a successful exchange with a server.
    pub fn record_success(&self, addr: ServerAddress) {
        if let Some(entry) = self.entries.read().get(&addr) {
            entry.failures.store(0, Ordering::SeqCst);
        }
    }

    /// Returns the consecutive failure count for a server's socket.
    pub fn failures(&self, addr: ServerAddress) -> u32 {
        self.entries
            .read()
            .get(&addr)
            .map(|entry| entry.failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Checks that a server actually answers queries.
    ///
    /// Sends an A query for the canary name and waits out the given
    /// timeout. A server that fails the check has its socket retired so a
    /// later attempt starts from a clean slate.
    pub async fn validate(
        &self,
        addr: ServerAddress,
        canary: &str,
        ids: &IdAllocator,
        timeout: Duration,
    ) -> bool {
        let name = match normalize_name(canary) {
            Ok(name) => name,
            Err(_) => return false,
        };
        match self.validate_query(addr, name, ids, timeout).await {
            Ok(true) => true,
            Ok(false) | Err(_) => {
                warn!(server = %addr, "server failed validation");
                self.retire(addr);
                false
            }
        }
    }

    /// Runs the canary query against a server.
    ///
    /// An ID collision is retried once with a fresh ID before it
    /// surfaces, like any other submission.
    async fn validate_query(
        &self,
        addr: ServerAddress,
        name: String,
        ids: &IdAllocator,
        timeout: Duration,
    ) -> Result<bool, Error> {
        let transport = self.socket_for(addr).await?;
        let deadline = Instant::now() + timeout;
        let mut retried = false;
        loop {
            let id = ids.allocate();
            let bytes = self
                .dispatcher
                .codec()
                .encode(&Question {
                    id,
                    name: name.clone(),
                    rtype: Rtype::A,
                })
                .map_err(|_| Error::InvalidName)?;
            let handle = match self
                .dispatcher
                .submit(
                    &transport,
                    EncodedQuery {
                        id,
                        rtype: Rtype::A,
                        bytes,
                    },
                    deadline,
                )
                .await
            {
                Ok(handle) => handle,
                Err(Error::IdCollision) if !retried => {
                    retried = true;
                    continue;
                }
                Err(err) => return Err(err),
            };
            return Ok(handle
                .await
                .map(|win| !win.records.is_empty())
                .unwrap_or(false));
        }
    }
}

impl<C, B: AsyncBind> fmt::Debug for ServerPool<C, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPool")
            .field("servers", &*self.servers.read())
            .finish_non_exhaustive()
    }
}

//------------ PoolEntry -----------------------------------------------------

/// The pool's state for one server with an open socket.
struct PoolEntry<S> {
    /// The socket and its pending queries.
    transport: Arc<Transport<S>>,

    /// When the socket was last handed out.
    last_used: Mutex<Instant>,

    /// Consecutive failures since the last success.
    failures: AtomicU32,
}
