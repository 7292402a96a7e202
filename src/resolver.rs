//! The stub resolver.
//!
//! A [`StubResolver`] ties the pieces of the crate together: it normalizes
//! lookup names, consults the cache, encodes queries through the codec,
//! submits them to the dispatcher over pooled sockets, and fails over
//! between servers. Values clone cheaply; everything of substance sits
//! behind an arc, so a resolver can be handed to as many tasks as needed.
//!
//! The resolver never resolves recursively itself. It forwards every
//! question to the configured upstream servers and expects those to do
//! the heavy lifting.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::mpsc;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::base::{
    normalize_name, Mx, Question, Record, RecordData, Rtype, ServerAddress,
    Srv,
};
use crate::cache::ResourceCache;
use crate::codec::Codec;
use crate::conf::{ResolvConf, SystemServers};
use crate::dispatch::{Dispatcher, EncodedQuery, RaceWin};
use crate::error::Error;
use crate::ident::IdAllocator;
use crate::lookup::addr::lookup_addr;
use crate::lookup::host::{lookup_host, Family};
use crate::net::{AsyncBind, UdpBinder};
use crate::pool::ServerPool;

//------------ StubResolver --------------------------------------------------

/// A DNS stub resolver.
///
/// The resolver is generic over the wire codec and, mostly for testing,
/// over the way sockets are created. [`StubResolver::new`] gives a
/// resolver using real UDP sockets and the default configuration.
pub struct StubResolver<C: Codec, B: AsyncBind = UdpBinder>(
    Arc<Inner<C, B>>,
);

/// The shared innards of a resolver.
struct Inner<C: Codec, B: AsyncBind> {
    /// The configuration the resolver was built with.
    conf: ResolvConf,

    /// Encodes queries; also held by the dispatcher for decoding.
    codec: Arc<C>,

    /// Routes queries over the pooled sockets.
    dispatcher: Arc<Dispatcher<C>>,

    /// The upstream servers and their sockets.
    pool: ServerPool<C, B>,

    /// Previously seen answers.
    cache: ResourceCache,

    /// Hands out message IDs.
    ids: IdAllocator,

    /// The runtime the resolver was created on, used to drive blocking
    /// validation from foreign threads.
    runtime: Option<Handle>,
}

impl<C: Codec> StubResolver<C> {
    /// Creates a resolver with the default configuration.
    pub fn new(codec: C) -> Self {
        Self::from_conf(ResolvConf::default(), codec)
    }

    /// Creates a resolver with the given configuration.
    pub fn from_conf(conf: ResolvConf, codec: C) -> Self {
        Self::with_binder(conf, codec, UdpBinder::new())
    }
}

impl<C: Codec, B: AsyncBind> StubResolver<C, B> {
    /// Creates a resolver that opens its sockets through `binder`.
    pub fn with_binder(conf: ResolvConf, codec: C, binder: B) -> Self {
        let codec = Arc::new(codec);
        let dispatcher = Arc::new(Dispatcher::new(codec.clone()));
        let pool = ServerPool::new(&conf, binder, dispatcher.clone());
        let cache =
            ResourceCache::new(conf.cache_capacity, conf.negative_ttl);
        StubResolver(Arc::new(Inner {
            codec,
            dispatcher,
            pool,
            cache,
            ids: IdAllocator::new(),
            runtime: Handle::try_current().ok(),
            conf,
        }))
    }

    /// Returns the resolver's configuration.
    pub fn conf(&self) -> &ResolvConf {
        &self.0.conf
    }

    /// Returns the server pool.
    pub fn pool(&self) -> &ServerPool<C, B> {
        &self.0.pool
    }

    /// Returns the answer cache.
    pub fn cache(&self) -> &ResourceCache {
        &self.0.cache
    }
}

/// # Managing the server list
impl<C: Codec, B: AsyncBind> StubResolver<C, B> {
    /// Appends a server unless it is already listed.
    pub fn add_server(&self, addr: ServerAddress) -> bool {
        self.0.pool.add(addr)
    }

    /// Removes a server from the list.
    pub fn remove_server(&self, addr: ServerAddress) -> bool {
        self.0.pool.remove(addr)
    }

    /// Returns the server at the given position.
    pub fn server(&self, index: usize) -> Option<ServerAddress> {
        self.0.pool.get(index)
    }

    /// Checks that a server answers queries.
    ///
    /// Resolves the configured canary name against the server with the
    /// given timeout. With no canary configured, every server passes.
    pub async fn validate(
        &self,
        addr: ServerAddress,
        timeout: Duration,
    ) -> bool {
        match &self.0.conf.canary {
            Some(canary) => {
                self.0
                    .pool
                    .validate(addr, canary, &self.0.ids, timeout)
                    .await
            }
            None => true,
        }
    }

    /// Checks that a server answers queries, blocking the caller.
    ///
    /// The check is driven on the runtime the resolver was created on;
    /// this method must be called from a thread that is not one of that
    /// runtime's workers, typically a bootstrap thread.
    pub fn validate_blocking(
        &self,
        addr: ServerAddress,
        timeout: Duration,
    ) -> bool {
        let Some(runtime) = self.0.runtime.clone() else {
            warn!(
                "resolver was created outside a runtime; \
                 cannot validate synchronously"
            );
            return false;
        };
        let resolver = self.clone();
        let (tx, rx) = mpsc::channel();
        runtime.spawn(async move {
            let _ = tx.send(resolver.validate(addr, timeout).await);
        });
        rx.recv_timeout(timeout + Duration::from_millis(500))
            .unwrap_or(false)
    }

    /// Merges the operating system's nameservers into the server list.
    ///
    /// Each entry is parsed as a bare IP address and validated against
    /// the canary name before it is appended. Returns how many servers
    /// were added.
    pub async fn add_system_servers<P: SystemServers>(
        &self,
        provider: &P,
    ) -> usize {
        let mut added = 0;
        for entry in provider.nameservers() {
            let addr: ServerAddress = match entry.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(
                        nameserver = %entry,
                        "ignoring unparseable system nameserver"
                    );
                    continue;
                }
            };
            if self.validate(addr, self.0.conf.timeout).await
                && self.0.pool.add(addr)
            {
                added += 1;
            }
        }
        added
    }
}

/// # Performing lookups
impl<C: Codec, B: AsyncBind> StubResolver<C, B> {
    /// Resolves a name into the first usable host address record.
    ///
    /// A and AAAA are queried in parallel; the first answer that carries
    /// records wins.
    pub async fn lookup(&self, name: &str) -> Result<Record, Error> {
        self.resolve_single(name, None, &[Rtype::A, Rtype::AAAA]).await
    }

    /// Resolves a name into host address records of the given family.
    pub async fn lookup_family(
        &self,
        name: &str,
        family: Family,
    ) -> Result<Vec<Record>, Error> {
        lookup_host(self, name, family).await
    }

    /// Resolves a name into the records of the first answering type.
    ///
    /// The types are raced in parallel against the given server, or the
    /// primary server if none is given. An empty list is an authoritative
    /// negative answer.
    pub async fn resolve(
        &self,
        name: &str,
        server: Option<ServerAddress>,
        types: &[Rtype],
    ) -> Result<Vec<Record>, Error> {
        Ok(self.resolve_records(name, server, types).await?.records)
    }

    /// Resolves a name into the first record of the first answering type.
    pub async fn resolve_single(
        &self,
        name: &str,
        server: Option<ServerAddress>,
        types: &[Rtype],
    ) -> Result<Record, Error> {
        self.resolve(name, server, types)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::Empty)
    }

    /// Resolves a name into its IPv4 addresses.
    pub async fn resolve4(
        &self,
        name: &str,
    ) -> Result<Vec<Ipv4Addr>, Error> {
        Ok(self
            .resolve(name, None, &[Rtype::A])
            .await?
            .into_iter()
            .filter_map(|record| match record.data {
                RecordData::A(addr) => Some(addr),
                _ => None,
            })
            .collect())
    }

    /// Resolves a name into its IPv6 addresses.
    pub async fn resolve6(
        &self,
        name: &str,
    ) -> Result<Vec<Ipv6Addr>, Error> {
        Ok(self
            .resolve(name, None, &[Rtype::AAAA])
            .await?
            .into_iter()
            .filter_map(|record| match record.data {
                RecordData::Aaaa(addr) => Some(addr),
                _ => None,
            })
            .collect())
    }

    /// Resolves a name into its mail exchanges.
    pub async fn resolve_mx(&self, name: &str) -> Result<Vec<Mx>, Error> {
        Ok(self
            .resolve(name, None, &[Rtype::MX])
            .await?
            .into_iter()
            .filter_map(|record| match record.data {
                RecordData::Mx(mx) => Some(mx),
                _ => None,
            })
            .collect())
    }

    /// Resolves a name into its service records.
    pub async fn resolve_srv(
        &self,
        name: &str,
    ) -> Result<Vec<Srv>, Error> {
        Ok(self
            .resolve(name, None, &[Rtype::SRV])
            .await?
            .into_iter()
            .filter_map(|record| match record.data {
                RecordData::Srv(srv) => Some(srv),
                _ => None,
            })
            .collect())
    }

    /// Resolves a name into its text records.
    pub async fn resolve_txt(
        &self,
        name: &str,
    ) -> Result<Vec<Vec<String>>, Error> {
        Ok(self
            .resolve(name, None, &[Rtype::TXT])
            .await?
            .into_iter()
            .filter_map(|record| match record.data {
                RecordData::Txt(txt) => Some(txt),
                _ => None,
            })
            .collect())
    }

    /// Resolves a name into its canonical name records.
    pub async fn resolve_cname(
        &self,
        name: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .resolve(name, None, &[Rtype::CNAME])
            .await?
            .into_iter()
            .filter_map(|record| match record.data {
                RecordData::Cname(name) => Some(name),
                _ => None,
            })
            .collect())
    }

    /// Resolves a name into its name server records.
    pub async fn resolve_ns(
        &self,
        name: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .resolve(name, None, &[Rtype::NS])
            .await?
            .into_iter()
            .filter_map(|record| match record.data {
                RecordData::Ns(name) => Some(name),
                _ => None,
            })
            .collect())
    }

    /// Resolves an IP address back into the names pointing at it.
    pub async fn reverse(
        &self,
        addr: IpAddr,
    ) -> Result<Vec<String>, Error> {
        lookup_addr(self, addr).await
    }
}

/// # The query pipeline
impl<C: Codec, B: AsyncBind> StubResolver<C, B> {
    /// Resolves a question, going through cache, wire and failover.
    pub(crate) async fn resolve_records(
        &self,
        name: &str,
        server: Option<ServerAddress>,
        types: &[Rtype],
    ) -> Result<RaceWin, Error> {
        let name = normalize_name(name)?;
        for &rtype in types {
            if let Some(records) = self.0.cache.get_records(&name, rtype) {
                return Ok(RaceWin {
                    rtype,
                    rcode: crate::base::Rcode::NOERROR,
                    records,
                });
            }
        }
        let candidates = self.candidates(server);
        if candidates.is_empty() {
            return Err(Error::NoServers);
        }
        let mut last_err = None;
        for addr in candidates {
            match self.attempt(&name, addr, types).await {
                Ok(win) => {
                    self.0.pool.record_success(addr);
                    self.0.cache.put(&name, win.rtype, win.records.clone());
                    return Ok(win);
                }
                Err(err) => {
                    debug!(
                        server = %addr, error = %err,
                        "query attempt failed"
                    );
                    if matches!(
                        err,
                        Error::Timeout | Error::Transport(_)
                    ) {
                        self.0.pool.record_failure(addr);
                    }
                    if err.is_transient() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    /// Runs one set of queries against one server.
    ///
    /// Allocates a fresh ID per outgoing query. An ID collision is
    /// retried once with new IDs before it surfaces.
    async fn attempt(
        &self,
        name: &str,
        addr: ServerAddress,
        types: &[Rtype],
    ) -> Result<RaceWin, Error> {
        let transport = self.0.pool.socket_for(addr).await?;
        let deadline = Instant::now() + self.0.conf.timeout;
        let mut retried = false;
        loop {
            let mut queries = Vec::with_capacity(types.len());
            for &rtype in types {
                let id = self.0.ids.allocate();
                let bytes = self
                    .0
                    .codec
                    .encode(&Question {
                        id,
                        name: name.into(),
                        rtype,
                    })
                    .map_err(|_| Error::InvalidName)?;
                queries.push(EncodedQuery { id, rtype, bytes });
            }
            match self
                .0
                .dispatcher
                .submit_multi(&transport, queries, deadline)
                .await
            {
                Ok(handle) => return handle.await,
                Err(Error::IdCollision) if !retried => retried = true,
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the servers to try, in order.
    ///
    /// Without an explicit server this is simply the pool's list. With
    /// one, the list is rotated so the wanted server goes first; a server
    /// the pool does not know is tried first with the pool's servers as
    /// fallback. At most as many servers are tried as the pool lists.
    fn candidates(
        &self,
        server: Option<ServerAddress>,
    ) -> Vec<ServerAddress> {
        let mut list = self.0.pool.snapshot();
        match server {
            None => list,
            Some(addr) => {
                match list.iter().position(|&listed| listed == addr) {
                    Some(index) => {
                        list.rotate_left(index);
                        list
                    }
                    None => {
                        let limit = list.len().max(1);
                        let mut ordered = Vec::with_capacity(limit + 1);
                        ordered.push(addr);
                        ordered.extend(list);
                        ordered.truncate(limit);
                        ordered
                    }
                }
            }
        }
    }
}

impl<C: Codec, B: AsyncBind> Clone for StubResolver<C, B> {
    fn clone(&self) -> Self {
        StubResolver(self.0.clone())
    }
}

impl<C: Codec, B: AsyncBind> fmt::Debug for StubResolver<C, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubResolver")
            .field("conf", &self.0.conf)
            .finish_non_exhaustive()
    }
}
