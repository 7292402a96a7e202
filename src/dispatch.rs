//! The query dispatcher.
//!
//! A [`Dispatcher`] multiplexes many concurrent queries over the long-lived
//! socket of each server. Submitting a query registers a pending entry
//! under the query's message ID, sends the encoded datagram, and arms a
//! deadline; the per-socket receive task matches incoming responses back
//! to their entries by ID. Multi-type submissions register one entry per
//! query but share a single completion: the first response with matching
//! records wins and the sibling entries are cancelled.
//!
//! A pending entry goes through exactly one terminal transition: response
//! matched, deadline expired, send failed, cancelled, or server retired.
//! Anything arriving after that, a late response in particular, is dropped.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, trace};

use crate::base::{Rcode, Record, Rtype, ServerAddress};
use crate::codec::Codec;
use crate::error::Error;
use crate::net::{AsyncDgramRecvEx, AsyncDgramSendEx, DgramSocket};

/// Size of the receive buffer handed to the socket.
///
/// Large enough for EDNS-sized responses; the codec decides what parses.
const RECV_SIZE: usize = 2_000;

//------------ Dispatcher ----------------------------------------------------

/// Multiplexes queries over per-server sockets.
pub struct Dispatcher<C> {
    /// The codec decoding every received datagram.
    codec: Arc<C>,
}

impl<C: Codec> Dispatcher<C> {
    /// Creates a new dispatcher.
    pub fn new(codec: impl Into<Arc<C>>) -> Self {
        Dispatcher {
            codec: codec.into(),
        }
    }

    /// Returns the codec.
    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// Takes ownership of a freshly bound socket.
    ///
    /// Spawns the socket's receive and expiry tasks and returns the
    /// transport later submissions go through. The transport keeps the
    /// socket open until [`Transport::shutdown`] or drop.
    pub fn attach<S: DgramSocket>(
        &self,
        sock: S,
        server: ServerAddress,
    ) -> Arc<Transport<S>> {
        let sock = Arc::new(sock);
        let pending = Arc::new(Mutex::new(PendingTable::new()));
        let notify = Arc::new(Notify::new());
        let tasks = vec![
            tokio::spawn(recv_loop(
                self.codec.clone(),
                sock.clone(),
                pending.clone(),
                server,
            )),
            tokio::spawn(expire_loop(pending.clone(), notify.clone())),
        ];
        Arc::new(Transport {
            server,
            sock,
            pending,
            notify,
            open: AtomicBool::new(true),
            tasks,
        })
    }

    /// Submits a single encoded query.
    ///
    /// Fails with [`Error::IdCollision`] if the query's ID is already in
    /// flight on this transport; the caller is expected to allocate a new
    /// ID and retry once.
    pub async fn submit<S: DgramSocket>(
        &self,
        transport: &Transport<S>,
        query: EncodedQuery,
        deadline: Instant,
    ) -> Result<QueryHandle, Error> {
        self.submit_multi(transport, vec![query], deadline).await
    }

    /// Submits several queries racing for one answer.
    ///
    /// All entries share a single handle. The first response whose records
    /// match its query's type completes the handle and cancels the
    /// siblings; negative responses only complete it once no sibling can
    /// still produce records. The handle times out only after every entry
    /// has passed the deadline.
    pub async fn submit_multi<S: DgramSocket>(
        &self,
        transport: &Transport<S>,
        queries: Vec<EncodedQuery>,
        deadline: Instant,
    ) -> Result<QueryHandle, Error> {
        if queries.is_empty() {
            return Err(Error::Empty);
        }
        if !transport.is_open() {
            return Err(Error::ServerRetired);
        }
        let (tx, rx) = oneshot::channel();
        let race = Arc::new(RaceShared {
            ids: queries.iter().map(|query| query.id).collect(),
            inner: Mutex::new(RaceInner {
                sink: Some(tx),
                outstanding: queries.len(),
                negative: None,
                error: None,
            }),
        });
        {
            let mut pending = transport.pending.lock();
            for query in &queries {
                if pending.map.contains_key(&query.id) {
                    return Err(Error::IdCollision);
                }
            }
            for query in &queries {
                let seq = pending.next_seq;
                pending.next_seq += 1;
                pending.map.insert(
                    query.id,
                    PendingEntry {
                        rtype: query.rtype,
                        seq,
                        race: race.clone(),
                    },
                );
                pending.deadlines.push(Reverse((deadline, seq, query.id)));
            }
        }
        transport.notify.notify_one();
        let handle = QueryHandle {
            rx,
            guard: RaceGuard {
                pending: Arc::downgrade(&transport.pending),
                race: race.clone(),
            },
        };
        for query in &queries {
            let err = match transport.sock.send(&query.bytes).await {
                Ok(len) if len == query.bytes.len() => continue,
                Ok(_) => io::Error::from(io::ErrorKind::WriteZero),
                Err(err) => err,
            };
            trace!(
                server = %transport.server, id = query.id, error = %err,
                "query send failed"
            );
            let mut pending = transport.pending.lock();
            if let Some(entry) = pending.map.get(&query.id) {
                if Arc::ptr_eq(&entry.race, &race) {
                    pending.map.remove(&query.id);
                    settle_err(&race, Error::transport(err));
                }
            }
        }
        Ok(handle)
    }
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Dispatcher {
            codec: self.codec.clone(),
        }
    }
}

impl<C> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

//------------ EncodedQuery --------------------------------------------------

/// One wire-ready query as the dispatcher wants it.
#[derive(Clone, Debug)]
pub struct EncodedQuery {
    /// The message ID encoded in the query.
    pub id: u16,

    /// The record type the query asks for.
    pub rtype: Rtype,

    /// The encoded query.
    pub bytes: Bytes,
}

//------------ RaceWin -------------------------------------------------------

/// The outcome of a settled submission.
///
/// An empty record list is a negative answer, NXDOMAIN or NoData
/// depending on `rcode`.
#[derive(Clone, Debug)]
pub struct RaceWin {
    /// The record type that answered.
    pub rtype: Rtype,

    /// The response code of the answering response.
    pub rcode: Rcode,

    /// The matching records of the answer.
    pub records: Vec<Record>,
}

//------------ Transport -----------------------------------------------------

/// One server's socket together with its pending queries.
pub struct Transport<S> {
    /// The server the socket is connected to.
    server: ServerAddress,

    /// The socket itself.
    sock: Arc<S>,

    /// Queries in flight on this socket, keyed by message ID.
    pending: Arc<Mutex<PendingTable>>,

    /// Wakes the expiry task after a new deadline was armed.
    notify: Arc<Notify>,

    /// Cleared once the transport was shut down.
    open: AtomicBool,

    /// The receive and expiry tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<S> Transport<S> {
    /// Returns the server this transport is connected to.
    pub fn server(&self) -> ServerAddress {
        self.server
    }

    /// Returns whether the transport still accepts submissions.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Returns the number of queries currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().map.len()
    }

    /// Shuts the transport down.
    ///
    /// Every pending query fails with [`Error::ServerRetired`] and the
    /// socket's tasks stop. Idempotent.
    pub fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        let mut pending = self.pending.lock();
        pending.deadlines.clear();
        let entries: Vec<_> = pending.map.drain().collect();
        debug!(
            server = %self.server, in_flight = entries.len(),
            "transport retired"
        );
        for (_, entry) in entries {
            settle_err(&entry.race, Error::ServerRetired);
        }
    }
}

impl<S> Drop for Transport<S> {
    fn drop(&mut self) {
        self.shutdown()
    }
}

impl<S> fmt::Debug for Transport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("server", &self.server)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

//------------ QueryHandle ---------------------------------------------------

/// A submission in progress.
///
/// Completes once with the settled outcome. Dropping the handle cancels
/// the submission: its pending entries are removed promptly and responses
/// that still arrive for them are dropped. Cancellation does not close
/// the underlying socket.
#[derive(Debug)]
pub struct QueryHandle {
    /// Receives the settled outcome.
    rx: oneshot::Receiver<Result<RaceWin, Error>>,

    /// Cleans up the pending entries when the handle goes away.
    guard: RaceGuard,
}

impl QueryHandle {
    /// Cancels the submission.
    pub fn cancel(self) {
        drop(self)
    }
}

impl Future for QueryHandle {
    type Output = Result<RaceWin, Error>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let me = self.get_mut();
        match Pin::new(&mut me.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

//------------ RaceGuard -----------------------------------------------------

/// Removes a race's pending entries when its handle is dropped.
#[derive(Debug)]
struct RaceGuard {
    /// The pending table holding the entries.
    pending: Weak<Mutex<PendingTable>>,

    /// The race being guarded.
    race: Arc<RaceShared>,
}

impl Drop for RaceGuard {
    fn drop(&mut self) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        let mut pending = pending.lock();
        {
            let mut inner = self.race.inner.lock();
            inner.sink = None;
            inner.outstanding = 0;
        }
        for &id in &self.race.ids {
            if let Some(entry) = pending.map.get(&id) {
                if Arc::ptr_eq(&entry.race, &self.race) {
                    pending.map.remove(&id);
                }
            }
        }
    }
}

//------------ PendingTable --------------------------------------------------

/// The pending queries of a single socket.
struct PendingTable {
    /// Entries keyed by message ID.
    map: HashMap<u16, PendingEntry>,

    /// Armed deadlines, earliest first.
    ///
    /// Entries that settle early leave stale keys behind; the expiry task
    /// skips them by comparing sequence numbers.
    deadlines: BinaryHeap<Reverse<(Instant, u64, u16)>>,

    /// Distinguishes reused message IDs in the deadline heap.
    next_seq: u64,
}

impl PendingTable {
    /// Creates an empty table.
    fn new() -> Self {
        PendingTable {
            map: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

//------------ PendingEntry --------------------------------------------------

/// A single in-flight query.
struct PendingEntry {
    /// The record type the query asked for.
    rtype: Rtype,

    /// Matches the entry to its key in the deadline heap.
    seq: u64,

    /// The race this entry belongs to.
    race: Arc<RaceShared>,
}

//------------ RaceShared ----------------------------------------------------

/// State shared by the sibling entries of one submission.
struct RaceShared {
    /// The message IDs of all siblings.
    ids: Vec<u16>,

    /// The mutable race state.
    ///
    /// Locked strictly after the pending table where both are held.
    inner: Mutex<RaceInner>,
}

impl fmt::Debug for RaceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceShared")
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

/// The mutable part of a race.
struct RaceInner {
    /// Completes the handle. Taken by the first terminal transition.
    sink: Option<oneshot::Sender<Result<RaceWin, Error>>>,

    /// Siblings that have not reached a terminal state yet.
    outstanding: usize,

    /// A sibling's negative answer, kept in case nobody wins.
    negative: Option<(Rtype, Rcode)>,

    /// The error to surface if every sibling fails.
    ///
    /// Timeouts never overwrite a more telling error.
    error: Option<Error>,
}

//------------ Settling ------------------------------------------------------

/// Completes a race with a winning answer and drops its siblings.
///
/// The caller holds the pending table lock and has removed the winning
/// entry already.
fn settle_win(
    pending: &mut PendingTable,
    race: &Arc<RaceShared>,
    win: RaceWin,
) {
    let sink = {
        let mut inner = race.inner.lock();
        let Some(sink) = inner.sink.take() else {
            return;
        };
        inner.outstanding = 0;
        sink
    };
    let _ = sink.send(Ok(win));
    for &id in &race.ids {
        if let Some(entry) = pending.map.get(&id) {
            if Arc::ptr_eq(&entry.race, race) {
                pending.map.remove(&id);
            }
        }
    }
}

/// Records a sibling's negative answer.
///
/// Completes the race with an empty answer once no sibling is left that
/// could still produce records.
fn settle_empty(race: &Arc<RaceShared>, rtype: Rtype, rcode: Rcode) {
    let mut inner = race.inner.lock();
    if inner.sink.is_none() {
        return;
    }
    if inner.negative.is_none() {
        inner.negative = Some((rtype, rcode));
    }
    inner.outstanding -= 1;
    if inner.outstanding == 0 {
        finish(&mut inner);
    }
}

/// Records a sibling's failure, completing the race if it was the last.
fn settle_err(race: &Arc<RaceShared>, err: Error) {
    let mut inner = race.inner.lock();
    if inner.sink.is_none() {
        return;
    }
    if !matches!(err, Error::Timeout) {
        inner.error = Some(err);
    }
    inner.outstanding -= 1;
    if inner.outstanding == 0 {
        finish(&mut inner);
    }
}

/// Completes a race whose last sibling just went terminal without a win.
///
/// A recorded negative answer beats an error; among errors, the most
/// recent non-timeout one is surfaced, with a plain timeout as the
/// fallback.
fn finish(inner: &mut RaceInner) {
    let Some(sink) = inner.sink.take() else {
        return;
    };
    let result = match inner.negative {
        Some((rtype, rcode)) => Ok(RaceWin {
            rtype,
            rcode,
            records: Vec::new(),
        }),
        None => Err(inner.error.take().unwrap_or(Error::Timeout)),
    };
    let _ = sink.send(result);
}

//------------ Socket tasks --------------------------------------------------

/// Receives datagrams and matches them to pending queries.
async fn recv_loop<C: Codec, S: DgramSocket>(
    codec: Arc<C>,
    sock: Arc<S>,
    pending: Arc<Mutex<PendingTable>>,
    server: ServerAddress,
) {
    let mut buf = vec![0u8; RECV_SIZE];
    loop {
        match sock.recv(&mut buf).await {
            Ok(len) => on_receive(&*codec, server, &pending, &buf[..len]),
            Err(err) => {
                debug!(%server, error = %err, "datagram receive failed");
                sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Handles one received datagram.
fn on_receive<C: Codec>(
    codec: &C,
    server: ServerAddress,
    pending: &Mutex<PendingTable>,
    octets: &[u8],
) {
    let response = match codec.decode(octets) {
        Ok(response) => response,
        Err(err) => {
            trace!(%server, error = %err, "dropping malformed response");
            return;
        }
    };
    let mut pending = pending.lock();
    let entry = match pending.map.remove(&response.id) {
        Some(entry) => entry,
        None => {
            trace!(
                %server, id = response.id,
                "dropping response without a pending query"
            );
            return;
        }
    };
    if response.truncated {
        settle_err(&entry.race, Error::Truncated);
        return;
    }
    if response.rcode == Rcode::NOERROR || response.rcode == Rcode::NXDOMAIN
    {
        let records: Vec<Record> = response
            .answers
            .into_iter()
            .filter(|record| record.rtype == entry.rtype)
            .collect();
        if records.is_empty() {
            settle_empty(&entry.race, entry.rtype, response.rcode);
        } else {
            settle_win(
                &mut pending,
                &entry.race,
                RaceWin {
                    rtype: entry.rtype,
                    rcode: response.rcode,
                    records,
                },
            );
        }
    } else {
        settle_err(&entry.race, Error::ServerFailed(response.rcode));
    }
}

/// Fails queries whose deadline has passed.
async fn expire_loop(
    pending: Arc<Mutex<PendingTable>>,
    notify: Arc<Notify>,
) {
    loop {
        let next = {
            let mut pending = pending.lock();
            loop {
                let (at, seq, id) = match pending.deadlines.peek() {
                    None => break None,
                    Some(&Reverse(key)) => key,
                };
                if at > Instant::now() {
                    break Some(at);
                }
                pending.deadlines.pop();
                let live = matches!(
                    pending.map.get(&id), Some(entry) if entry.seq == seq
                );
                if live {
                    let entry = pending
                        .map
                        .remove(&id)
                        .expect("the entry was just seen");
                    settle_err(&entry.race, Error::Timeout);
                }
            }
        };
        match next {
            None => notify.notified().await,
            Some(at) => {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    _ = notify.notified() => {}
                }
            }
        }
    }
}
