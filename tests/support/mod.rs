//! Scripted servers and a compact test codec.
//!
//! The mock network hands the resolver sockets whose peer is an in-memory
//! server. Each server is scripted per `(name, rtype)` question: it can
//! answer with records after an optional delay, answer with a bare
//! response code, hand back truncated or garbage datagrams, or stay
//! silent. All received questions are recorded for assertions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::ReadBuf;
use tokio::sync::mpsc;
use tokio::time::Duration;

use stub_resolv::net::{AsyncBind, AsyncDgramRecv, AsyncDgramSend};
use stub_resolv::{
    Codec, Question, Rcode, Record, RecordData, Response, Rtype, WireError,
};

//------------ TestCodec -----------------------------------------------------

/// A codec speaking a compact test format instead of RFC 1035 wire format.
#[derive(Clone, Copy, Debug)]
pub struct TestCodec;

impl Codec for TestCodec {
    fn encode(&self, question: &Question) -> Result<Bytes, WireError> {
        let mut buf = Vec::with_capacity(4 + question.name.len());
        buf.extend_from_slice(&question.id.to_be_bytes());
        buf.extend_from_slice(&question.rtype.0.to_be_bytes());
        buf.extend_from_slice(question.name.as_bytes());
        Ok(buf.into())
    }

    fn decode(&self, octets: &[u8]) -> Result<Response, WireError> {
        let mut parser = Parser::new(octets);
        let id = parser.u16()?;
        let rcode = Rcode(parser.u8()?);
        let truncated = parser.u8()? != 0;
        let count = parser.u8()?;
        let mut answers = Vec::with_capacity(count.into());
        for _ in 0..count {
            let rtype = Rtype(parser.u16()?);
            let ttl = parser.u32()?;
            let name_len = parser.u8()? as usize;
            let name = parser.text(name_len)?;
            let rdlen = parser.u16()? as usize;
            let rdata = parser.bytes(rdlen)?;
            let data = decode_rdata(rtype, rdata)?;
            answers.push(Record {
                name,
                rtype,
                ttl,
                data,
            });
        }
        Ok(Response {
            id,
            rcode,
            truncated,
            answers,
        })
    }
}

/// Parses a query as [`TestCodec::encode`] wrote it.
pub fn parse_query(octets: &[u8]) -> Question {
    assert!(octets.len() >= 4, "short query");
    Question {
        id: u16::from_be_bytes([octets[0], octets[1]]),
        rtype: Rtype(u16::from_be_bytes([octets[2], octets[3]])),
        name: String::from_utf8(octets[4..].into()).expect("bad query"),
    }
}

/// Encodes a response so [`TestCodec::decode`] can read it back.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&response.id.to_be_bytes());
    buf.push(response.rcode.0);
    buf.push(response.truncated as u8);
    buf.push(response.answers.len() as u8);
    for record in &response.answers {
        buf.extend_from_slice(&record.rtype.0.to_be_bytes());
        buf.extend_from_slice(&record.ttl.to_be_bytes());
        buf.push(record.name.len() as u8);
        buf.extend_from_slice(record.name.as_bytes());
        let rdata = encode_rdata(&record.data);
        buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&rdata);
    }
    buf
}

/// Encodes record data in the test format.
fn encode_rdata(data: &RecordData) -> Vec<u8> {
    match data {
        RecordData::A(addr) => addr.octets().to_vec(),
        RecordData::Aaaa(addr) => addr.octets().to_vec(),
        RecordData::Mx(mx) => {
            let mut buf = mx.preference.to_be_bytes().to_vec();
            buf.extend_from_slice(mx.exchange.as_bytes());
            buf
        }
        RecordData::Srv(srv) => {
            let mut buf = srv.priority.to_be_bytes().to_vec();
            buf.extend_from_slice(&srv.weight.to_be_bytes());
            buf.extend_from_slice(&srv.port.to_be_bytes());
            buf.extend_from_slice(srv.target.as_bytes());
            buf
        }
        RecordData::Txt(strings) => strings.join("\0").into_bytes(),
        RecordData::Cname(name)
        | RecordData::Ns(name)
        | RecordData::Ptr(name) => name.clone().into_bytes(),
    }
}

/// Decodes record data in the test format.
fn decode_rdata(
    rtype: Rtype,
    octets: &[u8],
) -> Result<RecordData, WireError> {
    fn text(octets: &[u8]) -> Result<String, WireError> {
        String::from_utf8(octets.to_vec())
            .map_err(|_| WireError::new("bad text in record data"))
    }

    match rtype {
        Rtype::A => {
            let octets: [u8; 4] = octets
                .try_into()
                .map_err(|_| WireError::new("bad A record"))?;
            Ok(RecordData::A(Ipv4Addr::from(octets)))
        }
        Rtype::AAAA => {
            let octets: [u8; 16] = octets
                .try_into()
                .map_err(|_| WireError::new("bad AAAA record"))?;
            Ok(RecordData::Aaaa(Ipv6Addr::from(octets)))
        }
        Rtype::MX => {
            if octets.len() < 2 {
                return Err(WireError::new("bad MX record"));
            }
            Ok(RecordData::Mx(stub_resolv::Mx {
                preference: u16::from_be_bytes([octets[0], octets[1]]),
                exchange: text(&octets[2..])?,
            }))
        }
        Rtype::SRV => {
            if octets.len() < 6 {
                return Err(WireError::new("bad SRV record"));
            }
            Ok(RecordData::Srv(stub_resolv::Srv {
                priority: u16::from_be_bytes([octets[0], octets[1]]),
                weight: u16::from_be_bytes([octets[2], octets[3]]),
                port: u16::from_be_bytes([octets[4], octets[5]]),
                target: text(&octets[6..])?,
            }))
        }
        Rtype::TXT => Ok(RecordData::Txt(
            text(octets)?.split('\0').map(String::from).collect(),
        )),
        Rtype::CNAME => Ok(RecordData::Cname(text(octets)?)),
        Rtype::NS => Ok(RecordData::Ns(text(octets)?)),
        Rtype::PTR => Ok(RecordData::Ptr(text(octets)?)),
        _ => Err(WireError::new("unknown record type")),
    }
}

//------------ Parser --------------------------------------------------------

/// A tiny cursor over received octets.
struct Parser<'a> {
    octets: &'a [u8],
}

impl<'a> Parser<'a> {
    fn new(octets: &'a [u8]) -> Self {
        Parser { octets }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.octets.len() < len {
            return Err(WireError::new("unexpected end of message"));
        }
        let (head, tail) = self.octets.split_at(len);
        self.octets = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let octets = self.bytes(2)?;
        Ok(u16::from_be_bytes([octets[0], octets[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let octets = self.bytes(4)?;
        Ok(u32::from_be_bytes([
            octets[0], octets[1], octets[2], octets[3],
        ]))
    }

    fn text(&mut self, len: usize) -> Result<String, WireError> {
        String::from_utf8(self.bytes(len)?.to_vec())
            .map_err(|_| WireError::new("bad text"))
    }
}

//------------ MockNet -------------------------------------------------------

/// A make-believe network of scripted servers.
#[derive(Clone, Debug, Default)]
pub struct MockNet {
    /// The servers, keyed by IP address.
    servers: Arc<Mutex<HashMap<IpAddr, Arc<MockServer>>>>,

    /// How many sockets have been bound.
    binds: Arc<AtomicUsize>,
}

impl MockNet {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the server behind an address, creating it silent.
    pub fn server(&self, addr: impl Into<IpAddr>) -> Arc<MockServer> {
        self.servers
            .lock()
            .entry(addr.into())
            .or_default()
            .clone()
    }

    /// Returns how many sockets have been bound so far.
    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

impl AsyncBind for MockNet {
    type Socket = MockSock;
    type Fut =
        Pin<Box<dyn Future<Output = Result<MockSock, io::Error>> + Send>>;

    fn bind(&self, peer: SocketAddr) -> Self::Fut {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let server = self.server(peer.ip());
        Box::pin(async move { Ok(MockSock::new(server)) })
    }
}

//------------ MockServer ----------------------------------------------------

/// One scripted server.
#[derive(Debug, Default)]
pub struct MockServer {
    /// What to do per question. Unscripted questions stay unanswered.
    script: Mutex<HashMap<(String, Rtype), Reply>>,

    /// Every question received, in order.
    queries: Mutex<Vec<Question>>,
}

/// What a server does with a question.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Answer with records after a delay.
    Answer {
        delay: Duration,
        ttl: u32,
        data: Vec<RecordData>,
    },

    /// Answer with an empty answer section and this response code.
    Rcode(Rcode),

    /// Answer with a truncated response.
    Truncated,

    /// Answer with octets no codec will love.
    Garbage,

    /// Do not answer.
    Silence,
}

impl MockServer {
    /// Scripts an immediate answer.
    pub fn answer(
        &self,
        name: &str,
        rtype: Rtype,
        ttl: u32,
        data: Vec<RecordData>,
    ) {
        self.answer_after(name, rtype, ttl, Duration::ZERO, data)
    }

    /// Scripts an answer arriving after a delay.
    pub fn answer_after(
        &self,
        name: &str,
        rtype: Rtype,
        ttl: u32,
        delay: Duration,
        data: Vec<RecordData>,
    ) {
        self.script.lock().insert(
            (name.into(), rtype),
            Reply::Answer { delay, ttl, data },
        );
    }

    /// Scripts a bare response code.
    pub fn rcode(&self, name: &str, rtype: Rtype, rcode: Rcode) {
        self.script
            .lock()
            .insert((name.into(), rtype), Reply::Rcode(rcode));
    }

    /// Scripts a reply of the given kind.
    pub fn reply(&self, name: &str, rtype: Rtype, reply: Reply) {
        self.script.lock().insert((name.into(), rtype), reply);
    }

    /// Returns the number of questions received.
    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    /// Returns the questions received so far.
    pub fn queries(&self) -> Vec<Question> {
        self.queries.lock().clone()
    }

    /// Produces the scripted reaction to a question.
    fn handle(&self, question: &Question) -> Option<(Vec<u8>, Duration)> {
        let reply = self
            .script
            .lock()
            .get(&(question.name.clone(), question.rtype))
            .cloned()
            .unwrap_or(Reply::Silence);
        match reply {
            Reply::Answer { delay, ttl, data } => {
                let answers = data
                    .into_iter()
                    .map(|data| Record {
                        name: question.name.clone(),
                        rtype: rtype_of(&data),
                        ttl,
                        data,
                    })
                    .collect();
                let response = Response {
                    id: question.id,
                    rcode: Rcode::NOERROR,
                    truncated: false,
                    answers,
                };
                Some((encode_response(&response), delay))
            }
            Reply::Rcode(rcode) => {
                let response = Response {
                    id: question.id,
                    rcode,
                    truncated: false,
                    answers: Vec::new(),
                };
                Some((encode_response(&response), Duration::ZERO))
            }
            Reply::Truncated => {
                let response = Response {
                    id: question.id,
                    rcode: Rcode::NOERROR,
                    truncated: true,
                    answers: Vec::new(),
                };
                Some((encode_response(&response), Duration::ZERO))
            }
            Reply::Garbage => Some((vec![0xFF], Duration::ZERO)),
            Reply::Silence => None,
        }
    }
}

/// The record type implied by typed record data.
fn rtype_of(data: &RecordData) -> Rtype {
    match data {
        RecordData::A(_) => Rtype::A,
        RecordData::Aaaa(_) => Rtype::AAAA,
        RecordData::Mx(_) => Rtype::MX,
        RecordData::Srv(_) => Rtype::SRV,
        RecordData::Txt(_) => Rtype::TXT,
        RecordData::Cname(_) => Rtype::CNAME,
        RecordData::Ns(_) => Rtype::NS,
        RecordData::Ptr(_) => Rtype::PTR,
    }
}

//------------ MockSock ------------------------------------------------------

/// A socket connected to one scripted server.
#[derive(Debug)]
pub struct MockSock {
    /// The server behind the socket.
    server: Arc<MockServer>,

    /// Where scripted replies are sent.
    tx: mpsc::UnboundedSender<Vec<u8>>,

    /// Where the socket reads replies from.
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MockSock {
    fn new(server: Arc<MockServer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockSock {
            server,
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl AsyncDgramSend for MockSock {
    fn poll_send(
        &self,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let question = parse_query(buf);
        let reaction = self.server.handle(&question);
        self.server.queries.lock().push(question);
        if let Some((bytes, delay)) = reaction {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = tx.send(bytes);
            });
        }
        Poll::Ready(Ok(buf.len()))
    }
}

impl AsyncDgramRecv for MockSock {
    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let mut rx = self.rx.lock();
        match rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => {
                buf.put_slice(&bytes);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}
