//! The datagram socket abstraction.
//!
//! The dispatcher talks to upstream servers through the traits defined
//! here rather than through [`tokio::net::UdpSocket`] directly, so tests
//! can substitute scripted sockets. [`UdpBinder`] is the production
//! implementation: it binds a socket to an ephemeral local port, sizes its
//! buffers generously, and connects it to a single server.

use core::future::Future;
use core::pin::Pin;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tracing::debug;

/// How many times do we try a new ephemeral port if binding fails.
const RETRY_LOCAL_PORT: usize = 10;

/// Send and receive buffer size requested for every server socket.
const SOCKET_BUFFER_SIZE: usize = 1 << 20;

//------------ DgramSocket ---------------------------------------------------

/// A bound datagram socket as the dispatcher consumes it.
///
/// Blanket-implemented for everything that can send and receive datagrams
/// and be shared between tasks.
pub trait DgramSocket:
    AsyncDgramRecv + AsyncDgramSend + Send + Sync + 'static
{
}

impl<T: AsyncDgramRecv + AsyncDgramSend + Send + Sync + 'static> DgramSocket
    for T
{
}

//------------ AsyncBind -----------------------------------------------------

/// Creates datagram sockets connected to a single peer.
pub trait AsyncBind: Clone + Send + Sync + 'static {
    /// The type of socket produced.
    type Socket: DgramSocket;

    /// The future producing the socket.
    type Fut: Future<Output = Result<Self::Socket, io::Error>> + Send;

    /// Returns a future that binds a new socket connected to `peer`.
    fn bind(&self, peer: SocketAddr) -> Self::Fut;
}

//------------ UdpBinder -----------------------------------------------------

/// Creates connected UDP sockets on ephemeral local ports.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpBinder;

impl UdpBinder {
    /// Creates a new binder.
    pub fn new() -> Self {
        UdpBinder
    }
}

impl AsyncBind for UdpBinder {
    type Socket = UdpSocket;
    type Fut = Pin<
        Box<dyn Future<Output = Result<UdpSocket, io::Error>> + Send>,
    >;

    fn bind(&self, peer: SocketAddr) -> Self::Fut {
        Box::pin(bind_and_connect(peer))
    }
}

/// Binds a UDP socket to an ephemeral port and connects it to `peer`.
async fn bind_and_connect(peer: SocketAddr) -> Result<UdpSocket, io::Error> {
    let mut i = 0;
    let sock = loop {
        match bind_once(peer) {
            Ok(sock) => break sock,
            Err(err) => {
                if i == RETRY_LOCAL_PORT {
                    return Err(err);
                }
                i += 1
            }
        }
    };
    let sock = UdpSocket::from_std(sock.into())?;
    sock.connect(peer).await?;
    Ok(sock)
}

/// Creates one non-blocking socket bound to an ephemeral local port.
fn bind_once(peer: SocketAddr) -> Result<Socket, io::Error> {
    let domain = if peer.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(err) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %err, "could not size the socket send buffer");
    }
    if let Err(err) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %err, "could not size the socket receive buffer");
    }
    sock.set_nonblocking(true)?;
    let local: SocketAddr = if peer.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    sock.bind(&local.into())?;
    Ok(sock)
}

//------------ AsyncDgramRecv ------------------------------------------------

/// Receives datagram packets asynchronously.
pub trait AsyncDgramRecv {
    /// Polled receive.
    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>>;
}

impl AsyncDgramRecv for UdpSocket {
    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        UdpSocket::poll_recv(self, cx, buf)
    }
}

//------------ AsyncDgramRecvEx ----------------------------------------------

/// Convenience trait to turn `poll_recv` into an asynchronous function.
pub trait AsyncDgramRecvEx: AsyncDgramRecv {
    /// Receives a single datagram into `buf`.
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> DgramRecv<'a, Self> {
        DgramRecv {
            receiver: self,
            buf,
        }
    }
}

impl<R: AsyncDgramRecv> AsyncDgramRecvEx for R {}

//------------ DgramRecv -----------------------------------------------------

/// The future returned by [`AsyncDgramRecvEx::recv`].
pub struct DgramRecv<'a, R: ?Sized> {
    /// The receiving socket.
    receiver: &'a R,

    /// The buffer the datagram lands in.
    buf: &'a mut [u8],
}

impl<R: AsyncDgramRecv + ?Sized> Future for DgramRecv<'_, R> {
    type Output = io::Result<usize>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        let mut buf = ReadBuf::new(me.buf);
        match me.receiver.poll_recv(cx, &mut buf) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }
        Poll::Ready(Ok(buf.filled().len()))
    }
}

//------------ AsyncDgramSend ------------------------------------------------

/// Sends datagram packets asynchronously.
pub trait AsyncDgramSend {
    /// Polled send.
    fn poll_send(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>>;
}

impl AsyncDgramSend for UdpSocket {
    fn poll_send(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        UdpSocket::poll_send(self, cx, buf)
    }
}

//------------ AsyncDgramSendEx ----------------------------------------------

/// Convenience trait that turns `poll_send` into an asynchronous function.
pub trait AsyncDgramSendEx: AsyncDgramSend {
    /// Sends `buf` as a single datagram.
    fn send<'a>(&'a self, buf: &'a [u8]) -> DgramSend<'a, Self> {
        DgramSend { sender: self, buf }
    }
}

impl<S: AsyncDgramSend> AsyncDgramSendEx for S {}

//------------ DgramSend -----------------------------------------------------

/// The future returned by [`AsyncDgramSendEx::send`].
pub struct DgramSend<'a, S: ?Sized> {
    /// The sending socket.
    sender: &'a S,

    /// The datagram to send.
    buf: &'a [u8],
}

impl<S: AsyncDgramSend + ?Sized> Future for DgramSend<'_, S> {
    type Output = io::Result<usize>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<usize>> {
        self.sender.poll_send(cx, self.buf)
    }
}
