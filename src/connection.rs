//! `Connection`: one TLS-over-TCP stream, its outbound FIFO, and the
//! read/write framing state machines from the protocol design.
//!
//! A `Connection` is always reached through an `Arc` (see
//! [`ConnectionHandle`]) — it is jointly owned by whichever registry
//! holds it (the server's, or the client's single current connection)
//! and by the in-flight reader/writer tasks that were spawned against
//! it. It is torn down once the socket is closed and the last such
//! owner drops its handle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;

use crate::message::{Header, Message, MessageId, OwnedMessage};
use crate::queue::Fifo;

/// A body length above this is treated as a malformed frame rather than
/// an allocation request, per the `MalformedFrame` error kind.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Which side of the handshake this connection performed.
///
/// Affects only which side initiates the TLS handshake and whether the
/// connection's own handle is attached to messages it enqueues inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ServerSide,
    ClientSide,
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedWriteHalf = WriteHalf<Box<dyn AsyncStream>>;
type BoxedReadHalf = ReadHalf<Box<dyn AsyncStream>>;

/// Shared handle to a `Connection`, held by a registry and by any
/// in-flight I/O completion.
pub type ConnectionHandle<K> = Arc<Connection<K>>;

/// One TLS-protected TCP stream between two endpoints.
pub struct Connection<K: MessageId> {
    role: Role,
    peer_addr: SocketAddr,
    reactor: Handle,
    outbound: Fifo<Message<K>>,
    write_in_flight: AtomicBool,
    writer: tokio::sync::Mutex<BoxedWriteHalf>,
    closed: AtomicBool,
}

impl<K: MessageId> Connection<K> {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Enqueues `msg` for sending, starting the write chain if (and only
    /// if) none is currently active. `Send` never fails: a message
    /// enqueued on a connection that is in the process of closing is
    /// simply dropped by the writer once it observes the error.
    ///
    /// `send` is called from arbitrary threads — the dispatcher, a
    /// relay thread, the endpoint's public API — none of which have an
    /// ambient Tokio runtime entered. The write chain is therefore
    /// marshalled onto the connection's own reactor via the `Handle`
    /// captured at construction time, the async/await equivalent of the
    /// source's `asio::post(m_asio_context, ...)`.
    pub fn send(self: &Arc<Self>, msg: Message<K>) {
        if self.is_closed() {
            return;
        }
        self.outbound.push_back(msg);
        if !self.write_in_flight.swap(true, Ordering::AcqRel) {
            let conn = self.clone();
            self.reactor.spawn(async move {
                run_writer(conn).await;
            });
        }
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.size()
    }

    async fn write_one(&self, msg: &Message<K>) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&msg.encode_header()).await?;
        if !msg.body().is_empty() {
            writer.write_all(msg.body()).await?;
        }
        writer.flush().await
    }
}

/// Splits a boxed, already-handshaken TLS stream and constructs the
/// `Connection` plus its read half. The caller is responsible for
/// spawning [`run_reader`] with the returned read half; `Connection`
/// itself carries only the write half, since writes are driven
/// transactionally by [`Connection::send`].
///
/// Must be called from within the owning endpoint's reactor task, since
/// it captures `Handle::current()` as the runtime `send()` will later
/// marshal writer tasks onto, regardless of which thread calls `send()`.
pub(crate) fn from_stream<K, S>(role: Role, peer_addr: SocketAddr, stream: S) -> (Arc<Connection<K>>, BoxedReadHalf)
where
    K: MessageId,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let boxed: Box<dyn AsyncStream> = Box::new(stream);
    let (read_half, write_half) = tokio::io::split(boxed);
    let conn = Connection {
        role,
        peer_addr,
        reactor: Handle::current(),
        outbound: Fifo::new(),
        write_in_flight: AtomicBool::new(false),
        writer: tokio::sync::Mutex::new(write_half),
        closed: AtomicBool::new(false),
    };
    (Arc::new(conn), read_half)
}

/// Drains the outbound FIFO exactly as specified by the write state
/// machine: `WriteHeader` then (if non-empty) `WriteBody`, pop, and
/// either continue with the next queued message or go idle.
///
/// The `write_in_flight` flag, not `outbound.empty()`, is the source of
/// truth for whether a chain is active — checking the queue's emptiness
/// before the push (as the flagged source bug did) races against a
/// concurrent `send()`; the flag, flipped under the same atomic
/// read-modify-write as the recheck below, does not.
async fn run_writer<K: MessageId>(conn: Arc<Connection<K>>) {
    loop {
        let msg = match conn.outbound.pop_front() {
            Some(msg) => msg,
            None => {
                conn.write_in_flight.store(false, Ordering::Release);
                if conn.outbound.empty() {
                    return;
                }
                // A send() raced us between our pop_front() and the
                // store above; try to reclaim the chain rather than
                // leaving the message stranded with no active writer.
                if conn.write_in_flight.swap(true, Ordering::AcqRel) {
                    return;
                }
                continue;
            }
        };
        if let Err(error) = conn.write_one(&msg).await {
            tracing::warn!(peer = %conn.peer_addr(), %error, "write failed, closing connection");
            conn.mark_closed();
            return;
        }
    }
}

/// Drives the read state machine for one connection: `ReadHeader` then
/// (if non-empty) `ReadBody`, then enqueue into `inbound`, forever,
/// until a read error or malformed frame closes the connection.
///
/// `sender_handle` is `Some(self)` for a server-side connection and
/// `None` for a client-side one, matching the invariant that only
/// server-side `OwnedMessage`s carry a sender.
pub(crate) async fn run_reader<K, F>(
    conn: Arc<Connection<K>>,
    mut read_half: BoxedReadHalf,
    inbound: Arc<Fifo<OwnedMessage<K, ConnectionHandle<K>>>>,
    sender_handle: Option<ConnectionHandle<K>>,
    mut on_closed: F,
) where
    K: MessageId,
    F: FnMut(ConnectionHandle<K>) + Send,
{
    loop {
        let mut header_buf = [0u8; Header::<K>::LEN];
        if let Err(error) = read_half.read_exact(&mut header_buf).await {
            tracing::debug!(peer = %conn.peer_addr(), %error, "read header failed, closing connection");
            conn.mark_closed();
            on_closed(conn);
            return;
        }
        let header = Header::decode(&header_buf);
        if header.body_len as usize > MAX_BODY_LEN {
            tracing::warn!(peer = %conn.peer_addr(), len = header.body_len, "malformed frame, closing connection");
            conn.mark_closed();
            on_closed(conn);
            return;
        }

        let mut body = vec![0u8; header.body_len as usize];
        if !body.is_empty() {
            if let Err(error) = read_half.read_exact(&mut body).await {
                tracing::debug!(peer = %conn.peer_addr(), %error, "read body failed, closing connection");
                conn.mark_closed();
                on_closed(conn);
                return;
            }
        }

        let message = Message::from_parts(header, body);
        let owned = match &sender_handle {
            Some(handle) => OwnedMessage::server_side(handle.clone(), message),
            None => OwnedMessage::client_side(message),
        };
        inbound.push_back(owned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_drains_in_enqueue_order() {
        let (client_end, server_end) = duplex(4096);
        let (conn, _read_half) = from_stream::<u32, _>(Role::ClientSide, "127.0.0.1:1".parse().unwrap(), client_end);

        conn.send(Message::new(1u32));
        conn.send(Message::new(2u32));
        conn.send(Message::new(3u32));

        // Give the writer task a chance to drain the queue.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut server_end = server_end;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut buf = [0u8; Header::<u32>::LEN];
            server_end.read_exact(&mut buf).await.unwrap();
            ids.push(Header::<u32>::decode(&buf).id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
