//! The client endpoint: resolve → connect → TLS handshake → frame loop,
//! with a fixed-delay auto-reconnect and an optional heartbeat.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::connection::{self, Connection, ConnectionHandle, Role};
use crate::dispatch::describe_panic;
use crate::message::{Message, MessageId, OwnedMessage};
use crate::queue::Fifo;
use crate::tls::{self, TlsPaths};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
const DISPATCH_POLL: Duration = Duration::from_millis(250);

/// User-supplied hook invoked for every inbound message, on the
/// dispatcher thread (never on the reactor thread).
pub trait ClientHandler<K: MessageId>: Send + Sync {
    fn on_message(&self, msg: Message<K>);
}

/// Drives one `Connection` for a long-lived client: connect, maintain,
/// transparently reconnect on loss, optionally pulse a heartbeat.
pub struct ClientEndpoint<K: MessageId, H> {
    host: String,
    port: u16,
    heartbeat_id: Option<K>,
    client_config: Arc<rustls::ClientConfig>,
    handler: Arc<H>,
    inbound: Arc<Fifo<OwnedMessage<K, ConnectionHandle<K>>>>,
    current: Mutex<Option<Arc<Connection<K>>>>,
    connected: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_notify: tokio::sync::Notify,
    reactor_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    dispatcher_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<K: MessageId, H: ClientHandler<K> + Send + Sync + 'static> ClientEndpoint<K, H> {
    /// Builds and configures the client's TLS identity (loading the
    /// local certificate/key and CA bundle from `paths`), without
    /// connecting yet.
    ///
    /// `heartbeat_id` is the identifier this client pulses with every
    /// ten seconds once connected; `None` disables the heartbeat
    /// entirely (the source's distinction between a "device" role,
    /// which pulses, and other roles, which don't).
    pub fn new(host: impl Into<String>, port: u16, paths: &TlsPaths, heartbeat_id: Option<K>, handler: H) -> crate::error::Result<Self> {
        let client_config = tls::build_client_config(paths)?;
        Ok(ClientEndpoint {
            host: host.into(),
            port,
            heartbeat_id,
            client_config,
            handler: Arc::new(handler),
            inbound: Arc::new(Fifo::new()),
            current: Mutex::new(None),
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: tokio::sync::Notify::new(),
            reactor_thread: Mutex::new(None),
            dispatcher_thread: Mutex::new(None),
        })
    }

    /// Spawns the reactor thread and begins the connect/reconnect loop.
    /// Returns immediately; the loop runs until `disconnect()`.
    pub fn connect(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("meshlink-client-reactor".into())
            .spawn(move || {
                let runtime = crate::async_runtime::build_reactor_runtime().expect("failed to build client reactor runtime");
                runtime.block_on(this.reactor_loop());
            })
            .expect("failed to spawn client reactor thread");
        *self.reactor_thread.lock() = Some(handle);
    }

    /// Closes the current connection (if any), stops the reactor and
    /// any dispatcher thread, and joins every thread this endpoint owns.
    pub fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        if let Some(handle) = self.reactor_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher_thread.lock().take() {
            let _ = handle.join();
        }
        self.connected.store(false, Ordering::Release);
        *self.current.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Enqueues `msg` for sending if currently connected; otherwise
    /// drops it silently. `Send` never fails — callers that need
    /// back-pressure must consult `is_connected()`.
    pub fn send(&self, msg: Message<K>) {
        if let Some(conn) = self.current.lock().as_ref() {
            conn.send(msg);
        }
    }

    /// The inbound message queue, shared between the reactor (push) and
    /// the dispatcher (pop).
    pub fn incoming_messages(&self) -> &Fifo<OwnedMessage<K, ConnectionHandle<K>>> {
        &self.inbound
    }

    /// Blocks the calling thread, draining the inbound queue and
    /// invoking `ClientHandler::on_message`, until `disconnect()` is
    /// called.
    pub fn handle_messages_no_thread(&self) {
        while !self.shutting_down.load(Ordering::Acquire) {
            if let Some(owned) = self.inbound.wait_timeout(DISPATCH_POLL) {
                self.dispatch_one(owned);
            }
        }
    }

    /// As `handle_messages_no_thread`, but runs on a dedicated thread
    /// that `disconnect()` joins.
    pub fn handle_messages(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("meshlink-client-dispatch".into())
            .spawn(move || this.handle_messages_no_thread())
            .expect("failed to spawn client dispatcher thread");
        *self.dispatcher_thread.lock() = Some(handle);
    }

    fn dispatch_one(&self, owned: OwnedMessage<K, ConnectionHandle<K>>) {
        let handler = self.handler.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.on_message(owned.message);
        }));
        if let Err(payload) = outcome {
            tracing::error!(panic = %describe_panic(&*payload), "client message handler panicked");
        }
    }

    async fn reactor_loop(self: Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                _ = self.attempt_connection() => {}
                _ = self.shutdown_notify.notified() => return,
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = self.shutdown_notify.notified() => return,
            }
        }
    }

    async fn attempt_connection(&self) {
        let target = format!("{}:{}", self.host, self.port);
        let tcp = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(%error, host = %self.host, port = self.port, "client connect failed");
                return;
            }
        };
        let peer_addr: SocketAddr = match tcp.peer_addr() {
            Ok(addr) => addr,
            Err(error) => {
                tracing::warn!(%error, "could not read peer address after connect");
                return;
            }
        };

        let server_name = match ServerName::try_from(self.host.clone()) {
            Ok(name) => name,
            Err(error) => {
                tracing::error!(%error, host = %self.host, "invalid server name");
                return;
            }
        };

        let connector = TlsConnector::from(self.client_config.clone());
        let tls_stream = match connector.connect(server_name, tcp).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(%error, %peer_addr, "client tls handshake failed");
                return;
            }
        };
        tracing::info!(%peer_addr, "client connected");

        let (conn, read_half) = connection::from_stream::<K, _>(Role::ClientSide, peer_addr, tls_stream);
        *self.current.lock() = Some(conn.clone());
        self.connected.store(true, Ordering::Release);

        let pulse_handle = self.heartbeat_id.map(|ping_id| {
            let conn = conn.clone();
            tokio::spawn(pulse_loop(conn, ping_id))
        });

        connection::run_reader(conn, read_half, self.inbound.clone(), None, |_| {}).await;

        if let Some(handle) = pulse_handle {
            handle.abort();
        }
        self.connected.store(false, Ordering::Release);
        *self.current.lock() = None;
        tracing::info!(%peer_addr, "client disconnected");
    }
}

/// Sends `ping_id` with an empty body every ten seconds while the
/// connection is open. A send is attempted unconditionally; if the
/// timer itself errors the pulse simply stops — the connection is left
/// alone, since loss is detected by the read side, not the heartbeat.
async fn pulse_loop<K: MessageId>(conn: Arc<Connection<K>>, ping_id: K) {
    loop {
        tokio::time::sleep(HEARTBEAT_PERIOD).await;
        if conn.is_closed() {
            return;
        }
        conn.send(Message::new(ping_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{self, Role};
    use crate::message::Header;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test(start_paused = true)]
    async fn pulse_fires_every_heartbeat_period() {
        let (local, mut remote) = duplex(4096);
        let (conn, _read_half) = connection::from_stream::<u32, _>(Role::ClientSide, "127.0.0.1:1".parse().unwrap(), local);
        let handle = tokio::spawn(pulse_loop(conn, 99u32));

        for _ in 0..3 {
            tokio::time::advance(HEARTBEAT_PERIOD).await;
            let mut buf = [0u8; Header::<u32>::LEN];
            remote.read_exact(&mut buf).await.unwrap();
            let header = Header::<u32>::decode(&buf);
            assert_eq!(header.id, 99);
            assert_eq!(header.body_len, 0);
        }

        handle.abort();
    }
}
