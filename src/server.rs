//! The server endpoint: accept loop, admitted-connection registry,
//! admission callback, and broadcast/unicast send helpers.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::connection::{self, ConnectionHandle, Role};
use crate::dispatch::describe_panic;
use crate::message::{Message, MessageId, OwnedMessage};
use crate::queue::Fifo;
use crate::tls::{self, TlsPaths};

const DISPATCH_POLL: std::time::Duration = std::time::Duration::from_millis(250);

/// User-supplied hooks for admission, disconnection, and inbound
/// messages. Admission defaults to rejecting everyone — a concrete
/// server must opt in, matching the source's reject-by-default stance.
pub trait ServerHandler<K: MessageId>: Send + Sync {
    fn on_client_connect(&self, _addr: SocketAddr) -> bool {
        false
    }

    fn on_client_disconnect(&self, _conn: &ConnectionHandle<K>) {}

    fn on_message(&self, sender: ConnectionHandle<K>, msg: Message<K>);
}

/// Owns the accept loop, the ordered registry of admitted connections,
/// and the broadcast/unicast helpers built on top of it.
pub struct ServerEndpoint<K: MessageId, H> {
    port: u16,
    server_config: Arc<rustls::ServerConfig>,
    handler: Arc<H>,
    whitelist: Option<HashSet<IpAddr>>,
    registry: Mutex<Vec<ConnectionHandle<K>>>,
    inbound: Arc<Fifo<OwnedMessage<K, ConnectionHandle<K>>>>,
    shutting_down: AtomicBool,
    shutdown_notify: tokio::sync::Notify,
    reactor_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    dispatcher_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<K: MessageId, H: ServerHandler<K> + Send + Sync + 'static> ServerEndpoint<K, H> {
    /// Builds the server's TLS identity (requiring and verifying a
    /// client certificate against `paths.ca_bundle`) without binding
    /// yet. `whitelist`, if given, restricts admission to the listed
    /// source IPs in addition to whatever `handler.on_client_connect`
    /// decides.
    pub fn new(port: u16, paths: &TlsPaths, whitelist: Option<HashSet<IpAddr>>, handler: H) -> crate::error::Result<Self> {
        let server_config = tls::build_server_config(paths)?;
        Ok(ServerEndpoint {
            port,
            server_config,
            handler: Arc::new(handler),
            whitelist,
            registry: Mutex::new(Vec::new()),
            inbound: Arc::new(Fifo::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: tokio::sync::Notify::new(),
            reactor_thread: Mutex::new(None),
            dispatcher_thread: Mutex::new(None),
        })
    }

    /// Spawns the reactor thread, binds `0.0.0.0:port`, and primes the
    /// accept loop. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("meshlink-server-reactor".into())
            .spawn(move || {
                let runtime = crate::async_runtime::build_reactor_runtime().expect("failed to build server reactor runtime");
                runtime.block_on(async {
                    tokio::select! {
                        _ = this.clone().accept_loop() => {}
                        _ = this.shutdown_notify.notified() => {}
                    }
                });
            })
            .expect("failed to spawn server reactor thread");
        *self.reactor_thread.lock() = Some(handle);
    }

    /// Stops the reactor (cancelling the accept loop and every
    /// in-flight per-connection task that hasn't already finished its
    /// own handshake/read chain), stops any dispatcher thread, and
    /// joins every thread this endpoint owns.
    pub fn stop(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        if let Some(handle) = self.reactor_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher_thread.lock().take() {
            let _ = handle.join();
        }
        self.registry.lock().clear();
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Sends `msg` to every admitted connection other than `ignore`, in
    /// registry (insertion) order. Returns once every send has been
    /// *enqueued*, not delivered — broadcast is not synchronous with
    /// delivery. Connections observed dead during the sweep are
    /// unregistered exactly as a read error would unregister them.
    pub fn message_all_clients(&self, msg: &Message<K>, ignore: Option<&ConnectionHandle<K>>) {
        let mut dead = Vec::new();
        {
            let registry = self.registry.lock();
            for conn in registry.iter() {
                if let Some(ignored) = ignore {
                    if Arc::ptr_eq(conn, ignored) {
                        continue;
                    }
                }
                if conn.is_closed() {
                    dead.push(conn.clone());
                    continue;
                }
                conn.send(msg.clone());
            }
        }
        for conn in dead {
            self.remove_connection(&conn);
        }
    }

    /// Sends `msg` to `client` if it is still live; otherwise runs the
    /// same disconnect-and-unregister path a read error would.
    pub fn message_client(&self, client: &ConnectionHandle<K>, msg: Message<K>) {
        if client.is_closed() {
            self.remove_connection(client);
            return;
        }
        client.send(msg);
    }

    /// The inbound message queue, shared between the reactor (push) and
    /// the dispatcher (pop).
    pub fn incoming_messages(&self) -> &Fifo<OwnedMessage<K, ConnectionHandle<K>>> {
        &self.inbound
    }

    /// Blocks the calling thread, draining the inbound queue and
    /// invoking `ServerHandler::on_message`, until `stop()` is called.
    pub fn handle_requests_no_thread(&self) {
        while !self.shutting_down.load(Ordering::Acquire) {
            if let Some(owned) = self.inbound.wait_timeout(DISPATCH_POLL) {
                self.dispatch_one(owned);
            }
        }
    }

    /// As `handle_requests_no_thread`, but runs on a dedicated thread
    /// that `stop()` joins.
    pub fn handle_requests(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("meshlink-server-dispatch".into())
            .spawn(move || this.handle_requests_no_thread())
            .expect("failed to spawn server dispatcher thread");
        *self.dispatcher_thread.lock() = Some(handle);
    }

    fn dispatch_one(&self, owned: OwnedMessage<K, ConnectionHandle<K>>) {
        let sender = match owned.sender {
            Some(sender) => sender,
            None => {
                debug_assert!(false, "server-side OwnedMessage without a sender handle");
                return;
            }
        };
        let handler = self.handler.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.on_message(sender, owned.message);
        }));
        if let Err(payload) = outcome {
            tracing::error!(panic = %describe_panic(&*payload), "server message handler panicked");
        }
    }

    fn remove_connection(&self, conn: &ConnectionHandle<K>) {
        let removed = {
            let mut registry = self.registry.lock();
            registry.iter().position(|c| Arc::ptr_eq(c, conn)).map(|pos| registry.remove(pos))
        };
        if let Some(conn) = removed {
            self.handler.on_client_disconnect(&conn);
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(error) => {
                tracing::error!(%error, port = self.port, "failed to bind server listener");
                return;
            }
        };
        tracing::info!(port = self.port, "server listening");

        loop {
            match listener.accept().await {
                Ok((tcp, peer_addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_accepted(tcp, peer_addr).await });
                }
                Err(error) => {
                    // AcceptFailed: log and keep the loop alive so one bad
                    // accept never stalls the rest of the clients.
                    tracing::warn!(%error, "accept failed");
                }
            }
        }
    }

    async fn handle_accepted(self: Arc<Self>, tcp: TcpStream, peer_addr: SocketAddr) {
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.contains(&peer_addr.ip()) {
                tracing::info!(%peer_addr, "connection rejected by whitelist");
                return;
            }
        }
        if !self.handler.on_client_connect(peer_addr) {
            tracing::info!(%peer_addr, "connection rejected by admission callback");
            return;
        }

        let acceptor = TlsAcceptor::from(self.server_config.clone());
        let tls_stream = match acceptor.accept(tcp).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(%error, %peer_addr, "server tls handshake failed");
                return;
            }
        };

        let (conn, read_half) = connection::from_stream::<K, _>(Role::ServerSide, peer_addr, tls_stream);
        self.registry.lock().push(conn.clone());
        tracing::info!(%peer_addr, "client admitted");

        let this = self.clone();
        connection::run_reader(conn.clone(), read_half, self.inbound.clone(), Some(conn), move |closed| {
            this.remove_connection(&closed);
        })
        .await;
    }
}
