//! The TCP acceptor and server surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use packrpc_common::protocol::{PackrpcError, Result, HANDSHAKE_BYTE};
use packrpc_common::registry::{marshal, Message, Registry, Service};
use packrpc_common::transport::FrameCodec;

use crate::group::Group;
use crate::session::{self, now_millis, ServerSession};

/// How often the keep-time sweeper looks for stale sessions.
const SWEEP_INTERVAL_MS: u64 = 1_000;

type ErrorCallback = Box<dyn Fn(&PackrpcError) + Send + Sync>;
type AcceptCallback = Box<dyn Fn(u64) + Send + Sync>;
type CloseCallback = Box<dyn Fn(u64) + Send + Sync>;
type CompleteCallback = Box<dyn Fn(SocketAddr) + Send + Sync>;

/// Server configuration.
///
/// `server_id` seeds the snowflake handle generator; `cap` bounds the
/// number of concurrent clients; `keep_time` (ms) retires sessions with no
/// traffic (0 disables the sweep); `buffer_cap` sizes each session's
/// receive buffer; `out_chan_size` sizes the outbound mailboxes.
pub struct ServerOptions {
    pub name: String,
    pub server_id: u64,
    pub cap: usize,
    pub keep_time: u64,
    pub buffer_cap: usize,
    pub out_chan_size: usize,
    pub on_error: Option<ErrorCallback>,
    pub on_accept: Option<AcceptCallback>,
    pub on_close: Option<CloseCallback>,
    pub on_complete: Option<CompleteCallback>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            name: "rpc/server".to_string(),
            server_id: 1,
            cap: 1024,
            keep_time: 60_000,
            buffer_cap: 8192,
            out_chan_size: 512,
            on_error: None,
            on_accept: None,
            on_close: None,
            on_complete: None,
        }
    }
}

impl ServerOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_server_id(mut self, id: u64) -> Self {
        self.server_id = id;
        self
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_keep_time(mut self, ms: u64) -> Self {
        self.keep_time = ms;
        self
    }

    pub fn with_buffer_cap(mut self, cap: usize) -> Self {
        self.buffer_cap = cap;
        self
    }

    pub fn with_out_chan_size(mut self, size: usize) -> Self {
        self.out_chan_size = size;
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&PackrpcError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn with_on_accept(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_accept = Some(Box::new(f));
        self
    }

    pub fn with_on_close(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn with_on_complete(mut self, f: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

struct ServerShared {
    opts: ServerOptions,
    group: Group,
    registry: Arc<RwLock<Registry>>,
    shutdown: watch::Sender<bool>,
    socket_ids: AtomicU64,
}

impl ServerShared {
    fn fire_error(&self, err: &PackrpcError) {
        if let Some(on_error) = &self.opts.on_error {
            on_error(err);
        }
    }
}

/// A packrpc server: accepts clients, dispatches their requests against
/// registered services, and can push fire-and-forget calls back to any
/// connected client by handle.
pub struct Server {
    shared: Arc<ServerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Server {
        let group = Group::new(opts.server_id, opts.cap, opts.buffer_cap);
        let (shutdown, _) = watch::channel(false);
        Server {
            shared: Arc::new(ServerShared {
                group,
                registry: Arc::new(RwLock::new(Registry::new())),
                shutdown,
                socket_ids: AtomicU64::new(0),
                opts,
            }),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.opts.name
    }

    /// Address the server is listening on, once `listen` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of connected clients.
    pub fn size(&self) -> usize {
        self.shared.group.size()
    }

    /// Handles of every connected client.
    pub fn handles(&self) -> Vec<u64> {
        self.shared.group.handles()
    }

    /// Register a service for dispatch. Registration happens before or
    /// between calls, never concurrently with itself.
    pub fn register(&self, service: Service) -> Result<()> {
        self.shared.registry.write().register(service)
    }

    /// Bind `addr` and start accepting clients.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PackrpcError::Connection(format!("failed to bind {}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| PackrpcError::Connection(format!("failed to resolve local addr: {}", e)))?;

        *self.local_addr.lock() = Some(local);
        info!(name = %self.shared.opts.name, addr = %local, "rpc server listening");
        if let Some(on_complete) = &self.shared.opts.on_complete {
            on_complete(local);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(accept_loop(Arc::clone(&self.shared), listener)));
        if self.shared.opts.keep_time > 0 {
            tasks.push(tokio::spawn(sweep_loop(Arc::clone(&self.shared))));
        }

        Ok(local)
    }

    /// Fire-and-forget call toward the client identified by `handle`.
    pub async fn call<A: Message>(&self, handle: u64, method: &str, arg: Option<&A>) -> Result<()> {
        let payload = arg.map(marshal).transpose()?;
        let session = self
            .shared
            .group
            .grab(handle)
            .ok_or(PackrpcError::ConnectionClosed)?;
        let result = session.call(method, payload).await;
        self.shared.group.release(&session);
        result
    }

    /// Stop accepting, close every session, and wait for the background
    /// tasks to finish.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);

        for session in self.shared.group.drain() {
            session.halt();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        info!(name = %self.shared.opts.name, "rpc server shut down");
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = admit(&shared, stream, peer).await {
                        warn!(name = %shared.opts.name, %peer, %err, "client rejected");
                        shared.fire_error(&err);
                    }
                }
                Err(e) => {
                    let err = PackrpcError::Io(e);
                    warn!(name = %shared.opts.name, %err, "accept failed");
                    shared.fire_error(&err);
                }
            }
        }
    }
}

/// Admit one accepted socket: allocate a session, register it in the
/// group, transmit the handshake byte, fire `on_accept`, and spawn the
/// session's task pair.
async fn admit(shared: &Arc<ServerShared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let socket_id = shared.socket_ids.fetch_add(1, Ordering::Relaxed) + 1;
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(shared.opts.out_chan_size);

    let session = Arc::new(ServerSession::new(socket_id, Some(peer), out_tx.clone()));
    let buf = shared.group.take_buffer();

    let handle = match shared.group.occupy(&session) {
        Ok(handle) => handle,
        Err(err) => {
            shared.group.put_buffer(buf);
            return Err(err);
        }
    };

    if let Err(e) = write_half.write_all(&[HANDSHAKE_BYTE]).await {
        shared.group.put_buffer(buf);
        shared.group.close_socket(socket_id);
        return Err(PackrpcError::Connection(format!("handshake write failed: {}", e)));
    }
    session.mark_authenticated(now_millis());

    debug!(name = %shared.opts.name, handle, %peer, "client accepted");
    if let Some(on_accept) = &shared.opts.on_accept {
        on_accept(handle);
    }

    let codec = FrameCodec::new(shared.opts.buffer_cap);
    tokio::spawn(session::write_loop(
        write_half,
        out_rx,
        session.stop_rx(),
        codec.clone(),
        Arc::clone(&session),
    ));

    let reader_shared = Arc::clone(shared);
    let reader_session = Arc::clone(&session);
    let registry = Arc::clone(&shared.registry);
    tokio::spawn(async move {
        let stop_rx = reader_session.stop_rx();
        let buf = session::read_loop(
            read_half,
            stop_rx,
            codec,
            buf,
            registry,
            out_tx,
            Arc::clone(&reader_session),
        )
        .await;

        reader_shared.group.put_buffer(buf);
        if let Some(handle) = reader_shared.group.close_socket(reader_session.socket_id()) {
            debug!(name = %reader_shared.opts.name, handle, "client closed");
            if let Some(on_close) = &reader_shared.opts.on_close {
                on_close(handle);
            }
        }
    });

    Ok(())
}

/// Retire sessions with no traffic for longer than `keep_time`.
async fn sweep_loop(shared: Arc<ServerShared>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut tick = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {
                let stale = shared.group.stale_sessions(now_millis(), shared.opts.keep_time);
                for session in stale {
                    debug!(name = %shared.opts.name, handle = session.handle(), "closing idle client");
                    session.halt();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults_match_contract() {
        let opts = ServerOptions::default();
        assert_eq!(opts.name, "rpc/server");
        assert_eq!(opts.server_id, 1);
        assert_eq!(opts.cap, 1024);
        assert_eq!(opts.keep_time, 60_000);
        assert_eq!(opts.buffer_cap, 8192);
        assert_eq!(opts.out_chan_size, 512);
    }

    #[test]
    fn options_builder_overrides() {
        let opts = ServerOptions::default()
            .with_name("test/server")
            .with_server_id(7)
            .with_cap(2)
            .with_keep_time(0)
            .with_buffer_cap(512)
            .with_out_chan_size(16);
        assert_eq!(opts.name, "test/server");
        assert_eq!(opts.server_id, 7);
        assert_eq!(opts.cap, 2);
        assert_eq!(opts.keep_time, 0);
        assert_eq!(opts.buffer_cap, 512);
        assert_eq!(opts.out_chan_size, 16);
    }

    #[tokio::test]
    async fn listen_binds_an_ephemeral_port() {
        let server = Server::new(ServerOptions::default().with_keep_time(0));
        let addr = server.listen("127.0.0.1:0").await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.size(), 0);
        assert!(server.handles().is_empty());
        assert_eq!(server.name(), "rpc/server");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn call_to_unknown_handle_fails_closed() {
        let server = Server::new(ServerOptions::default().with_keep_time(0));

        #[derive(serde::Serialize, serde::Deserialize)]
        struct Nudge;
        impl Message for Nudge {
            const TYPE_NAME: &'static str = "packrpc.test.Nudge";
        }

        assert!(matches!(
            server.call(0xDEAD, "Svc.Push", Some(&Nudge)).await,
            Err(PackrpcError::ConnectionClosed)
        ));
    }
}
