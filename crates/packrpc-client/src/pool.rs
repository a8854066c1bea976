//! The client connection pool.
//!
//! The pool owns every session it creates; callers hold a transient lease
//! taken by an acquisition scan and returned on every exit path of a call.
//! Acquisition prefers the most recently released session (MRU at the list
//! tail, releases rotate to the head, the scan walks from the head). A
//! background reaper removes dead sessions and retires sessions idle past
//! their timeout, down to the configured idle floor.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use packrpc_common::protocol::{PackrpcError, Result};
use packrpc_common::registry::{marshal, Message, Registry, Service};

use crate::session::{now_millis, ClientSession, SessionConfig};

/// How often the idle reaper wakes.
const REAP_INTERVAL_MS: u64 = 500;

/// Consecutive failed acquisitions before the caller backs off.
const ACQUIRE_BACKOFF_AFTER: u32 = 8;

/// Back-off sleep once the failure threshold is hit.
const ACQUIRE_BACKOFF_MS: u64 = 100;

/// Connection pool configuration.
///
/// `idle` is both the number of connections opened eagerly at construction
/// and the floor the reaper will not shrink below. `active` bounds the pool
/// size. All durations are milliseconds.
pub struct PoolOptions {
    pub name: String,
    pub addr: String,
    /// Per-session receive buffer size in bytes.
    pub buffer_cap: usize,
    /// Depth of each session's outbound mailbox.
    pub out_chan_size: usize,
    /// Deadline for connecting and for waiting out pool pressure.
    pub socket_timeout: u64,
    /// Per-call reply timeout for `call_return`.
    pub timeout: u64,
    pub idle: usize,
    pub active: usize,
    /// Idle span after which the reaper retires a session.
    pub idle_timeout: u64,
    /// Invoked for every session the pool opens.
    pub on_connected: Option<Arc<dyn Fn(&ClientSession) + Send + Sync>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            name: "rpc/client".to_string(),
            addr: String::new(),
            buffer_cap: 8192,
            out_chan_size: 32,
            socket_timeout: 60_000,
            timeout: 1_000,
            idle: 2,
            active: 2,
            idle_timeout: 120_000,
            on_connected: None,
        }
    }
}

impl PoolOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
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

    pub fn with_socket_timeout(mut self, ms: u64) -> Self {
        self.socket_timeout = ms;
        self
    }

    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout = ms;
        self
    }

    pub fn with_idle(mut self, idle: usize) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_active(mut self, active: usize) -> Self {
        self.active = active;
        self
    }

    pub fn with_idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout = ms;
        self
    }

    pub fn with_on_connected(mut self, f: impl Fn(&ClientSession) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_cap: self.buffer_cap,
            out_chan_size: self.out_chan_size,
            socket_timeout: self.socket_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Idle,
    InUse,
    Dead,
}

struct PoolEntry {
    id: u64,
    session: Arc<ClientSession>,
    refs: i32,
    status: EntryStatus,
}

struct PoolInner {
    entries: Vec<PoolEntry>,
    size: usize,
    shutdown: bool,
}

struct PoolShared {
    opts: PoolOptions,
    inner: Mutex<PoolInner>,
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicU64,
    closed_tx: mpsc::UnboundedSender<u64>,
}

/// A pool of client sessions to one server address.
pub struct Pool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Build the pool: pre-open `idle` connections and start the reaper.
    ///
    /// Fails if any eager connection cannot be established; sessions opened
    /// before the failure are shut down again.
    pub async fn new(opts: PoolOptions) -> Result<Pool> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                size: 0,
                shutdown: false,
            }),
            registry: Arc::new(RwLock::new(Registry::new())),
            next_id: AtomicU64::new(0),
            closed_tx,
            opts,
        });

        for _ in 0..shared.opts.idle {
            match open_session(&shared).await {
                Ok(session) => {
                    let mut inner = shared.inner.lock().await;
                    inner.entries.push(PoolEntry {
                        id: session.id(),
                        session,
                        refs: 1,
                        status: EntryStatus::Idle,
                    });
                    inner.size += 1;
                }
                Err(err) => {
                    let mut inner = shared.inner.lock().await;
                    for entry in inner.entries.drain(..) {
                        entry.session.halt();
                    }
                    inner.size = 0;
                    return Err(err);
                }
            }
        }

        tokio::spawn(watch_closed(Arc::downgrade(&shared), closed_rx));
        let reaper = tokio::spawn(reap_loop(Arc::clone(&shared)));

        info!(name = %shared.opts.name, addr = %shared.opts.addr, idle = shared.opts.idle, "rpc client pool started");

        Ok(Pool {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.opts.name
    }

    /// Number of sessions currently owned by the pool.
    pub async fn size(&self) -> usize {
        self.shared.inner.lock().await.size
    }

    /// Register a service invoked when the server initiates a request
    /// toward this client.
    pub fn register(&self, service: Service) -> Result<()> {
        self.shared.registry.write().register(service)
    }

    /// Fire-and-forget call: acquire a session, write a serial-0 request,
    /// release.
    pub async fn call<A: Message>(&self, method: &str, arg: Option<&A>) -> Result<()> {
        let payload = arg.map(marshal).transpose()?;
        let (lease, session) = self.acquire_wait().await?;
        let result = session.call(method, payload).await;
        self.release(lease).await;
        result
    }

    /// Call expecting a reply; returns the erased reply value.
    ///
    /// Exactly one of {reply, `Timeout`, `ConnectionClosed`} is returned,
    /// and the session is released on every path.
    pub async fn call_return<A: Message>(
        &self,
        method: &str,
        arg: Option<&A>,
    ) -> Result<Box<dyn Any + Send>> {
        let payload = arg.map(marshal).transpose()?;
        let (lease, session) = self.acquire_wait().await?;
        let result = session.call_return(method, payload, self.shared.opts.timeout).await;
        self.release(lease).await;
        result
    }

    /// Typed variant of [`Pool::call_return`]: decodes the reply payload
    /// into `R`.
    pub async fn call_with<A: Message, R: Message>(&self, method: &str, arg: Option<&A>) -> Result<R> {
        self.shared.registry.write().ensure_type::<R>();
        let value = self.call_return(method, arg).await?;
        value
            .downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| PackrpcError::ParamUndefined(R::TYPE_NAME.to_string()))
    }

    /// Stop the pool: refuse new acquisitions, wait for the reaper, and
    /// shut every owned session down.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
        }

        if let Some(handle) = self.reaper.lock().await.take() {
            let _ = handle.await;
        }

        loop {
            let session = {
                let mut inner = self.shared.inner.lock().await;
                match inner.entries.pop() {
                    Some(entry) => {
                        inner.size -= 1;
                        Some(entry.session)
                    }
                    None => None,
                }
            };
            match session {
                Some(session) => session.halt(),
                None => break,
            }
        }

        info!(name = %self.shared.opts.name, "rpc client pool shut down");
    }

    /// Acquire with bounded back-off until `socket_timeout` elapses.
    async fn acquire_wait(&self) -> Result<(u64, Arc<ClientSession>)> {
        let start = Instant::now();
        let mut misses = 0u32;
        loop {
            match acquire(&self.shared).await {
                Ok(lease) => return Ok(lease),
                Err(PackrpcError::NoAvailable) => {
                    misses += 1;
                    if misses > ACQUIRE_BACKOFF_AFTER {
                        misses = 0;
                        tokio::time::sleep(Duration::from_millis(ACQUIRE_BACKOFF_MS)).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                    if start.elapsed().as_millis() as u64 > self.shared.opts.socket_timeout {
                        return Err(PackrpcError::Timeout(self.shared.opts.socket_timeout));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn release(&self, lease: u64) {
        release(&self.shared, lease).await;
    }
}

async fn open_session(shared: &Arc<PoolShared>) -> Result<Arc<ClientSession>> {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let session = ClientSession::connect(
        id,
        &shared.opts.addr,
        &shared.opts.session_config(),
        Arc::clone(&shared.registry),
        shared.closed_tx.clone(),
    )
    .await?;

    debug!(name = %shared.opts.name, session = id, addr = %shared.opts.addr, "rpc connection opened");
    if let Some(on_connected) = &shared.opts.on_connected {
        on_connected(&session);
    }

    Ok(session)
}

/// One acquisition attempt.
///
/// Scans head-to-tail for an idle session and rotates the winner to the
/// tail; otherwise opens a new connection if the pool is below `active`
/// (the size is taken provisionally before the connect so concurrent
/// acquirers cannot overshoot the bound); otherwise reports `NoAvailable`.
async fn acquire(shared: &Arc<PoolShared>) -> Result<(u64, Arc<ClientSession>)> {
    {
        let mut inner = shared.inner.lock().await;
        if inner.shutdown {
            return Err(PackrpcError::ConnectionClosed);
        }

        if let Some(pos) = inner.entries.iter().position(|e| e.status == EntryStatus::Idle) {
            let mut entry = inner.entries.remove(pos);
            entry.status = EntryStatus::InUse;
            entry.refs += 1;
            let lease = (entry.id, Arc::clone(&entry.session));
            inner.entries.push(entry);
            return Ok(lease);
        }

        if inner.size >= shared.opts.active {
            return Err(PackrpcError::NoAvailable);
        }
        inner.size += 1;
    }

    match open_session(shared).await {
        Ok(session) => {
            let mut inner = shared.inner.lock().await;
            let lease = (session.id(), Arc::clone(&session));
            inner.entries.push(PoolEntry {
                id: session.id(),
                session,
                refs: 2,
                status: EntryStatus::InUse,
            });
            Ok(lease)
        }
        Err(err) => {
            let mut inner = shared.inner.lock().await;
            inner.size -= 1;
            warn!(name = %shared.opts.name, %err, "rpc connection open failed");
            Err(err)
        }
    }
}

/// Return a leased session.
///
/// Dead or disconnected sessions keep their entry for the reaper; live ones
/// rotate to the head and go back to idle.
async fn release(shared: &Arc<PoolShared>, lease: u64) {
    let now = now_millis();
    let mut inner = shared.inner.lock().await;

    let Some(pos) = inner.entries.iter().position(|e| e.id == lease) else {
        return;
    };

    let entry = &mut inner.entries[pos];
    entry.session.touch_idle(now);
    entry.refs -= 1;

    if !entry.session.is_connected() || entry.status == EntryStatus::Dead {
        entry.status = EntryStatus::Dead;
        return;
    }

    entry.status = EntryStatus::Idle;
    let entry = inner.entries.remove(pos);
    inner.entries.insert(0, entry);
}

/// Marks entries dead when their session reports an asynchronous close.
///
/// Holds only a weak reference so a dropped pool is not kept alive by its
/// own notification channel.
async fn watch_closed(shared: Weak<PoolShared>, mut closed_rx: mpsc::UnboundedReceiver<u64>) {
    while let Some(id) = closed_rx.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        let mut inner = shared.inner.lock().await;
        if inner.shutdown {
            continue;
        }
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) {
            debug!(name = %shared.opts.name, session = id, "rpc connection closed, marking dead");
            entry.status = EntryStatus::Dead;
        }
    }
}

async fn reap_loop(shared: Arc<PoolShared>) {
    let mut tick = tokio::time::interval(Duration::from_millis(REAP_INTERVAL_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if shared.inner.lock().await.shutdown {
            break;
        }
        let doomed = reap(&shared).await;
        for session in doomed {
            debug!(name = %shared.opts.name, session = session.id(), "reaping rpc connection");
            session.halt();
        }
    }
}

/// One reaper pass under the pool mutex.
///
/// First removes dead entries nobody holds (down to the idle floor), then
/// marks idle-expired sessions dead for the next pass. The collected
/// sessions are shut down by the caller outside the lock.
async fn reap(shared: &Arc<PoolShared>) -> Vec<Arc<ClientSession>> {
    let now = now_millis();
    let mut doomed = Vec::new();
    let mut inner = shared.inner.lock().await;

    if shared.opts.active <= shared.opts.idle {
        return doomed;
    }

    let mut k = 0;
    while k < inner.entries.len() && inner.size > shared.opts.idle {
        let entry = &inner.entries[k];
        if entry.status == EntryStatus::Dead && entry.refs <= 1 {
            let entry = inner.entries.remove(k);
            inner.size -= 1;
            doomed.push(entry.session);
            continue;
        }
        k += 1;
    }

    let mut live = inner.entries.iter().filter(|e| e.status != EntryStatus::Dead).count();
    let idle_timeout = shared.opts.idle_timeout;
    for entry in inner.entries.iter_mut() {
        if live <= shared.opts.idle {
            break;
        }
        if entry.status == EntryStatus::Idle
            && now.saturating_sub(entry.session.idle_at()) > idle_timeout
        {
            entry.status = EntryStatus::Dead;
            live -= 1;
        }
    }

    doomed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared(opts: PoolOptions) -> Arc<PoolShared> {
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                size: 0,
                shutdown: false,
            }),
            registry: Arc::new(RwLock::new(Registry::new())),
            next_id: AtomicU64::new(0),
            closed_tx,
            opts,
        })
    }

    async fn seed_idle_entry(shared: &Arc<PoolShared>, id: u64) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::stub(id));
        let mut inner = shared.inner.lock().await;
        inner.entries.push(PoolEntry {
            id,
            session: Arc::clone(&session),
            refs: 1,
            status: EntryStatus::Idle,
        });
        inner.size += 1;
        session
    }

    // Property: the most recently released session is preferred for the
    // next acquisition (releases rotate to the head, the scan starts
    // there).
    #[tokio::test]
    async fn acquisition_prefers_the_most_recent_release() {
        let shared = test_shared(PoolOptions::default().with_active(2));
        seed_idle_entry(&shared, 1).await;
        seed_idle_entry(&shared, 2).await;

        let (first, _) = acquire(&shared).await.unwrap();
        assert_eq!(first, 1);
        release(&shared, first).await;

        // Entry 1 was just released, so it wins over the never-used
        // entry 2.
        let (second, _) = acquire(&shared).await.unwrap();
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn acquire_reports_exhaustion_at_the_active_bound() {
        let shared = test_shared(PoolOptions::default().with_active(1));
        seed_idle_entry(&shared, 1).await;

        let (lease, _) = acquire(&shared).await.unwrap();
        assert!(matches!(acquire(&shared).await, Err(PackrpcError::NoAvailable)));

        release(&shared, lease).await;
        assert!(acquire(&shared).await.is_ok());
    }

    // Property: idle-expired sessions are marked dead in one pass and
    // removed in the next, never shrinking below the idle floor.
    #[tokio::test]
    async fn reaper_marks_then_removes_down_to_the_floor() {
        let shared = test_shared(
            PoolOptions::default()
                .with_idle(1)
                .with_active(4)
                .with_idle_timeout(200),
        );
        for id in 1..=4 {
            let session = seed_idle_entry(&shared, id).await;
            // Idle since the dawn of time.
            session.touch_idle(1);
        }

        // First pass: nothing dead yet, three entries marked.
        assert!(reap(&shared).await.is_empty());
        {
            let inner = shared.inner.lock().await;
            let dead = inner.entries.iter().filter(|e| e.status == EntryStatus::Dead).count();
            assert_eq!(dead, 3);
            assert_eq!(inner.size, 4);
        }

        // Second pass: the marked entries are collected for shutdown.
        let doomed = reap(&shared).await;
        assert_eq!(doomed.len(), 3);
        assert_eq!(shared.inner.lock().await.size, 1);

        // A stable pool is left untouched.
        assert!(reap(&shared).await.is_empty());
        assert_eq!(shared.inner.lock().await.size, 1);
    }

    #[tokio::test]
    async fn reaper_skips_leased_and_fresh_sessions() {
        let shared = test_shared(
            PoolOptions::default()
                .with_idle(1)
                .with_active(4)
                .with_idle_timeout(200),
        );
        let stale = seed_idle_entry(&shared, 1).await;
        stale.touch_idle(1);
        // Fresh idle entry and a leased entry must survive marking.
        seed_idle_entry(&shared, 2).await;
        let leased = seed_idle_entry(&shared, 3).await;
        leased.touch_idle(1);
        {
            let mut inner = shared.inner.lock().await;
            if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == 3) {
                entry.status = EntryStatus::InUse;
                entry.refs += 1;
            }
        }

        assert!(reap(&shared).await.is_empty());
        let inner = shared.inner.lock().await;
        for entry in &inner.entries {
            match entry.id {
                1 => assert_eq!(entry.status, EntryStatus::Dead),
                2 => assert_eq!(entry.status, EntryStatus::Idle),
                3 => assert_eq!(entry.status, EntryStatus::InUse),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn options_defaults_match_contract() {
        let opts = PoolOptions::default();
        assert_eq!(opts.name, "rpc/client");
        assert_eq!(opts.buffer_cap, 8192);
        assert_eq!(opts.out_chan_size, 32);
        assert_eq!(opts.socket_timeout, 60_000);
        assert_eq!(opts.timeout, 1_000);
        assert_eq!(opts.idle, 2);
        assert_eq!(opts.active, 2);
        assert_eq!(opts.idle_timeout, 120_000);
    }

    #[test]
    fn options_builder_overrides() {
        let opts = PoolOptions::default()
            .with_name("test/pool")
            .with_addr("127.0.0.1:9000")
            .with_buffer_cap(1024)
            .with_out_chan_size(8)
            .with_socket_timeout(2_000)
            .with_timeout(100)
            .with_idle(1)
            .with_active(4)
            .with_idle_timeout(200);
        assert_eq!(opts.name, "test/pool");
        assert_eq!(opts.addr, "127.0.0.1:9000");
        assert_eq!(opts.buffer_cap, 1024);
        assert_eq!(opts.out_chan_size, 8);
        assert_eq!(opts.socket_timeout, 2_000);
        assert_eq!(opts.timeout, 100);
        assert_eq!(opts.idle, 1);
        assert_eq!(opts.active, 4);
        assert_eq!(opts.idle_timeout, 200);
    }

    #[tokio::test]
    async fn new_fails_when_nothing_listens() {
        // Bind then drop to get a dead address.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let opts = PoolOptions::default().with_addr(addr).with_socket_timeout(200);
        assert!(Pool::new(opts).await.is_err());
    }

    #[tokio::test]
    async fn new_with_zero_idle_opens_nothing() {
        // No eager connections, so construction succeeds without a server.
        let opts = PoolOptions::default()
            .with_addr("127.0.0.1:1")
            .with_idle(0)
            .with_active(2);
        let pool = Pool::new(opts).await.unwrap();
        assert_eq!(pool.size().await, 0);
        assert_eq!(pool.name(), "rpc/client");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_after_shutdown_is_refused() {
        let opts = PoolOptions::default()
            .with_addr("127.0.0.1:1")
            .with_idle(0)
            .with_active(1)
            .with_socket_timeout(100);
        let pool = Pool::new(opts).await.unwrap();
        pool.shutdown().await;
        assert!(matches!(
            acquire(&pool.shared).await,
            Err(PackrpcError::ConnectionClosed)
        ));
    }
}
