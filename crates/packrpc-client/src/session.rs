//! One pooled client connection and its processing loop.
//!
//! A session owns a TCP connection past its handshake: a reader task that
//! drives the frame codec and dispatches decoded frames, a writer task that
//! drains the session's bounded outbound mailbox, a 28-bit serial
//! allocator, and the single awaited-reply slot that rendezvouses a
//! `call_return` with its response frame.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, warn};

use packrpc_common::dispatch;
use packrpc_common::protocol::{Direction, Frame, PackrpcError, Result, SERIAL_MAX};
use packrpc_common::registry::{CallContext, Registry};
use packrpc_common::transport::{self, validate_frame, FrameCodec};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Connection parameters a session needs from the pool options.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub buffer_cap: usize,
    pub out_chan_size: usize,
    pub socket_timeout: u64,
}

struct Awaited {
    serial: u32,
    tx: oneshot::Sender<Box<dyn Any + Send>>,
}

/// The single awaited-reply slot.
///
/// Installed by the calling task, cleared by the first of {reply arrives,
/// timeout, shutdown}. Serial-checked operations keep late or foreign
/// replies from touching a newer call.
struct ReplySlot(Mutex<Option<Awaited>>);

impl ReplySlot {
    fn new() -> ReplySlot {
        ReplySlot(Mutex::new(None))
    }

    fn install(&self, serial: u32) -> Result<oneshot::Receiver<Box<dyn Any + Send>>> {
        let mut slot = self.0.lock();
        if slot.is_some() {
            return Err(PackrpcError::CallInProgress);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(Awaited { serial, tx });
        Ok(rx)
    }

    fn clear_if(&self, serial: u32) {
        let mut slot = self.0.lock();
        if slot.as_ref().is_some_and(|awaited| awaited.serial == serial) {
            *slot = None;
        }
    }

    /// Hand a reply to the waiting caller if the serial matches the
    /// installed one. Returns whether the reply was delivered.
    fn deliver(&self, serial: u32, value: Box<dyn Any + Send>) -> bool {
        let mut slot = self.0.lock();
        if slot.as_ref().is_some_and(|awaited| awaited.serial == serial) {
            if let Some(awaited) = slot.take() {
                return awaited.tx.send(value).is_ok();
            }
        }
        false
    }
}

/// A client-side connection session.
pub struct ClientSession {
    id: u64,
    addr: String,
    outbound: mpsc::Sender<Frame>,
    serial: AtomicU32,
    slot: ReplySlot,
    stop: watch::Sender<bool>,
    connected: AtomicBool,
    auth_at: u64,
    idle_at: AtomicU64,
}

impl ClientSession {
    /// Open a connection, verify the server handshake, and spawn the
    /// session's reader and writer tasks.
    ///
    /// `closed_tx` is the session's non-owning back-reference to the pool:
    /// the reader task reports the session id on it when the connection
    /// dies, so the pool can mark the entry for the reaper.
    pub(crate) async fn connect(
        id: u64,
        addr: &str,
        config: &SessionConfig,
        registry: Arc<RwLock<Registry>>,
        closed_tx: mpsc::UnboundedSender<u64>,
    ) -> Result<Arc<ClientSession>> {
        let stream = transport::connect(addr, config.socket_timeout).await?;
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let (out_tx, out_rx) = mpsc::channel(config.out_chan_size);
        let (stop_tx, _) = watch::channel(false);
        let now = now_millis();

        let session = Arc::new(ClientSession {
            id,
            addr: addr.to_string(),
            outbound: out_tx.clone(),
            serial: AtomicU32::new(0),
            slot: ReplySlot::new(),
            stop: stop_tx,
            connected: AtomicBool::new(true),
            auth_at: now,
            idle_at: AtomicU64::new(now),
        });

        let reader_stop = session.stop.subscribe();
        let writer_stop = session.stop.subscribe();

        tokio::spawn(write_loop(
            write_half,
            out_rx,
            writer_stop,
            FrameCodec::new(config.buffer_cap),
            Arc::clone(&session),
        ));
        tokio::spawn(read_loop(
            read_half,
            reader_stop,
            FrameCodec::new(config.buffer_cap),
            config.buffer_cap,
            registry,
            peer,
            out_tx,
            Arc::clone(&session),
            closed_tx,
        ));

        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Monotonic time (ms since epoch) the handshake byte was verified.
    pub fn auth_at(&self) -> u64 {
        self.auth_at
    }

    /// Timestamp of the most recent release back to the pool.
    pub fn idle_at(&self) -> u64 {
        self.idle_at.load(Ordering::Acquire)
    }

    pub(crate) fn touch_idle(&self, now: u64) {
        self.idle_at.store(now, Ordering::Release);
    }

    /// Stop the session: mark it disconnected and wake its tasks and any
    /// awaiting caller. Idempotent.
    pub(crate) fn halt(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.stop.send(true);
    }

    /// Fire-and-forget request: serial 0, no reply expected.
    pub async fn call(&self, method: &str, payload: Option<(String, Vec<u8>)>) -> Result<()> {
        if !self.is_connected() {
            return Err(PackrpcError::ConnectionClosed);
        }
        let frame = Frame::request(method, 0, payload);
        validate_frame(&frame)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| PackrpcError::ConnectionClosed)
    }

    /// Request expecting a reply.
    ///
    /// Installs the awaited-reply slot with a fresh serial, writes the
    /// frame, then waits for the first of: the matching reply, the
    /// session's stop signal (`ConnectionClosed`), or `timeout_ms`
    /// elapsing (`Timeout`). The slot is cleared on every exit path; a
    /// stale reply with a different serial never reaches this call.
    pub async fn call_return(
        &self,
        method: &str,
        payload: Option<(String, Vec<u8>)>,
        timeout_ms: u64,
    ) -> Result<Box<dyn Any + Send>> {
        if !self.is_connected() {
            return Err(PackrpcError::ConnectionClosed);
        }

        let serial = self.next_serial();
        let reply_rx = self.slot.install(serial)?;

        let frame = Frame::request(method, serial, payload);
        if let Err(err) = validate_frame(&frame) {
            self.slot.clear_if(serial);
            return Err(err);
        }
        if self.outbound.send(frame).await.is_err() {
            self.slot.clear_if(serial);
            return Err(PackrpcError::ConnectionClosed);
        }

        let mut stop_rx = self.stop.subscribe();
        if *stop_rx.borrow_and_update() {
            self.slot.clear_if(serial);
            return Err(PackrpcError::ConnectionClosed);
        }

        tokio::select! {
            // When a close races a reply, the close signal wins.
            biased;
            _ = stop_rx.changed() => {
                self.slot.clear_if(serial);
                Err(PackrpcError::ConnectionClosed)
            }
            reply = reply_rx => match reply {
                // The slot was already cleared by the delivering reader.
                Ok(value) => Ok(value),
                Err(_) => {
                    self.slot.clear_if(serial);
                    Err(PackrpcError::ConnectionClosed)
                }
            },
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                self.slot.clear_if(serial);
                Err(PackrpcError::Timeout(timeout_ms))
            }
        }
    }

    /// Detached session for exercising pool and slot logic without a
    /// socket.
    #[cfg(test)]
    pub(crate) fn stub(id: u64) -> ClientSession {
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        let now = now_millis();
        ClientSession {
            id,
            addr: "127.0.0.1:0".to_string(),
            outbound: out_tx,
            serial: AtomicU32::new(0),
            slot: ReplySlot::new(),
            stop: stop_tx,
            connected: AtomicBool::new(true),
            auth_at: now,
            idle_at: AtomicU64::new(now),
        }
    }

    /// Allocate the next serial from the 28-bit space, skipping 0, which is
    /// reserved for fire-and-forget.
    fn next_serial(&self) -> u32 {
        loop {
            let current = self.serial.load(Ordering::Relaxed);
            let mut next = (current + 1) & SERIAL_MAX;
            if next == 0 {
                next = 1;
            }
            if self
                .serial
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Frame>,
    mut stop_rx: watch::Receiver<bool>,
    mut codec: FrameCodec,
    session: Arc<ClientSession>,
) {
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                buf.clear();
                if let Err(err) = codec.encode(frame, &mut buf) {
                    error!(session = session.id(), %err, "frame encode failed, closing session");
                    break;
                }
                if let Err(err) = write_half.write_all(&buf).await {
                    debug!(session = session.id(), %err, "socket write failed");
                    break;
                }
            }
        }
    }
    session.halt();
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut read_half: OwnedReadHalf,
    mut stop_rx: watch::Receiver<bool>,
    mut codec: FrameCodec,
    buffer_cap: usize,
    registry: Arc<RwLock<Registry>>,
    peer: Option<std::net::SocketAddr>,
    out_tx: mpsc::Sender<Frame>,
    session: Arc<ClientSession>,
    closed_tx: mpsc::UnboundedSender<u64>,
) {
    let mut buf = BytesMut::with_capacity(buffer_cap);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(session = session.id(), "peer closed the connection");
                    break;
                }
                Ok(_) => {
                    if let Err(err) =
                        drain_frames(&mut codec, &mut buf, &registry, peer, &out_tx, &session).await
                    {
                        error!(session = session.id(), %err, "protocol error, closing session");
                        break;
                    }
                }
                Err(err) => {
                    debug!(session = session.id(), %err, "socket read failed");
                    break;
                }
            }
        }
    }

    session.halt();
    let _ = closed_tx.send(session.id());
}

/// Decode every complete frame buffered so far and dispatch it.
async fn drain_frames(
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
    registry: &Arc<RwLock<Registry>>,
    peer: Option<std::net::SocketAddr>,
    out_tx: &mpsc::Sender<Frame>,
    session: &Arc<ClientSession>,
) -> Result<()> {
    while let Some(frame) = codec.decode(buf)? {
        match frame.direction {
            Direction::Request => {
                // Server-initiated callback toward a service registered on
                // the pool.
                let reply = {
                    let ctx = CallContext::new(session.id(), peer, out_tx.clone());
                    let registry = registry.read();
                    dispatch::handle_request(&registry, &ctx, &frame)
                };
                if let Some(reply) = reply {
                    if out_tx.send(reply).await.is_err() {
                        return Err(PackrpcError::ConnectionClosed);
                    }
                }
            }
            Direction::Response => {
                let value = {
                    let registry = registry.read();
                    dispatch::decode_reply(&registry, &frame)
                };
                if let Some(value) = value {
                    if !session.slot.deliver(frame.serial, value) {
                        warn!(
                            session = session.id(),
                            serial = frame.serial,
                            method = %frame.method,
                            "unmatched rpc response, dropping"
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_session() -> ClientSession {
        ClientSession::stub(1)
    }

    #[test]
    fn serials_increment_from_one() {
        let session = stub_session();
        assert_eq!(session.next_serial(), 1);
        assert_eq!(session.next_serial(), 2);
        assert_eq!(session.next_serial(), 3);
    }

    #[test]
    fn serials_wrap_and_skip_zero() {
        let session = stub_session();
        session.serial.store(SERIAL_MAX - 1, Ordering::Relaxed);
        assert_eq!(session.next_serial(), SERIAL_MAX);
        // The wrap lands on 0, which is reserved, so allocation continues
        // at 1.
        assert_eq!(session.next_serial(), 1);
    }

    #[test]
    fn slot_rejects_second_install() {
        let session = stub_session();
        let _rx = session.slot.install(5).unwrap();
        assert!(matches!(session.slot.install(6), Err(PackrpcError::CallInProgress)));
    }

    #[test]
    fn slot_clear_if_only_matches_own_serial() {
        let session = stub_session();
        let _rx = session.slot.install(5).unwrap();

        // A foreign serial must not clear the slot.
        session.slot.clear_if(6);
        assert!(matches!(session.slot.install(7), Err(PackrpcError::CallInProgress)));

        session.slot.clear_if(5);
        assert!(session.slot.install(7).is_ok());
    }

    #[tokio::test]
    async fn slot_delivers_matching_serial_once() {
        let session = stub_session();
        let rx = session.slot.install(5).unwrap();

        assert!(!session.slot.deliver(4, Box::new(()) as Box<dyn Any + Send>));
        assert!(session.slot.deliver(5, Box::new(41u32) as Box<dyn Any + Send>));
        // The slot is now empty: a second delivery has nowhere to go.
        assert!(!session.slot.deliver(5, Box::new(42u32) as Box<dyn Any + Send>));

        let value = rx.await.unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 41);
    }

    #[tokio::test]
    async fn call_on_halted_session_fails_closed() {
        let session = stub_session();
        session.halt();
        assert!(matches!(
            session.call("Svc.Ping", None).await,
            Err(PackrpcError::ConnectionClosed)
        ));
        assert!(matches!(
            session.call_return("Svc.A", None, 50).await,
            Err(PackrpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn call_return_rejects_oversized_method_name() {
        let session = stub_session();
        let method = "m".repeat(80);
        let result = session.call_return(&method, None, 50).await;
        assert!(matches!(result, Err(PackrpcError::BadName)));
        // The slot must be released on the failure path.
        assert!(session.slot.install(1).is_ok());
    }
}
