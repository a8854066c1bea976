//! One accepted connection on the server side.
//!
//! A server session mirrors the client session's task pair (reader +
//! writer over a bounded outbound mailbox) but carries no awaited-reply
//! slot: server-initiated calls toward a client are always fire-and-forget,
//! so inbound RESPONSE frames have nothing to rendezvous with and are
//! dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error};

use packrpc_common::dispatch;
use packrpc_common::protocol::{Direction, Frame, PackrpcError, Result};
use packrpc_common::registry::{CallContext, Registry};
use packrpc_common::transport::{validate_frame, FrameCodec};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-connection server state.
pub struct ServerSession {
    socket_id: u64,
    handle: AtomicU64,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Frame>,
    refs: AtomicI32,
    dead: AtomicBool,
    auth_at: AtomicU64,
    last_active: AtomicU64,
    stop: watch::Sender<bool>,
}

impl ServerSession {
    pub(crate) fn new(socket_id: u64, peer: Option<SocketAddr>, outbound: mpsc::Sender<Frame>) -> ServerSession {
        let (stop, _) = watch::channel(false);
        ServerSession {
            socket_id,
            handle: AtomicU64::new(0),
            peer,
            outbound,
            refs: AtomicI32::new(0),
            dead: AtomicBool::new(false),
            auth_at: AtomicU64::new(0),
            last_active: AtomicU64::new(now_millis()),
            stop,
        }
    }

    /// The socket-layer id this session was accepted under.
    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// The group-assigned snowflake handle.
    pub fn handle(&self) -> u64 {
        self.handle.load(Ordering::Acquire)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// When the handshake byte was written; 0 until then.
    pub fn auth_at(&self) -> u64 {
        self.auth_at.load(Ordering::Acquire)
    }

    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Acquire)
    }

    pub(crate) fn bind_handle(&self, handle: u64) {
        self.handle.store(handle, Ordering::Release);
    }

    pub(crate) fn mark_authenticated(&self, now: u64) {
        self.auth_at.store(now, Ordering::Release);
    }

    pub(crate) fn touch(&self, now: u64) {
        self.last_active.store(now, Ordering::Release);
    }

    pub(crate) fn set_refs(&self, refs: i32) {
        self.refs.store(refs, Ordering::Release);
    }

    pub(crate) fn inc_refs(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_refs(&self) -> i32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Stop the session's tasks. Idempotent.
    pub(crate) fn halt(&self) {
        self.mark_dead();
        let _ = self.stop.send(true);
    }

    /// Fire-and-forget request toward the connected client (serial 0).
    pub async fn call(&self, method: &str, payload: Option<(String, Vec<u8>)>) -> Result<()> {
        if self.is_dead() {
            return Err(PackrpcError::ConnectionClosed);
        }
        let frame = Frame::request(method, 0, payload);
        validate_frame(&frame)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| PackrpcError::ConnectionClosed)
    }
}

/// Drain the session's outbound mailbox onto the socket.
pub(crate) async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Frame>,
    mut stop_rx: watch::Receiver<bool>,
    mut codec: FrameCodec,
    session: Arc<ServerSession>,
) {
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                buf.clear();
                if let Err(err) = codec.encode(frame, &mut buf) {
                    error!(handle = session.handle(), %err, "frame encode failed, closing session");
                    break;
                }
                if let Err(err) = write_half.write_all(&buf).await {
                    debug!(handle = session.handle(), %err, "socket write failed");
                    break;
                }
            }
        }
    }
    session.halt();
}

/// Read, decode, and dispatch until the connection dies or a protocol
/// error closes it. Returns the receive buffer for recycling.
pub(crate) async fn read_loop(
    mut read_half: OwnedReadHalf,
    mut stop_rx: watch::Receiver<bool>,
    mut codec: FrameCodec,
    mut buf: BytesMut,
    registry: Arc<RwLock<Registry>>,
    out_tx: mpsc::Sender<Frame>,
    session: Arc<ServerSession>,
) -> BytesMut {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(handle = session.handle(), "peer closed the connection");
                    break;
                }
                Ok(_) => {
                    if let Err(err) = drain_frames(&mut codec, &mut buf, &registry, &out_tx, &session).await {
                        error!(handle = session.handle(), %err, "protocol error, closing session");
                        break;
                    }
                }
                Err(err) => {
                    debug!(handle = session.handle(), %err, "socket read failed");
                    break;
                }
            }
        }
    }

    session.halt();
    buf
}

async fn drain_frames(
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
    registry: &Arc<RwLock<Registry>>,
    out_tx: &mpsc::Sender<Frame>,
    session: &Arc<ServerSession>,
) -> Result<()> {
    while let Some(frame) = codec.decode(buf)? {
        session.touch(now_millis());
        match frame.direction {
            Direction::Request => {
                let reply = {
                    let ctx = CallContext::new(session.handle(), session.peer(), out_tx.clone());
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
                // The server never awaits a reply.
                debug!(
                    handle = session.handle(),
                    serial = frame.serial,
                    method = %frame.method,
                    "unexpected rpc response on server session, dropping"
                );
            }
        }
    }
    Ok(())
}
