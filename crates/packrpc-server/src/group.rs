//! The session group: handle and socket-id bookkeeping for live
//! connections.
//!
//! Handles are snowflake-style 64-bit ids seeded by the server id, so
//! handles stay unique across servers sharing an id space. Receive buffers
//! are recycled through a bounded free list so short-lived connections do
//! not churn allocations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::Mutex;

use packrpc_common::protocol::{PackrpcError, Result};

use crate::session::ServerSession;

const WORKER_ID_MASK: u64 = 0x1F;
const WORKER_ID_SHIFT: u64 = 5;

/// Snowflake-style handle generator: 41 bits of milliseconds, 5 bits of
/// worker id, 5 bits of sub-worker id, 12 bits of sequence.
struct Snowflake {
    worker: u64,
    sub_worker: u64,
    last_ms: u64,
    sequence: u64,
}

impl Snowflake {
    const SEQUENCE_MASK: u64 = 0xFFF;

    fn new(server_id: u64) -> Snowflake {
        Snowflake {
            worker: (server_id >> WORKER_ID_SHIFT) & WORKER_ID_MASK,
            sub_worker: server_id & WORKER_ID_MASK,
            last_ms: 0,
            sequence: 0,
        }
    }

    fn next(&mut self) -> u64 {
        let mut now = Self::millis();
        if now == self.last_ms {
            self.sequence = (self.sequence + 1) & Self::SEQUENCE_MASK;
            if self.sequence == 0 {
                // Sequence space for this millisecond is spent.
                while now <= self.last_ms {
                    now = Self::millis();
                }
            }
        } else {
            self.sequence = 0;
        }
        self.last_ms = now;

        (now << 22) | (self.worker << 17) | (self.sub_worker << 12) | self.sequence
    }

    fn millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

struct GroupInner {
    handles: HashMap<u64, Arc<ServerSession>>,
    sockets: HashMap<u64, u64>,
    size: usize,
}

/// Registry of live server sessions plus the receive-buffer free list.
pub struct Group {
    inner: Mutex<GroupInner>,
    snowflake: Mutex<Snowflake>,
    buffers: Mutex<Vec<BytesMut>>,
    buffer_cap: usize,
    cap: usize,
}

impl Group {
    /// Free-list bound: buffers beyond this are dropped instead of shelved.
    const FREE_LIST_LIMIT: usize = 64;

    pub fn new(server_id: u64, cap: usize, buffer_cap: usize) -> Group {
        Group {
            inner: Mutex::new(GroupInner {
                handles: HashMap::new(),
                sockets: HashMap::new(),
                size: 0,
            }),
            snowflake: Mutex::new(Snowflake::new(server_id)),
            buffers: Mutex::new(Vec::new()),
            buffer_cap,
            cap,
        }
    }

    /// Admit a session: assign a fresh handle, index it by handle and
    /// socket id, and set its reference count to 2 (owning group + accept
    /// notification).
    ///
    /// Fails with `ConnectionFull` once occupancy has reached the cap.
    pub fn occupy(&self, session: &Arc<ServerSession>) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.size >= self.cap {
            return Err(PackrpcError::ConnectionFull);
        }

        let handle = self.snowflake.lock().next();
        session.bind_handle(handle);
        session.set_refs(2);
        inner.handles.insert(handle, Arc::clone(session));
        inner.sockets.insert(session.socket_id(), handle);
        inner.size += 1;

        Ok(handle)
    }

    /// Look a session up by handle, incrementing its reference count.
    /// Callers pair this with [`Group::release`].
    pub fn grab(&self, handle: u64) -> Option<Arc<ServerSession>> {
        let inner = self.inner.lock();
        let session = inner.handles.get(&handle)?;
        session.inc_refs();
        Some(Arc::clone(session))
    }

    /// Look a session up by socket id, incrementing its reference count.
    pub fn grab_socket(&self, socket_id: u64) -> Option<Arc<ServerSession>> {
        let inner = self.inner.lock();
        let handle = inner.sockets.get(&socket_id)?;
        let session = inner.handles.get(handle)?;
        session.inc_refs();
        Some(Arc::clone(session))
    }

    /// Drop the reference taken by a grab.
    pub fn release(&self, session: &ServerSession) {
        session.dec_refs();
    }

    /// Remove the session a closing socket belongs to.
    ///
    /// Marks it dead, drops both map entries, and releases the group's own
    /// reference plus the accept-notification reference. Returns the
    /// session's handle so the close callback can be fired.
    pub fn close_socket(&self, socket_id: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let handle = inner.sockets.remove(&socket_id)?;
        let session = inner.handles.remove(&handle)?;
        inner.size -= 1;
        session.mark_dead();
        session.dec_refs();
        session.dec_refs();
        Some(handle)
    }

    /// Remove every session, for shutdown. The returned sessions are
    /// halted by the caller.
    pub fn drain(&self) -> Vec<Arc<ServerSession>> {
        let mut inner = self.inner.lock();
        inner.sockets.clear();
        inner.size = 0;
        let sessions: Vec<_> = inner.handles.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.mark_dead();
        }
        sessions
    }

    /// Sessions idle longer than `keep_time` milliseconds.
    pub fn stale_sessions(&self, now: u64, keep_time: u64) -> Vec<Arc<ServerSession>> {
        let inner = self.inner.lock();
        inner
            .handles
            .values()
            .filter(|s| now.saturating_sub(s.last_active()) > keep_time)
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Handles of every connected session.
    pub fn handles(&self) -> Vec<u64> {
        self.inner.lock().handles.keys().copied().collect()
    }

    /// Take a receive buffer from the free list, or allocate a fresh one.
    pub fn take_buffer(&self) -> BytesMut {
        match self.buffers.lock().pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.buffer_cap),
        }
    }

    /// Return a receive buffer for reuse. The buffer is cleared first.
    pub fn put_buffer(&self, mut buf: BytesMut) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < Self::FREE_LIST_LIMIT {
            buffers.push(buf);
        }
    }
}
