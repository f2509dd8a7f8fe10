//! Per-mount session state.
//!
//! A session binds one mount to one endpoint slot. It owns the outbound FIFO
//! the server reads from, the awaited map replies are matched against, the
//! unique-id counter, the negotiated capabilities and the sticky mask of
//! opcodes the daemon answered ENOSYS to. Tickets enter the awaited map
//! before the outbound queue, so the server can never read a request whose id
//! is not yet matchable.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::device::AlterVnode;
use crate::ll::Errno;
use crate::ll::Unique;
use crate::ll::Version;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::InitFlags;
use crate::ll::fuse_abi::Opcode;
use crate::ticket::Ticket;
use crate::ticket::TicketPhase;
use crate::ticket::TicketReply;

/// The max size of write requests. The absolute minimum is 4k, but 16M
/// keeps bulk I/O round-trips low on the in-process transport too.
pub const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the buffer a server needs to receive any request frame.
pub const BUFFER_SIZE: usize = MAX_WRITE_SIZE + 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Attached to a slot, INIT not yet on the wire.
    Created,
    /// INIT queued, reply pending.
    InitSent,
    /// Handshake complete; requests flow.
    Ready,
    /// Dead flag set, but the slot or the mount still refers to it.
    Dying,
    /// Unmounted and the device closed; nothing refers to it anymore.
    Dead,
}

impl SessionState {
    fn is_dead(self) -> bool {
        matches!(self, SessionState::Dying | SessionState::Dead)
    }
}

/// What the daemon agreed to during INIT.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Negotiated {
    pub(crate) proto: Version,
    pub(crate) flags: InitFlags,
    pub(crate) max_write: u32,
}

impl Default for Negotiated {
    fn default() -> Self {
        Negotiated {
            proto: Version { major: 0, minor: 0 },
            flags: InitFlags::empty(),
            max_write: MAX_WRITE_SIZE as u32,
        }
    }
}

/// Adapter-side operations the endpoint may trigger on behalf of the server
/// (the alter-vnode ioctl).
pub(crate) trait MountHooks: Send + Sync {
    fn alter_vnode(&self, alter: &AlterVnode) -> Result<(), Errno>;
}

#[derive(Debug)]
struct SessionQueue {
    outbound: VecDeque<Arc<Ticket>>,
    state: SessionState,
}

/// Shared state of one mounted filesystem.
pub(crate) struct Session {
    owner_pid: u32,
    nonce: u64,
    blocksize: u32,
    daemon_timeout: Option<Duration>,
    queue: Mutex<SessionQueue>,
    reader_cv: Condvar,
    awaited: Mutex<HashMap<u64, Arc<Ticket>>>,
    next_unique: AtomicU64,
    notimpl: AtomicU64,
    init_done: AtomicBool,
    mounted: AtomicBool,
    negotiated: Mutex<Negotiated>,
    hooks: Mutex<Option<Weak<dyn MountHooks>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner_pid", &self.owner_pid)
            .field("state", &self.queue.lock().state)
            .field("awaited", &self.awaited.lock().len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        owner_pid: u32,
        nonce: u64,
        blocksize: u32,
        daemon_timeout: Option<Duration>,
    ) -> Arc<Session> {
        Arc::new(Session {
            owner_pid,
            nonce,
            blocksize,
            daemon_timeout,
            queue: Mutex::new(SessionQueue {
                outbound: VecDeque::new(),
                state: SessionState::Created,
            }),
            reader_cv: Condvar::new(),
            awaited: Mutex::new(HashMap::new()),
            next_unique: AtomicU64::new(1),
            notimpl: AtomicU64::new(0),
            init_done: AtomicBool::new(false),
            mounted: AtomicBool::new(false),
            negotiated: Mutex::new(Negotiated::default()),
            hooks: Mutex::new(None),
        })
    }

    pub(crate) fn nonce(&self) -> u64 {
        self.nonce
    }

    pub(crate) fn blocksize(&self) -> u32 {
        self.blocksize
    }

    pub(crate) fn daemon_timeout(&self) -> Option<Duration> {
        self.daemon_timeout
    }

    /// Allocates the next request id, skipping zero on wraparound.
    pub(crate) fn next_unique(&self) -> Unique {
        loop {
            let id = self.next_unique.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return Unique(id);
            }
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.queue.lock().state.is_dead()
    }

    pub(crate) fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub(crate) fn init_done(&self) -> bool {
        self.init_done.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_init_sent(&self) {
        let mut q = self.queue.lock();
        if q.state == SessionState::Created {
            q.state = SessionState::InitSent;
        }
    }

    /// Records the daemon's INIT answer and opens the session for traffic.
    pub(crate) fn complete_init(&self, negotiated: Negotiated) {
        *self.negotiated.lock() = negotiated;
        self.init_done.store(true, Ordering::SeqCst);
        let mut q = self.queue.lock();
        if q.state == SessionState::InitSent {
            q.state = SessionState::Ready;
        }
    }

    pub(crate) fn negotiated(&self) -> Negotiated {
        *self.negotiated.lock()
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn MountHooks>) {
        *self.hooks.lock() = Some(hooks);
    }

    pub(crate) fn alter_vnode(&self, alter: &AlterVnode) -> Result<(), Errno> {
        let hooks = self
            .hooks
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Errno::ENODEV)?;
        hooks.alter_vnode(alter)
    }

    // --- not-implemented mask ---

    pub(crate) fn is_not_implemented(&self, opcode: Opcode) -> bool {
        match opcode.noimpl_bit() {
            Some(bit) => self.notimpl.load(Ordering::Relaxed) & (1 << bit) != 0,
            None => false,
        }
    }

    pub(crate) fn set_not_implemented(&self, opcode: Opcode) {
        if let Some(bit) = opcode.noimpl_bit() {
            self.notimpl.fetch_or(1 << bit, Ordering::Relaxed);
        }
    }

    /// Replaces the whole mask (the set-implemented-bits ioctl).
    pub(crate) fn store_notimpl_mask(&self, mask: u64) {
        self.notimpl.store(mask, Ordering::Relaxed);
    }

    // --- outbound queue and awaited map ---

    /// Publishes a ticket: awaited first (unless `oneway`), then the FIFO.
    pub(crate) fn enqueue(&self, ticket: &Arc<Ticket>, oneway: bool) -> Result<(), Errno> {
        if !oneway {
            self.awaited
                .lock()
                .insert(ticket.unique().0, ticket.clone());
        }
        let mut q = self.queue.lock();
        if q.state.is_dead() {
            drop(q);
            self.awaited.lock().remove(&ticket.unique().0);
            return Err(Errno::ENOTCONN);
        }
        q.outbound.push_back(ticket.clone());
        drop(q);
        self.reader_cv.notify_one();
        Ok(())
    }

    /// Head-inserts an interrupt companion so it overtakes ordinary traffic.
    fn enqueue_front(&self, ticket: &Arc<Ticket>) -> Result<(), Errno> {
        self.awaited
            .lock()
            .insert(ticket.unique().0, ticket.clone());
        let mut q = self.queue.lock();
        if q.state.is_dead() {
            drop(q);
            self.awaited.lock().remove(&ticket.unique().0);
            return Err(Errno::ENOTCONN);
        }
        q.outbound.push_front(ticket.clone());
        drop(q);
        self.reader_cv.notify_one();
        Ok(())
    }

    /// Pops the next deliverable ticket for the server. Tickets answered
    /// while still queued (interrupt fast path) are dropped here instead of
    /// delivered. Blocks when the queue is empty unless `blocking` is false.
    pub(crate) fn pop_next(&self, blocking: bool) -> Result<Arc<Ticket>, Errno> {
        let mut q = self.queue.lock();
        loop {
            if q.state.is_dead() {
                return Err(Errno::ENODEV);
            }
            if let Some(ticket) = q.outbound.pop_front() {
                if ticket.mark_delivered() {
                    return Ok(ticket);
                }
                self.awaited.lock().remove(&ticket.unique().0);
                debug!(
                    "dropping answered ticket {} before delivery",
                    ticket.unique()
                );
                continue;
            }
            if !blocking {
                return Err(Errno::EAGAIN);
            }
            self.reader_cv.wait(&mut q);
        }
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.lock().outbound.len()
    }

    /// Matches a reply to its ticket. Unmatched replies are dropped
    /// silently (late or duplicate).
    pub(crate) fn complete_reply(&self, unique: u64, reply: TicketReply) {
        match self.awaited.lock().remove(&unique) {
            Some(ticket) => ticket.complete(reply),
            None => debug!("dropping reply for unknown unique {unique}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_awaited(&self, unique: Unique) -> bool {
        self.awaited.lock().contains_key(&unique.0)
    }

    /// Sets the dead flag, drains every awaited ticket with "connection
    /// lost" and wakes all readers. Idempotent.
    pub(crate) fn mark_dead(&self, why: &str) {
        {
            let mut q = self.queue.lock();
            if q.state.is_dead() {
                return;
            }
            q.state = SessionState::Dying;
            q.outbound.clear();
        }
        warn!("session (server pid {}) dead: {why}", self.owner_pid);
        let drained: Vec<Arc<Ticket>> = self.awaited.lock().drain().map(|(_, t)| t).collect();
        for ticket in drained {
            ticket.fail(Errno::ENOTCONN);
        }
        self.reader_cv.notify_all();
    }

    /// Final transition once neither the mount nor the device refers to
    /// this session.
    pub(crate) fn destroy(&self) {
        let mut q = self.queue.lock();
        q.state = SessionState::Dead;
        q.outbound.clear();
    }

    // --- interrupts ---

    /// Interrupts a waiting call. A ticket the server has not read yet
    /// completes immediately with EINTR; a delivered one gets an INTERRUPT
    /// companion head-inserted on the queue.
    pub(crate) fn interrupt(self: &Arc<Self>, ticket: &Arc<Ticket>) {
        let still_queued = {
            let _q = self.queue.lock();
            ticket.phase() == TicketPhase::Queued && !ticket.is_answered()
        };
        if still_queued {
            self.awaited.lock().remove(&ticket.unique().0);
            ticket.fail(Errno::EINTR);
            return;
        }
        if ticket.is_answered() {
            return;
        }
        self.send_interrupt(ticket);
    }

    /// Queues a fresh INTERRUPT companion for `original`. Also used to
    /// re-send after the daemon answered EAGAIN; a companion is never reused.
    fn send_interrupt(self: &Arc<Self>, original: &Arc<Ticket>) {
        let payload = abi::fuse_interrupt_in {
            unique: original.unique().0,
        };
        let companion = Ticket::new(
            self.next_unique(),
            Opcode::Interrupt,
            0,
            &original.caller(),
            payload.as_bytes(),
            None,
        );
        companion.mark_killed();
        let session = Arc::downgrade(self);
        let original_ref = original.clone();
        companion.set_handler(Box::new(move |_companion, reply| {
            if reply.error == Some(Errno::EAGAIN) && !original_ref.is_answered() {
                if let Some(session) = session.upgrade() {
                    session.send_interrupt(&original_ref);
                }
            }
        }));
        original.set_interrupt(companion.clone());
        if self.enqueue_front(&companion).is_err() {
            // Session died under us; the original was already drained.
            debug!("interrupt for {} not sent, session dead", original.unique());
        }
    }
}
