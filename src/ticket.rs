//! One in-flight request.
//!
//! A ticket owns the outgoing frame, the slot its reply lands in, and the
//! condition variable its caller sleeps on. The session holds a reference
//! while the ticket is queued or awaited; the dispatcher holds one for the
//! waiter; interrupt companions hold one more. The ticket disappears when the
//! last reference does.

use std::mem::size_of;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::ll::Errno;
use crate::ll::Unique;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::Opcode;

/// A caller-owned bulk buffer riding along a WRITE request. The frame
/// references it; nothing below the public API copies it.
#[derive(Debug, Clone)]
pub(crate) struct SharedSlice {
    buf: Arc<[u8]>,
    range: Range<usize>,
}

impl SharedSlice {
    pub(crate) fn new(buf: Arc<[u8]>, range: Range<usize>) -> SharedSlice {
        debug_assert!(range.end <= buf.len());
        SharedSlice { buf, range }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[self.range.clone()]
    }

    pub(crate) fn len(&self) -> usize {
        self.range.len()
    }
}

/// The matched reply: a normalized error, or a payload.
#[derive(Debug)]
pub(crate) struct TicketReply {
    pub(crate) error: Option<Errno>,
    pub(crate) data: Vec<u8>,
}

impl TicketReply {
    pub(crate) fn error(errno: Errno) -> TicketReply {
        TicketReply {
            error: Some(errno),
            data: Vec::new(),
        }
    }
}

/// Runs when the reply (or failure) lands, before the waiter wakes.
pub(crate) type TicketHandler = Box<dyn FnOnce(&Arc<Ticket>, &TicketReply) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TicketPhase {
    /// Sitting in the outbound queue.
    Queued,
    /// Read by the server, awaiting its reply.
    Delivered,
}

#[derive(Debug)]
struct TicketStateInner {
    phase: TicketPhase,
    /// Completion has been claimed; at most one completion ever runs.
    answered: bool,
    /// Completion has finished: the reply (if kept) is stored and the
    /// handler has run. Waiters sleep on this, not on `answered`, so they
    /// never observe a half-delivered reply.
    done: bool,
    /// A killed ticket's reply is dropped instead of delivered: set for
    /// interrupt companions, oneway sends, and deadline-abandoned calls.
    killed: bool,
    reply: Option<TicketReply>,
}

/// One in-flight request.
pub(crate) struct Ticket {
    unique: Unique,
    opcode: Opcode,
    header: abi::fuse_in_header,
    payload: SmallVec<[u8; 64]>,
    data: Option<SharedSlice>,
    state: Mutex<TicketStateInner>,
    cond: Condvar,
    handler: Mutex<Option<TicketHandler>>,
    interrupt: Mutex<Option<Arc<Ticket>>>,
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("unique", &self.unique)
            .field("opcode", &self.opcode)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Ticket {
    pub(crate) fn new(
        unique: Unique,
        opcode: Opcode,
        nodeid: u64,
        caller: &crate::Caller,
        payload: &[u8],
        data: Option<SharedSlice>,
    ) -> Arc<Ticket> {
        let len = size_of::<abi::fuse_in_header>()
            + payload.len()
            + data.as_ref().map_or(0, SharedSlice::len);
        let header = abi::fuse_in_header {
            len: len as u32,
            opcode: opcode.into(),
            unique: unique.0,
            nodeid,
            uid: caller.uid,
            gid: caller.gid,
            pid: caller.pid,
            padding: 0,
        };
        Arc::new(Ticket {
            unique,
            opcode,
            header,
            payload: SmallVec::from_slice(payload),
            data,
            state: Mutex::new(TicketStateInner {
                phase: TicketPhase::Queued,
                answered: false,
                done: false,
                killed: false,
                reply: None,
            }),
            cond: Condvar::new(),
            handler: Mutex::new(None),
            interrupt: Mutex::new(None),
        })
    }

    pub(crate) fn unique(&self) -> Unique {
        self.unique
    }

    pub(crate) fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Credentials the request was issued with, for companion requests.
    pub(crate) fn caller(&self) -> crate::Caller {
        crate::Caller::new(self.header.uid, self.header.gid, self.header.pid)
    }

    /// Total size of the serialized request frame.
    pub(crate) fn frame_len(&self) -> usize {
        self.header.len as usize
    }

    /// Copies the framed request into `buf`, which must be large enough.
    pub(crate) fn write_frame(&self, buf: &mut [u8]) -> usize {
        let mut at = 0;
        for part in [
            self.header.as_bytes(),
            &self.payload,
            self.data.as_ref().map_or(&[][..], SharedSlice::as_slice),
        ] {
            buf[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        at
    }

    pub(crate) fn set_handler(&self, handler: TicketHandler) {
        *self.handler.lock() = Some(handler);
    }

    pub(crate) fn set_interrupt(&self, companion: Arc<Ticket>) {
        *self.interrupt.lock() = Some(companion);
    }

    pub(crate) fn take_interrupt(&self) -> Option<Arc<Ticket>> {
        self.interrupt.lock().take()
    }

    pub(crate) fn is_answered(&self) -> bool {
        self.state.lock().answered
    }

    pub(crate) fn mark_killed(&self) {
        self.state.lock().killed = true;
    }

    /// Flips a queued ticket to delivered. Returns `false` when the ticket
    /// was answered in the meantime (interrupt completed it first); the
    /// endpoint drops such a ticket instead of handing it to the server.
    pub(crate) fn mark_delivered(&self) -> bool {
        let mut state = self.state.lock();
        if state.answered {
            return false;
        }
        state.phase = TicketPhase::Delivered;
        true
    }

    pub(crate) fn phase(&self) -> TicketPhase {
        self.state.lock().phase
    }

    /// Delivers the reply: runs the completion handler, stores the reply
    /// (unless the ticket was killed), wakes the waiter. A second completion
    /// is a no-op, preserving deliver-at-most-once.
    pub(crate) fn complete(self: &Arc<Self>, reply: TicketReply) {
        {
            let mut state = self.state.lock();
            if state.answered {
                return;
            }
            state.answered = true;
        }
        // The handler may requeue companions on the session, so it must run
        // without the ticket state lock held (session lock precedes ticket
        // lock in the hierarchy).
        if let Some(handler) = self.handler.lock().take() {
            handler(self, &reply);
        }
        {
            let mut state = self.state.lock();
            if !state.killed {
                state.reply = Some(reply);
            }
            state.done = true;
        }
        self.cond.notify_all();
    }

    /// Completes with a bare error (session death, interrupt fast path).
    pub(crate) fn fail(self: &Arc<Self>, errno: Errno) {
        self.complete(TicketReply::error(errno));
    }

    /// Wakes the waiter without completing, so it can notice a cancel
    /// token or an expired deadline.
    pub(crate) fn nudge(&self) {
        self.cond.notify_all();
    }

    /// Blocks until the ticket completes or `deadline` passes. Returns
    /// whether it completed; spurious wakeups (including cancel nudges)
    /// return control to the caller's wait loop in `dispatch`.
    pub(crate) fn wait_answered(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        if state.done {
            return true;
        }
        match deadline {
            Some(deadline) => {
                self.cond.wait_until(&mut state, deadline);
            }
            None => self.cond.wait(&mut state),
        }
        state.done
    }

    /// Takes the stored reply after `wait_answered` returned true.
    pub(crate) fn take_reply(&self) -> Option<TicketReply> {
        self.state.lock().reply.take()
    }
}
