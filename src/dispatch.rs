//! Request dispatch.
//!
//! `dispatch` is the single entry the adapter funnels every wire operation
//! through: it allocates a ticket, publishes it to the session, blocks the
//! calling thread, and returns the matched reply or a structured error.
//! Optional opcodes the daemon answered ENOSYS to are short-circuited here
//! on later calls without touching the wire.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::Mutex;

use crate::Caller;
use crate::ll::Errno;
use crate::ll::NodeId;
use crate::ll::fuse_abi::Opcode;
use crate::session::Session;
use crate::ticket::SharedSlice;
use crate::ticket::Ticket;
use crate::ticket::TicketReply;

/// Cooperative cancellation for a blocked call, the transport's stand-in
/// for a delivered signal. Cloneable; cancelling any clone interrupts every
/// call that was given the token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<Ticket>>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Flags the token and wakes every registered waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        for ticket in self.inner.waiters.lock().drain(..) {
            if let Some(ticket) = ticket.upgrade() {
                ticket.nudge();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, ticket: &Arc<Ticket>) {
        self.inner.waiters.lock().push(Arc::downgrade(ticket));
    }
}

/// Per-call knobs: an optional absolute deadline and an optional cancel
/// token. Deadline expiry behaves like an interrupt and then abandons the
/// call; a cancelled token sends INTERRUPT but keeps waiting for the reply.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DispatchOptions<'a> {
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancel: Option<&'a CancelToken>,
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Sends one request and waits for its reply.
pub(crate) fn dispatch(
    session: &Arc<Session>,
    caller: &Caller,
    opcode: Opcode,
    nodeid: NodeId,
    payload: &[u8],
    data: Option<SharedSlice>,
    opts: DispatchOptions<'_>,
) -> Result<TicketReply, Errno> {
    if session.is_dead() {
        return Err(Errno::ENOTCONN);
    }
    if !session.init_done() && opcode != Opcode::Init {
        return Err(Errno::ENOTCONN);
    }
    if session.is_not_implemented(opcode) {
        return Err(Errno::ENOSYS);
    }

    let ticket = Ticket::new(
        session.next_unique(),
        opcode,
        nodeid.0,
        caller,
        payload,
        data,
    );
    if let Some(cancel) = opts.cancel {
        cancel.register(&ticket);
    }
    session.enqueue(&ticket, false)?;

    let daemon_deadline = session.daemon_timeout().map(|t| Instant::now() + t);
    let mut interrupt_sent = false;
    loop {
        if ticket.wait_answered(earliest(opts.deadline, daemon_deadline)) {
            break;
        }
        if let Some(cancel) = opts.cancel {
            if cancel.is_cancelled() && !interrupt_sent {
                session.interrupt(&ticket);
                interrupt_sent = true;
                continue;
            }
        }
        if let Some(deadline) = opts.deadline {
            if Instant::now() >= deadline {
                if !interrupt_sent {
                    session.interrupt(&ticket);
                }
                ticket.mark_killed();
                if !ticket.is_answered() {
                    return Err(Errno::EINTR);
                }
                // Completed while we were interrupting; collect the reply.
                ticket.wait_answered(None);
                break;
            }
        }
        if let Some(daemon_deadline) = daemon_deadline {
            if Instant::now() >= daemon_deadline {
                // No reply within the liveness bound; the whole session is
                // presumed gone, not just this call.
                session.mark_dead("daemon timeout");
                continue;
            }
        }
        // Spurious wakeup or cancel nudge; re-evaluate.
    }

    // The call is over; drop any interrupt companion still linked to it.
    ticket.take_interrupt();
    let reply = ticket.take_reply().ok_or(Errno::EINTR)?;
    match reply.error {
        Some(errno) if errno == Errno::ENOSYS && opcode.is_optional() => {
            session.set_not_implemented(opcode);
            Err(Errno::ENOSYS)
        }
        Some(errno) => Err(errno),
        None => Ok(reply),
    }
}

/// Sends a request that has no reply (FORGET).
pub(crate) fn send_oneway(
    session: &Arc<Session>,
    caller: &Caller,
    opcode: Opcode,
    nodeid: NodeId,
    payload: &[u8],
) -> Result<(), Errno> {
    let ticket = Ticket::new(
        session.next_unique(),
        opcode,
        nodeid.0,
        caller,
        payload,
        None,
    );
    ticket.mark_killed();
    session.enqueue(&ticket, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::TicketReply;
    use std::thread;
    use std::time::Duration;

    fn session() -> Arc<Session> {
        let se = Session::new(1, 0, 4096, None);
        se.complete_init(crate::session::Negotiated::default());
        se
    }

    fn caller() -> Caller {
        Caller::new(501, 20, 7)
    }

    /// One-shot server: answers the next popped ticket with the given reply.
    fn answer_next(se: &Arc<Session>, reply: fn() -> TicketReply) -> thread::JoinHandle<()> {
        let se = se.clone();
        thread::spawn(move || {
            let ticket = se.pop_next(true).unwrap();
            se.complete_reply(ticket.unique().0, reply());
        })
    }

    #[test]
    fn reply_round_trip() {
        let se = session();
        let server = answer_next(&se, || TicketReply {
            error: None,
            data: b"pong".to_vec(),
        });
        let reply = dispatch(
            &se,
            &caller(),
            Opcode::GetAttr,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions::default(),
        )
        .unwrap();
        assert_eq!(reply.data, b"pong");
        server.join().unwrap();
    }

    #[test]
    fn enosys_is_cached_for_optional_opcodes() {
        let se = session();
        let server = answer_next(&se, || TicketReply::error(Errno::ENOSYS));
        let err = dispatch(
            &se,
            &caller(),
            Opcode::GetXTimes,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOSYS);
        server.join().unwrap();

        // The second call short-circuits: nothing shows up on the queue.
        let err = dispatch(
            &se,
            &caller(),
            Opcode::GetXTimes,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOSYS);
        assert_eq!(se.queue_len(), 0);
        assert_eq!(se.pop_next(false).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn enosys_not_cached_for_mandatory_opcodes() {
        let se = session();
        let server = answer_next(&se, || TicketReply::error(Errno::ENOSYS));
        let err = dispatch(
            &se,
            &caller(),
            Opcode::Read,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOSYS);
        server.join().unwrap();
        assert!(!se.is_not_implemented(Opcode::Read));
    }

    #[test]
    fn dead_session_rejects_dispatch() {
        let se = session();
        se.mark_dead("test");
        let err = dispatch(
            &se,
            &caller(),
            Opcode::GetAttr,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOTCONN);
    }

    #[test]
    fn deadline_interrupts_and_returns_eintr() {
        let se = session();
        // Server reads the request but never replies to it.
        let reader = {
            let se = se.clone();
            thread::spawn(move || {
                let _ticket = se.pop_next(true).unwrap();
                // Hold the request; the INTERRUPT companion shows up next.
                let companion = se.pop_next(true).unwrap();
                assert_eq!(companion.opcode(), Opcode::Interrupt);
            })
        };
        let err = dispatch(
            &se,
            &caller(),
            Opcode::Read,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions {
                deadline: Some(Instant::now() + Duration::from_millis(30)),
                cancel: None,
            },
        )
        .unwrap_err();
        assert_eq!(err, Errno::EINTR);
        reader.join().unwrap();
    }

    #[test]
    fn cancel_keeps_waiting_for_the_reply() {
        let se = session();
        let token = CancelToken::new();
        let server = {
            let se = se.clone();
            thread::spawn(move || {
                let ticket = se.pop_next(true).unwrap();
                // The companion arrives after the cancel fires.
                let companion = se.pop_next(true).unwrap();
                assert_eq!(companion.opcode(), Opcode::Interrupt);
                // Answer the original late; the caller still gets it.
                se.complete_reply(
                    ticket.unique().0,
                    TicketReply {
                        error: None,
                        data: b"late".to_vec(),
                    },
                );
                se.complete_reply(companion.unique().0, TicketReply::error(Errno::EAGAIN));
            })
        };
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };
        let reply = dispatch(
            &se,
            &caller(),
            Opcode::Read,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions {
                deadline: None,
                cancel: Some(&token),
            },
        )
        .unwrap();
        assert_eq!(reply.data, b"late");
        server.join().unwrap();
        canceller.join().unwrap();
    }

    #[test]
    fn daemon_timeout_kills_the_session() {
        let se = Session::new(1, 0, 4096, Some(Duration::from_millis(30)));
        se.complete_init(crate::session::Negotiated::default());
        let err = dispatch(
            &se,
            &caller(),
            Opcode::GetAttr,
            NodeId::ROOT,
            &[],
            None,
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOTCONN);
        assert!(se.is_dead());
    }
}
