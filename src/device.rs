//! The character-device endpoint.
//!
//! A process-wide table of numbered slots, each pairing one server (the
//! opener) with at most one session. The server pulls request frames with
//! `read`, posts replies with `write`, and controls the session with a small
//! ioctl set. The table is built once at startup; teardown refuses while any
//! slot is in use or a session lingers.

use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use log::debug;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;
use zerocopy::FromBytes;

use crate::ll::Errno;
use crate::ll::fuse_abi as abi;
use crate::session::Session;
use crate::ticket::TicketReply;

/// Slots a device table exposes unless told otherwise.
pub const DEFAULT_SLOT_COUNT: usize = 24;

bitflags! {
    /// Readiness as reported by [`SlotHandle::poll`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollEvents: u32 {
        /// A request frame can be read without blocking.
        const POLLIN = libc::POLLIN as u32;
        /// Replies can always be posted.
        const POLLOUT = libc::POLLOUT as u32;
        /// The session is gone.
        const POLLHUP = libc::POLLHUP as u32;
    }
}

bitflags! {
    /// Actions selected by the alter-vnode ioctl.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AlterVnodeCmd: u32 {
        /// Apply the UBC flags to the node's cached pages.
        const UBC = 1 << 0;
        /// Update the in-kernel file size to `size`.
        const SIZE = 1 << 1;
        /// Drop the cached attributes.
        const PURGE_ATTR = 1 << 2;
        /// Drop name-cache entries pointing at the node.
        const PURGE_NAME = 1 << 3;
        /// Emit a filesystem-event note for the node.
        const NOTE = 1 << 4;
    }
}

bitflags! {
    /// Page-cache actions for [`AlterVnodeCmd::UBC`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UbcFlags: u32 {
        /// Push dirty pages to the daemon.
        const PUSH = 1 << 0;
        /// Drop cached pages.
        const INVALIDATE = 1 << 1;
    }
}

/// Argument of [`Ioctl::AlterVnode`]. The masks arrive raw so that unknown
/// bits can be rejected the way an ioctl interface must.
#[derive(Debug, Clone, Copy)]
pub struct AlterVnode {
    pub cmds: u32,
    pub ino: u64,
    pub size: u64,
    pub ubc: u32,
    pub note: u32,
}

impl AlterVnode {
    pub(crate) fn cmds(&self) -> Result<AlterVnodeCmd, Errno> {
        AlterVnodeCmd::from_bits(self.cmds).ok_or(Errno::EINVAL)
    }

    pub(crate) fn ubc(&self) -> Result<UbcFlags, Errno> {
        UbcFlags::from_bits(self.ubc).ok_or(Errno::EINVAL)
    }
}

/// Control commands a server may issue on its slot.
#[derive(Debug, Clone, Copy)]
pub enum Ioctl {
    /// Overwrite the session's not-implemented mask.
    SetNotImplemented(u64),
    /// Nonzero iff INIT has completed; fails with ENODEV before a mount
    /// is attached.
    HandshakeComplete,
    /// Mark the session dead.
    SetDaemonDead,
    /// The per-session nonce, for authenticating control clients.
    GetRandom,
    /// Poke the adapter state of one node.
    AlterVnode(AlterVnode),
}

/// Answer to an [`Ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Flag(bool),
    Random(u64),
}

#[derive(Debug, Default)]
struct SlotState {
    opened: bool,
    owner_pid: u32,
    nonce: u64,
    session: Option<Arc<Session>>,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    // Readers park here while no session is attached yet.
    attach_cv: Condvar,
}

/// The process-wide slot table.
#[derive(Debug)]
pub struct Device {
    slots: Vec<Slot>,
}

impl Device {
    /// Builds the table; done once at startup.
    pub fn new(slot_count: usize) -> Arc<Device> {
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, Slot::default);
        Arc::new(Device { slots })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<&Slot, Errno> {
        self.slots.get(index).ok_or(Errno::ENXIO)
    }

    /// Opens a slot exclusively; the opener becomes the server. Fails with
    /// EBUSY while another open is live or a dead-but-not-torn-down session
    /// is still attached.
    pub fn open(self: &Arc<Self>, index: usize, server_pid: u32) -> Result<SlotHandle, Errno> {
        let slot = self.slot(index)?;
        let mut state = slot.state.lock();
        if state.opened || state.session.is_some() {
            return Err(Errno::EBUSY);
        }
        state.opened = true;
        state.owner_pid = server_pid;
        state.nonce = rand::random();
        debug!("slot {index} opened by pid {server_pid}");
        Ok(SlotHandle {
            device: self.clone(),
            index,
            closed: AtomicBool::new(false),
            nonblocking: AtomicBool::new(false),
        })
    }

    /// Refuses while any slot is open or holds a session.
    pub fn shutdown(&self) -> Result<(), Errno> {
        for slot in &self.slots {
            let state = slot.state.lock();
            if state.opened || state.session.is_some() {
                return Err(Errno::EBUSY);
            }
        }
        Ok(())
    }

    pub(crate) fn slot_server(&self, index: usize) -> Result<(u32, u64), Errno> {
        let slot = self.slot(index)?;
        let state = slot.state.lock();
        if !state.opened {
            return Err(Errno::ENXIO);
        }
        Ok((state.owner_pid, state.nonce))
    }

    /// Binds a session to an opened slot; at most one per slot.
    pub(crate) fn attach_session(&self, index: usize, session: Arc<Session>) -> Result<(), Errno> {
        let slot = self.slot(index)?;
        let mut state = slot.state.lock();
        if !state.opened {
            return Err(Errno::ENXIO);
        }
        if state.session.is_some() {
            return Err(Errno::EBUSY);
        }
        state.session = Some(session);
        slot.attach_cv.notify_all();
        Ok(())
    }

    /// Detaches and destroys the slot's session once both the mount is gone
    /// and the device is closed.
    pub(crate) fn reap_session(&self, index: usize) {
        let Ok(slot) = self.slot(index) else { return };
        let mut state = slot.state.lock();
        let gone = match &state.session {
            Some(session) => !state.opened && !session.is_mounted() && session.is_dead(),
            None => false,
        };
        if gone {
            if let Some(session) = state.session.take() {
                session.destroy();
                debug!("slot {index} session torn down");
            }
        }
    }
}

/// The server's side of one open slot.
#[derive(Debug)]
pub struct SlotHandle {
    device: Arc<Device>,
    index: usize,
    closed: AtomicBool,
    nonblocking: AtomicBool,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Switches `read` between blocking and would-block behaviour.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), Errno> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Errno::EBADF);
        }
        Ok(())
    }

    /// The attached session, waiting for a mount to appear when blocking.
    fn session(&self) -> Result<Arc<Session>, Errno> {
        let slot = self.device.slot(self.index)?;
        let mut state = slot.state.lock();
        loop {
            self.check_open()?;
            if let Some(session) = &state.session {
                return Ok(session.clone());
            }
            if self.nonblocking.load(Ordering::SeqCst) {
                return Err(Errno::EAGAIN);
            }
            slot.attach_cv.wait(&mut state);
        }
    }

    /// Pulls the next request frame into `buf`. Blocks while the queue is
    /// empty unless the handle is nonblocking; returns ENODEV once the
    /// session dies.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.check_open()?;
        let session = self.session()?;
        let blocking = !self.nonblocking.load(Ordering::SeqCst);
        let ticket = session.pop_next(blocking)?;
        if buf.len() < ticket.frame_len() {
            // The frame is already claimed; it cannot be redelivered.
            warn!(
                "read buffer too small for {:?} frame ({} < {})",
                ticket.opcode(),
                buf.len(),
                ticket.frame_len()
            );
            session.complete_reply(ticket.unique().0, TicketReply::error(Errno::EIO));
            return Err(Errno::EINVAL);
        }
        Ok(ticket.write_frame(buf))
    }

    /// Posts one reply frame. Malformed frames return EINVAL and kill the
    /// session; a reply whose id matches nothing is dropped silently.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        self.check_open()?;
        let session = self.session()?;
        let Ok((header, body)) = abi::fuse_out_header::read_from_prefix(buf) else {
            session.mark_dead("short reply header");
            return Err(Errno::EINVAL);
        };
        if header.len as usize != size_of::<abi::fuse_out_header>() + body.len() {
            session.mark_dead("reply length mismatch");
            return Err(Errno::EINVAL);
        }
        let error = match Errno::from_wire(header.error) {
            Ok(error) => error,
            Err(()) => {
                session.mark_dead("positive error on the wire");
                return Err(Errno::EINVAL);
            }
        };
        if error.is_some() && !body.is_empty() {
            session.mark_dead("error reply with a body");
            return Err(Errno::EINVAL);
        }
        session.complete_reply(
            header.unique,
            TicketReply {
                error,
                data: body.to_vec(),
            },
        );
        Ok(buf.len())
    }

    /// Readiness without blocking.
    pub fn poll(&self) -> Result<PollEvents, Errno> {
        self.check_open()?;
        let slot = self.device.slot(self.index)?;
        let state = slot.state.lock();
        let mut events = PollEvents::POLLOUT;
        if let Some(session) = &state.session {
            if session.is_dead() {
                events |= PollEvents::POLLIN | PollEvents::POLLHUP;
            } else if session.queue_len() > 0 {
                events |= PollEvents::POLLIN;
            }
        }
        Ok(events)
    }

    /// Session control. Commands other than `HandshakeComplete` also fail
    /// with ENODEV before a mount is attached.
    pub fn ioctl(&self, cmd: Ioctl) -> Result<IoctlReply, Errno> {
        self.check_open()?;
        let slot = self.device.slot(self.index)?;
        let session = slot.state.lock().session.clone().ok_or(Errno::ENODEV)?;
        match cmd {
            Ioctl::SetNotImplemented(mask) => {
                session.store_notimpl_mask(mask);
                Ok(IoctlReply::Done)
            }
            Ioctl::HandshakeComplete => Ok(IoctlReply::Flag(session.init_done())),
            Ioctl::SetDaemonDead => {
                session.mark_dead("kill ioctl");
                self.device.reap_session(self.index);
                Ok(IoctlReply::Done)
            }
            Ioctl::GetRandom => Ok(IoctlReply::Random(session.nonce())),
            Ioctl::AlterVnode(alter) => {
                session.alter_vnode(&alter)?;
                Ok(IoctlReply::Done)
            }
        }
    }

    /// Tears the server side down: the session is marked dead, every waiter
    /// drains with "connection lost", and the session object itself goes
    /// away once no mount refers to it.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(slot) = self.device.slot(self.index) else {
            return;
        };
        let session = {
            let mut state = slot.state.lock();
            state.opened = false;
            slot.attach_cv.notify_all();
            state.session.clone()
        };
        if let Some(session) = session {
            session.mark_dead("device closed");
            self.device.reap_session(self.index);
        }
        debug!("slot {} closed", self.index);
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Caller;
    use crate::ll::Unique;
    use crate::ll::fuse_abi::Opcode;
    use crate::ticket::Ticket;
    use zerocopy::IntoBytes;

    fn attach(device: &Arc<Device>, index: usize) -> Arc<Session> {
        let (pid, nonce) = device.slot_server(index).unwrap();
        let session = Session::new(pid, nonce, 4096, None);
        session.set_mounted(true);
        device.attach_session(index, session.clone()).unwrap();
        session
    }

    fn queue_getattr(session: &Arc<Session>) -> Unique {
        let ticket = Ticket::new(
            session.next_unique(),
            Opcode::GetAttr,
            1,
            &Caller::new(0, 0, 9),
            &[],
            None,
        );
        let unique = ticket.unique();
        session.enqueue(&ticket, false).unwrap();
        unique
    }

    #[test]
    fn exclusive_open() {
        let device = Device::new(2);
        let handle = device.open(0, 100).unwrap();
        assert_eq!(device.open(0, 101).unwrap_err(), Errno::EBUSY);
        let other = device.open(1, 101).unwrap();
        assert_eq!(device.open(7, 102).unwrap_err(), Errno::ENXIO);
        drop(handle);
        drop(other);
        // Both slots are reopenable after close.
        device.open(0, 102).unwrap();
    }

    #[test]
    fn shutdown_refuses_while_busy() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        assert_eq!(device.shutdown().unwrap_err(), Errno::EBUSY);
        drop(handle);
        device.shutdown().unwrap();
    }

    #[test]
    fn read_delivers_frames_in_order() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        let session = attach(&device, 0);
        let first = queue_getattr(&session);
        let second = queue_getattr(&session);
        let mut buf = vec![0u8; 4096];
        let n = handle.read(&mut buf).unwrap();
        assert_eq!(n, 40);
        assert_eq!(&buf[8..16], &first.0.to_le_bytes());
        handle.read(&mut buf).unwrap();
        assert_eq!(&buf[8..16], &second.0.to_le_bytes());
    }

    #[test]
    fn nonblocking_read_would_block() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        attach(&device, 0);
        handle.set_nonblocking(true);
        let mut buf = vec![0u8; 4096];
        assert_eq!(handle.read(&mut buf).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn malformed_reply_kills_session() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        let session = attach(&device, 0);
        let header = abi::fuse_out_header {
            len: 99, // wrong: no body follows
            error: 0,
            unique: 1,
        };
        assert_eq!(
            handle.write(header.as_bytes()).unwrap_err(),
            Errno::EINVAL
        );
        assert!(session.is_dead());
    }

    #[test]
    fn error_reply_with_body_is_rejected() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        let session = attach(&device, 0);
        let mut frame = abi::fuse_out_header {
            len: (size_of::<abi::fuse_out_header>() + 3) as u32,
            error: -libc::EIO,
            unique: 1,
        }
        .as_bytes()
        .to_vec();
        frame.extend_from_slice(b"abc");
        assert_eq!(handle.write(&frame).unwrap_err(), Errno::EINVAL);
        assert!(session.is_dead());
    }

    #[test]
    fn orphan_reply_is_dropped() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        let session = attach(&device, 0);
        let header = abi::fuse_out_header {
            len: size_of::<abi::fuse_out_header>() as u32,
            error: 0,
            unique: 0x4242,
        };
        assert_eq!(handle.write(header.as_bytes()).unwrap(), 16);
        assert!(!session.is_dead());
    }

    #[test]
    fn poll_reports_readable_on_work_and_death() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        let session = attach(&device, 0);
        assert_eq!(handle.poll().unwrap(), PollEvents::POLLOUT);
        queue_getattr(&session);
        assert!(handle.poll().unwrap().contains(PollEvents::POLLIN));
        session.mark_dead("test");
        assert!(handle.poll().unwrap().contains(PollEvents::POLLHUP));
    }

    #[test]
    fn close_drains_waiters_and_blocks_reopen_while_mounted() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        let session = attach(&device, 0);
        let ticket = Ticket::new(
            session.next_unique(),
            Opcode::Read,
            2,
            &Caller::new(0, 0, 9),
            &[],
            None,
        );
        session.enqueue(&ticket, false).unwrap();
        handle.close();
        assert_eq!(ticket.take_reply().unwrap().error, Some(Errno::ENOTCONN));
        // Mount still refers to the dead session: the slot stays busy.
        assert_eq!(device.open(0, 101).unwrap_err(), Errno::EBUSY);
        session.set_mounted(false);
        device.reap_session(0);
        device.open(0, 101).unwrap();
    }

    #[test]
    fn ioctl_handshake_and_nonce() {
        let device = Device::new(1);
        let handle = device.open(0, 100).unwrap();
        assert_eq!(
            handle.ioctl(Ioctl::HandshakeComplete).unwrap_err(),
            Errno::ENODEV
        );
        let session = attach(&device, 0);
        assert_eq!(
            handle.ioctl(Ioctl::HandshakeComplete).unwrap(),
            IoctlReply::Flag(false)
        );
        session.complete_init(crate::session::Negotiated::default());
        assert_eq!(
            handle.ioctl(Ioctl::HandshakeComplete).unwrap(),
            IoctlReply::Flag(true)
        );
        assert_eq!(
            handle.ioctl(Ioctl::GetRandom).unwrap(),
            IoctlReply::Random(session.nonce())
        );
        handle.ioctl(Ioctl::SetDaemonDead).unwrap();
        assert!(session.is_dead());
    }

    #[test]
    fn alter_vnode_rejects_unknown_bits() {
        let alter = AlterVnode {
            cmds: 1 << 30,
            ino: 2,
            size: 0,
            ubc: 0,
            note: 0,
        };
        assert_eq!(alter.cmds().unwrap_err(), Errno::EINVAL);
    }
}
