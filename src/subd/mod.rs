// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Supervision of a single worker process.
//!
//! Every [`Subdaemon`] runs two local tasks on the master event loop: a
//! read loop which dispatches incoming messages and reaps the process once
//! the connection is gone, and a send loop draining the outbound queue. A
//! panic while handling a message stops the whole node.

mod read;

use std::cell::{Cell, RefCell};
use std::fmt::{self, Display, Formatter};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::channel::{Dbid, GossipControl, Owner, ShortChannelId};
use crate::launcher::{self, DebugOptions, DescriptorPlan};
use crate::lifeline::Lifeline;
use crate::queue::OutboundQueue;
use crate::request::RequestTracker;
use crate::transport::Transport;
use crate::wire::msgs::{GossipDisableChannel, GossipReachPeer, WireMessage, WireRequest};
use crate::wire::{Message, RoleSchema};
use crate::Error;

pub type SubdId = u64;

/// Handles a message which is not a reply. Returns the number of
/// descriptors which must be collected before the message can be processed
/// (the handler is then invoked again with them), or zero once done.
pub type Handler<M> =
    Box<dyn FnMut(&mut M, &Rc<Subdaemon<M>>, &Message, &mut Vec<OwnedFd>) -> Result<usize, Error>>;

/// Consumes the reply to a request together with its descriptors.
pub type ReplyFn<M> =
    Box<dyn FnOnce(&mut M, &Rc<Subdaemon<M>>, &Message, Vec<OwnedFd>) -> Result<(), Error>>;

/// Master-side state the workers report into.
pub trait Master: Sized + 'static {
    fn begin_transaction(&mut self);

    fn commit_transaction(&mut self) -> Result<(), Error>;

    /// A worker reported that the remote peer of channel `dbid` misbehaved.
    fn peer_misbehaved(&mut self, dbid: Dbid, reason: String);

    /// The worker owning channel `dbid` went away unexpectedly.
    fn owner_died(&mut self, dbid: Dbid, reason: String);

    /// A worker finished its cleanup and may be forgotten.
    fn subdaemon_gone(&mut self, id: SubdId);

    /// Condition which must stop the whole node.
    fn fatal(&mut self, err: Error);
}

/// Settings shared by all launched workers.
#[derive(Clone, Debug, Default)]
pub struct LaunchConfig {
    pub daemon_dir: PathBuf,
    pub debug: DebugOptions,
    /// Escalate worker misbehaviour to a node failure.
    pub dev_fail: bool,
}

/// How a worker process ended.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum ExitReport {
    #[display("exit status {0}")]
    Exited(i32),

    #[display("killed by {0}")]
    Signaled(Signal),

    /// We had to kill it after its connection closed.
    #[display("killed after close")]
    Killed,

    #[display("unknown status")]
    Unknown,
}

pub struct Subdaemon<M: Master> {
    id: SubdId,
    name: &'static str,
    pid: Option<Pid>,
    schema: &'static RoleSchema,
    transport: Transport,
    outq: OutboundQueue,
    requests: RefCell<RequestTracker<ReplyFn<M>>>,
    handler: RefCell<Handler<M>>,
    must_not_exit: Cell<bool>,
    crash_handling: Cell<bool>,
    global: bool,
    channel: Cell<Option<Dbid>>,
    reaped: Cell<bool>,
    lifeline: Rc<Lifeline>,
    cancel: CancellationToken,
    dev_fail: bool,
}

impl<M: Master> Display for Subdaemon<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{}({})", self.name, pid),
            None => write!(f, "{}(-)", self.name),
        }
    }
}

impl<M: Master> Subdaemon<M> {
    /// Launches a node-wide worker. Its exit stops the node.
    pub fn global(
        master: &Rc<RefCell<M>>,
        config: &LaunchConfig,
        id: SubdId,
        schema: &'static RoleSchema,
        plan: DescriptorPlan,
        handler: Handler<M>,
    ) -> Result<Rc<Self>, Error> {
        let subd = Self::launch(master, config, id, schema, plan, handler, true)?;
        subd.must_not_exit.set(true);
        Ok(subd)
    }

    /// Launches a worker which owns channel `dbid`.
    pub fn per_peer(
        master: &Rc<RefCell<M>>,
        config: &LaunchConfig,
        id: SubdId,
        schema: &'static RoleSchema,
        dbid: Dbid,
        plan: DescriptorPlan,
        handler: Handler<M>,
    ) -> Result<Rc<Self>, Error> {
        let subd = Self::launch(master, config, id, schema, plan, handler, false)?;
        subd.bind_channel(dbid);
        Ok(subd)
    }

    fn launch(
        master: &Rc<RefCell<M>>,
        config: &LaunchConfig,
        id: SubdId,
        schema: &'static RoleSchema,
        plan: DescriptorPlan,
        handler: Handler<M>,
        global: bool,
    ) -> Result<Rc<Self>, Error> {
        let (pid, stream) =
            launcher::spawn(&config.daemon_dir, schema.role, plan, &config.debug).map_err(|err| {
                warn!("subd {} failed: {}", schema.role, err);
                err
            })?;
        Self::attach(master, config, id, schema, Some(pid), stream, handler, global)
    }

    /// Supervises an already connected worker; `pid` is `None` when there
    /// is no process to reap.
    #[allow(clippy::too_many_arguments)]
    pub fn attach(
        master: &Rc<RefCell<M>>,
        config: &LaunchConfig,
        id: SubdId,
        schema: &'static RoleSchema,
        pid: Option<Pid>,
        stream: UnixStream,
        handler: Handler<M>,
        global: bool,
    ) -> Result<Rc<Self>, Error> {
        let msgfd = stream.as_raw_fd();
        let subd = Rc::new(Subdaemon {
            id,
            name: schema.role,
            pid,
            schema,
            transport: Transport::new(stream, schema.role)?,
            outq: OutboundQueue::new(),
            requests: RefCell::new(RequestTracker::new()),
            handler: RefCell::new(handler),
            must_not_exit: Cell::new(false),
            crash_handling: Cell::new(true),
            global,
            channel: Cell::new(None),
            reaped: Cell::new(false),
            lifeline: Rc::new(Lifeline::new()),
            cancel: CancellationToken::new(),
            dev_fail: config.dev_fail,
        });
        subd.transport.set_label(&subd);
        debug!("{}: pid {}, msgfd {}", subd, pid.map(|p| p.as_raw()).unwrap_or(-1), msgfd);

        let reader = tokio::task::spawn_local(read::read_loop(master.clone(), subd.clone()));
        tokio::task::spawn_local(read::watch_reader(master.clone(), subd.clone(), reader));
        tokio::task::spawn_local(read::send_loop(subd.clone()));
        Ok(subd)
    }

    pub fn id(&self) -> SubdId { self.id }

    pub fn name(&self) -> &'static str { self.name }

    pub fn pid(&self) -> Option<Pid> { self.pid }

    pub fn channel(&self) -> Option<Dbid> { self.channel.get() }

    /// Makes the worker the one responsible for channel `dbid`.
    pub fn bind_channel(&self, dbid: Dbid) { self.channel.set(Some(dbid)) }

    pub fn lifeline(&self) -> &Rc<Lifeline> { &self.lifeline }

    pub fn is_destroyed(&self) -> bool { self.lifeline.is_destroyed() }

    pub fn pending_requests(&self) -> usize { self.requests.borrow().len() }

    /// Queues a message for the worker.
    ///
    /// # Panics
    ///
    /// If the worker role does not understand the message type.
    pub fn send(&self, msg: Message) {
        assert!(
            self.schema.accepts(msg.ty),
            "{} does not understand message type {}",
            self.name,
            msg.ty
        );
        self.outq.enqueue(msg);
    }

    pub fn send_msg<T: WireMessage>(&self, payload: &T) { self.send(payload.to_message()) }

    /// Queues a descriptor handoff after everything queued so far.
    pub fn send_fd(&self, fd: OwnedFd) { self.outq.enqueue_fd(fd) }

    /// Sends a request, optionally followed by a descriptor, and registers
    /// `reply` for its answer. If `owner` is destroyed first, the reply is
    /// drained without calling `reply`.
    pub fn request<R: WireRequest>(
        &self,
        request: &R,
        fd: Option<OwnedFd>,
        owner: Option<&Rc<Lifeline>>,
        reply: ReplyFn<M>,
    ) {
        self.send_msg(request);
        if let Some(fd) = fd {
            self.send_fd(fd);
        }
        self.requests.borrow_mut().add(R::TYPE, R::REPLY_FDS, R::HAS_FAIL, reply, owner);
    }

    /// Tears the worker down. The read loop still reaps the process, and a
    /// channel which is still owned gets a transient failure.
    pub fn destroy(&self) {
        self.lifeline.destroy();
        self.cancel.cancel();
    }

    /// Stops the worker on purpose: no failure handling, a graceful close
    /// and a kill if it does not exit within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.crash_handling.set(false);
        self.must_not_exit.set(false);
        self.channel.set(None);
        self.transport.close();

        if let Some(pid) = self.pid {
            if !self.reaped.replace(true) {
                match launcher::reap_within(pid, timeout).await {
                    Some(status) => debug!("{}: exited with {:?}", self, status),
                    None => debug!("{}: exit status unknown", self),
                }
            }
        }
        self.destroy();
    }

    /// Collects the exit status once the connection is gone, killing the
    /// process if it is still around.
    fn reap(&self) -> ExitReport {
        let pid = match self.pid {
            Some(pid) if !self.reaped.replace(true) => pid,
            _ => return ExitReport::Unknown,
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                debug!("{}: status closed, but not exited. Killing", self);
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                ExitReport::Killed
            }
            Ok(WaitStatus::Exited(_, code)) => ExitReport::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ExitReport::Signaled(signal),
            Ok(_) => ExitReport::Unknown,
            Err(err) => {
                warn!("{}: status closed, but waitpid {} says {}", self, pid, err);
                ExitReport::Unknown
            }
        }
    }
}

impl<M: Master> Owner for Subdaemon<M> {
    fn name(&self) -> String { self.to_string() }

    fn release_channel(&self, dbid: Dbid) {
        if self.channel.get() != Some(dbid) {
            return;
        }
        self.channel.set(None);
        if !self.global {
            debug!("{}: released channel {}, shutting down", self, dbid);
            self.destroy();
        }
    }
}

impl<M: Master> GossipControl for Subdaemon<M> {
    fn disable_channel(&self, scid: ShortChannelId, direction: u8, active: bool) {
        self.send_msg(&GossipDisableChannel { scid, direction, active });
    }

    fn reach_peer(&self, peer: PublicKey) { self.send_msg(&GossipReachPeer { peer }); }
}
