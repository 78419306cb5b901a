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

use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use tokio::task::JoinHandle;

use super::{ExitReport, Master, Subdaemon};
use crate::queue::Outgoing;
use crate::request::ReplyMatch;
use crate::wire::{FailClass, Message, StatusMsg};
use crate::Error;

/// What the read loop does after a message.
enum Flow {
    Continue,
    Close,
}

pub(super) async fn read_loop<M: Master>(master: Rc<RefCell<M>>, subd: Rc<Subdaemon<M>>) {
    loop {
        let msg = tokio::select! {
            _ = subd.cancel.cancelled() => break,
            msg = subd.transport.read_msg() => msg,
        };
        let msg = match msg {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("{}: connection closed", subd);
                break;
            }
            Err(err) => {
                subd.malformed(&master, err);
                break;
            }
        };
        match subd.process(&master, msg).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(err) if err.is_closed() => break,
            Err(err) => {
                subd.malformed(&master, err);
                break;
            }
        }
    }
    subd.finish(&master);
}

/// Turns a panic in the read loop into a node failure. The panic unwound
/// past the store transaction and the cleanup in `finish`, so the state of
/// the node can not be trusted any more.
pub(super) async fn watch_reader<M: Master>(
    master: Rc<RefCell<M>>,
    subd: Rc<Subdaemon<M>>,
    reader: JoinHandle<()>,
) {
    let err = match reader.await {
        Ok(()) => return,
        Err(err) if err.is_panic() => err,
        Err(_) => return,
    };
    error!("{}: message handling panicked", subd);
    subd.cancel.cancel();
    subd.transport.close();
    subd.reap();
    subd.lifeline.destroy();
    let mut master = master.borrow_mut();
    master.fatal(Error::Terminate(format!("{} message handling panicked: {}", subd.name, err)));
    master.subdaemon_gone(subd.id);
}

pub(super) async fn send_loop<M: Master>(subd: Rc<Subdaemon<M>>) {
    loop {
        let sent = match subd.outq.dequeue() {
            Some(Outgoing::Msg(msg)) => tokio::select! {
                _ = subd.cancel.cancelled() => break,
                res = subd.transport.write_msg(&msg) => res,
            },
            Some(Outgoing::Fd(fd)) => tokio::select! {
                _ = subd.cancel.cancelled() => break,
                res = subd.transport.send_fd(fd) => res,
            },
            None => {
                tokio::select! {
                    _ = subd.cancel.cancelled() => break,
                    _ = subd.outq.wait() => {}
                }
                continue;
            }
        };
        if let Err(err) = sent {
            debug!("{}: write failed: {}", subd, err);
            // the read loop notices and runs the failure handling
            subd.cancel.cancel();
            break;
        }
    }
}

impl<M: Master> Subdaemon<M> {
    async fn process(self: &Rc<Self>, master: &Rc<RefCell<M>>, msg: Message) -> Result<Flow, Error> {
        let matched = self.requests.borrow().peek(msg.ty)?;
        if let ReplyMatch::Reply { fds } = matched {
            let fds = self.collect_fds(fds).await?;
            return self.deliver_reply(master, &msg, fds);
        }

        match StatusMsg::parse(&msg)? {
            Some(StatusMsg::Trace(text)) => {
                debug!("{}: TRACE: {}", self, text);
                return Ok(Flow::Continue);
            }
            Some(StatusMsg::Fail(class, text)) => {
                self.status_fail(master, class, text);
                return Ok(Flow::Close);
            }
            None => {}
        }

        info!("{}: UPDATE {}", self, self.schema.name_of(msg.ty));
        let mut fds = vec![];
        let mut collected = false;
        loop {
            let wanted = self.in_transaction(master, |m| {
                let res = (self.handler.borrow_mut())(m, self, &msg, &mut fds);
                // unclaimed descriptors must not outlive the transaction
                fds.clear();
                res
            });
            if self.is_destroyed() {
                return Ok(Flow::Close);
            }
            match wanted {
                Ok(0) => return Ok(Flow::Continue),
                Ok(n) if !collected => {
                    fds = self.collect_fds(n).await?;
                    collected = true;
                }
                Ok(n) => {
                    return Err(Error::WorkerFailure(
                        self.name.to_owned(),
                        format!("handler asked for {} descriptors twice", n),
                    ))
                }
                Err(err) => return self.rejected(err),
            }
        }
    }

    /// A handler refused a message. Messages the worker should never have
    /// sent count as malformed; anything else only closes the connection.
    fn rejected(&self, err: Error) -> Result<Flow, Error> {
        match err {
            Error::Malformed(_) | Error::UnexpectedMessage(..) => Err(err),
            err => {
                warn!("{}: {}", self, err);
                Ok(Flow::Close)
            }
        }
    }

    fn deliver_reply(
        self: &Rc<Self>,
        master: &Rc<RefCell<M>>,
        msg: &Message,
        fds: Vec<OwnedFd>,
    ) -> Result<Flow, Error> {
        let answered = match self.requests.borrow_mut().pop() {
            Some(answered) => answered,
            None => return Ok(Flow::Close),
        };
        info!("{}: REPLY {} with {} fds", self, self.schema.name_of(msg.ty), fds.len());
        let reply = match answered.callback {
            Some(reply) => reply,
            None => {
                info!("{}: IGNORING REPLY {}", self, self.schema.name_of(msg.ty));
                return Ok(Flow::Continue);
            }
        };
        let res = self.in_transaction(master, |m| reply(m, self, msg, fds));
        if self.is_destroyed() {
            return Ok(Flow::Close);
        }
        match res {
            Ok(()) => Ok(Flow::Continue),
            Err(err) => self.rejected(err),
        }
    }

    async fn collect_fds(&self, count: usize) -> Result<Vec<OwnedFd>, Error> {
        let mut fds = Vec::with_capacity(count);
        while fds.len() < count {
            let fd = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Closed),
                fd = self.transport.recv_fd() => fd?,
            };
            fds.push(fd);
        }
        Ok(fds)
    }

    fn status_fail(&self, master: &Rc<RefCell<M>>, class: FailClass, text: String) {
        if class.is_peer_caused() {
            info!("{}: {}: {}", self, class, text);
        } else {
            error!("{}: {}: {}", self, class, text);
            if self.dev_fail {
                master
                    .borrow_mut()
                    .fatal(Error::WorkerFailure(self.name.to_owned(), format!("{}: {}", class, text)));
            }
        }
        if class == FailClass::PeerBad {
            // detach first so the failure does not come back to us
            if let Some(dbid) = self.channel.take() {
                self.in_transaction(master, |m| m.peer_misbehaved(dbid, text));
            }
        }
    }

    fn malformed(&self, master: &Rc<RefCell<M>>, err: Error) {
        error!("{}: {}", self, err);
        if self.dev_fail {
            master
                .borrow_mut()
                .fatal(Error::WorkerFailure(self.name.to_owned(), s!("sent malformed message")));
        }
    }

    fn in_transaction<T>(&self, master: &Rc<RefCell<M>>, f: impl FnOnce(&mut M) -> T) -> T {
        let mut master = master.borrow_mut();
        master.begin_transaction();
        let out = f(&mut master);
        if let Err(err) = master.commit_transaction() {
            master.fatal(err);
        }
        out
    }

    /// Runs once the connection is gone, whatever the reason.
    fn finish(&self, master: &Rc<RefCell<M>>) {
        self.cancel.cancel();
        self.transport.close();
        let status = self.reap();

        if self.crash_handling.get() {
            if self.dev_fail && matches!(status, ExitReport::Signaled(_)) {
                master.borrow_mut().fatal(Error::WorkerFailure(self.name.to_owned(), status.to_string()));
            }
            if let Some(dbid) = self.channel.take() {
                let reason = format!("Owning subdaemon {} died ({})", self.name, status);
                self.in_transaction(master, |m| m.owner_died(dbid, reason));
            }
            if self.must_not_exit.get() {
                master
                    .borrow_mut()
                    .fatal(Error::MustNotExit(self.name.to_owned(), status.to_string()));
            }
        }

        self.lifeline.destroy();
        master.borrow_mut().subdaemon_gone(self.id);
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use tokio::task::LocalSet;

    use super::*;
    use crate::channel::Dbid;
    use crate::lifeline::Lifeline;
    use crate::subd::{LaunchConfig, SubdId};
    use crate::wire::msgs::{GossipReleasePeer, GossipReleasePeerReply, WireMessage, GOSSIPD};
    use crate::wire::{WireAddr, STATUS_TRACE};

    #[derive(Default)]
    struct Recorder {
        transactions: usize,
        open: bool,
        misbehaved: Vec<(Dbid, String)>,
        died: Vec<(Dbid, String)>,
        gone: Vec<SubdId>,
        fatal: Vec<String>,
        updates: Vec<u16>,
        replies: Vec<usize>,
    }

    impl Master for Recorder {
        fn begin_transaction(&mut self) {
            assert!(!self.open, "nested transaction");
            self.open = true;
        }

        fn commit_transaction(&mut self) -> Result<(), Error> {
            assert!(self.open);
            self.open = false;
            self.transactions += 1;
            Ok(())
        }

        fn peer_misbehaved(&mut self, dbid: Dbid, reason: String) { self.misbehaved.push((dbid, reason)) }

        fn owner_died(&mut self, dbid: Dbid, reason: String) { self.died.push((dbid, reason)) }

        fn subdaemon_gone(&mut self, id: SubdId) { self.gone.push(id) }

        fn fatal(&mut self, err: Error) { self.fatal.push(err.to_string()) }
    }

    fn frame(msg: &Message) -> Vec<u8> {
        let body = msg.to_body();
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend(body);
        out
    }

    fn send_fd(stream: &UnixStream, fd: &impl AsRawFd) {
        use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
        let raw = [fd.as_raw_fd()];
        sendmsg::<()>(
            stream.as_raw_fd(),
            &[std::io::IoSlice::new(&[0])],
            &[ControlMessage::ScmRights(&raw)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
    }

    fn recording_handler() -> super::super::Handler<Recorder> {
        Box::new(|m: &mut Recorder, _subd: &Rc<Subdaemon<Recorder>>, msg: &Message, fds: &mut Vec<OwnedFd>| {
            if msg.ty.to_u16() == 3002 && fds.len() < 2 {
                return Ok(2);
            }
            m.updates.push(msg.ty.to_u16());
            Ok(0)
        })
    }

    fn attach(master: &Rc<RefCell<Recorder>>, stream: UnixStream) -> Rc<Subdaemon<Recorder>> {
        attach_with(master, stream, recording_handler(), &LaunchConfig::default())
    }

    fn attach_with(
        master: &Rc<RefCell<Recorder>>,
        stream: UnixStream,
        handler: super::super::Handler<Recorder>,
        config: &LaunchConfig,
    ) -> Rc<Subdaemon<Recorder>> {
        Subdaemon::attach(master, config, 7, &GOSSIPD, None, stream, handler, false).unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn updates_and_traces_are_dispatched() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);

                theirs.write_all(&frame(&Message::new(STATUS_TRACE, b"hi there".to_vec()))).unwrap();
                theirs.write_all(&frame(&Message::new(3019u16, vec![]))).unwrap();
                settle().await;

                assert_eq!(master.borrow().updates, vec![3019]);
                assert!(!subd.is_destroyed());
                assert!(master.borrow().gone.is_empty());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_collects_descriptors() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let _subd = attach(&master, ours);

                let file = tempfile::tempfile().unwrap();
                theirs.write_all(&frame(&Message::new(3002u16, vec![]))).unwrap();
                send_fd(&theirs, &file);
                send_fd(&theirs, &file);
                settle().await;

                assert_eq!(master.borrow().updates, vec![3002]);
                // one cycle asking for descriptors, one processing them
                assert_eq!(master.borrow().transactions, 2);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reply_reaches_callback() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);

                let peer = crate::channel::test_pubkey(1);
                subd.request(
                    &GossipReleasePeer { peer },
                    None,
                    None,
                    Box::new(|m: &mut Recorder, _: &Rc<Subdaemon<Recorder>>, _: &Message, fds: Vec<OwnedFd>| {
                        m.replies.push(fds.len());
                        Ok(())
                    }),
                );
                settle().await;
                let mut buf = [0u8; 4 + 2 + 33];
                theirs.read_exact(&mut buf).unwrap();
                assert_eq!(&buf[4..6], &[0x0B, 0xC5]);

                let reply = GossipReleasePeerReply { addr: WireAddr::Padding }.to_message();
                let file = tempfile::tempfile().unwrap();
                theirs.write_all(&frame(&reply)).unwrap();
                send_fd(&theirs, &file);
                send_fd(&theirs, &file);
                settle().await;

                assert_eq!(master.borrow().replies, vec![2]);
                assert_eq!(subd.pending_requests(), 0);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disabled_reply_is_drained() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);

                let owner = Rc::new(Lifeline::new());
                let called = Rc::new(Cell::new(false));
                let flag = called.clone();
                subd.request(
                    &GossipReleasePeer { peer: crate::channel::test_pubkey(2) },
                    None,
                    Some(&owner),
                    Box::new(move |_: &mut Recorder, _: &Rc<Subdaemon<Recorder>>, _: &Message, _: Vec<OwnedFd>| {
                        flag.set(true);
                        Ok(())
                    }),
                );
                owner.destroy();

                let (check_rx, check_tx) = UnixStream::pair().unwrap();
                theirs
                    .write_all(&frame(&GossipReleasePeerReply { addr: WireAddr::Padding }.to_message()))
                    .unwrap();
                send_fd(&theirs, &check_tx);
                send_fd(&theirs, &check_tx);
                drop(check_tx);
                settle().await;

                assert!(!called.get());
                assert_eq!(subd.pending_requests(), 0);
                // both passed copies were closed, so the other end sees end of stream
                check_rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                let mut buf = [0u8; 1];
                assert_eq!((&check_rx).read(&mut buf).unwrap(), 0);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn out_of_order_reply_closes_connection() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);

                fn noop() -> super::super::ReplyFn<Recorder> {
                    Box::new(|_: &mut Recorder, _: &Rc<Subdaemon<Recorder>>, _: &Message, _: Vec<OwnedFd>| Ok(()))
                }
                let init = crate::wire::msgs::GossipInit {
                    node_id: crate::channel::test_pubkey(3),
                    bind: vec![],
                    dev_no_reconnect: false,
                };
                subd.request(&init, None, None, noop());
                subd.request(&GossipReleasePeer { peer: crate::channel::test_pubkey(4) }, None, None, noop());

                theirs
                    .write_all(&frame(&Message::new(GossipReleasePeer::TYPE.reply_fail(), vec![])))
                    .unwrap();
                settle().await;

                assert_eq!(master.borrow().gone, vec![7]);
                assert!(subd.is_destroyed());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn request_hands_over_descriptor() {
        use std::os::fd::{FromRawFd, RawFd};

        use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                let subd = attach(&master, ours);

                let (handed, mut kept) = UnixStream::pair().unwrap();
                kept.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                let init = crate::wire::msgs::GossipInit {
                    node_id: crate::channel::test_pubkey(3),
                    bind: vec![],
                    dev_no_reconnect: false,
                };
                subd.request(
                    &init,
                    Some(handed.into()),
                    None,
                    Box::new(|_: &mut Recorder, _: &Rc<Subdaemon<Recorder>>, _: &Message, _: Vec<OwnedFd>| Ok(())),
                );
                settle().await;

                let mut buf = [0u8; 4 + 2 + 33 + 2 + 1];
                theirs.read_exact(&mut buf).unwrap();
                assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 3000);

                let mut byte = [0u8; 1];
                let mut iov = [std::io::IoSliceMut::new(&mut byte)];
                let mut space = nix::cmsg_space!(RawFd);
                let msg = recvmsg::<()>(theirs.as_raw_fd(), &mut iov, Some(&mut space), MsgFlags::empty())
                    .unwrap();
                let raw = msg
                    .cmsgs()
                    .find_map(|cmsg| match cmsg {
                        ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
                        _ => None,
                    })
                    .unwrap();
                let mut received = unsafe { UnixStream::from_raw_fd(raw) };

                // the descriptor reaches the worker and the master's copy is closed
                received.write_all(b"hsm").unwrap();
                drop(received);
                let mut out = Vec::new();
                kept.read_to_end(&mut out).unwrap();
                assert_eq!(out, b"hsm");
                assert_eq!(subd.pending_requests(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn malformed_trace_closes_connection() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);
                subd.channel.set(Some(11));

                theirs.write_all(&frame(&Message::new(STATUS_TRACE, vec![b'a', 0x07]))).unwrap();
                theirs.write_all(&frame(&Message::new(3019u16, vec![]))).unwrap();
                settle().await;

                let master = master.borrow();
                assert!(master.updates.is_empty());
                assert_eq!(master.died.len(), 1);
                assert_eq!(master.died[0].0, 11);
                assert!(master.died[0].1.starts_with("Owning subdaemon lightning_gossipd died"));
                assert!(master.fatal.is_empty());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn peer_bad_fails_channel_without_transient() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);
                subd.channel.set(Some(5));

                theirs.write_all(&frame(&Message::new(0x8005u16, b"bad sig".to_vec()))).unwrap();
                settle().await;

                let master = master.borrow();
                assert_eq!(master.misbehaved, vec![(5, s!("bad sig"))]);
                assert!(master.died.is_empty());
                assert_eq!(master.gone, vec![7]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn must_not_exit_worker_is_fatal() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);
                subd.must_not_exit.set(true);

                drop(theirs);
                settle().await;
                assert_eq!(master.borrow().fatal.len(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_is_silent() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, _theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);
                subd.must_not_exit.set(true);
                subd.channel.set(Some(9));

                subd.shutdown(Duration::from_millis(100)).await;
                settle().await;

                let master = master.borrow();
                assert!(master.fatal.is_empty());
                assert!(master.died.is_empty());
                assert_eq!(master.gone, vec![7]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn worker_exit_skips_pending_reply() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);
                subd.channel.set(Some(12));

                let called = Rc::new(Cell::new(false));
                let flag = called.clone();
                subd.request(
                    &GossipReleasePeer { peer: crate::channel::test_pubkey(5) },
                    None,
                    None,
                    Box::new(move |_: &mut Recorder, _: &Rc<Subdaemon<Recorder>>, _: &Message, _: Vec<OwnedFd>| {
                        flag.set(true);
                        Ok(())
                    }),
                );
                settle().await;
                let mut buf = [0u8; 4 + 2 + 33];
                theirs.read_exact(&mut buf).unwrap();
                drop(theirs);
                settle().await;

                assert!(!called.get());
                assert!(subd.is_destroyed());
                let master = master.borrow();
                assert_eq!(master.died.len(), 1);
                assert_eq!(master.died[0].0, 12);
                assert!(master.died[0].1.starts_with("Owning subdaemon lightning_gossipd died"));
                assert_eq!(master.gone, vec![7]);
                assert!(master.replies.is_empty());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn panicking_handler_stops_node() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let handler = Box::new(
                    |_: &mut Recorder, _: &Rc<Subdaemon<Recorder>>, _: &Message, _: &mut Vec<OwnedFd>| -> Result<usize, Error> {
                        panic!("channel in the wrong state")
                    },
                );
                let subd = attach_with(&master, ours, handler, &LaunchConfig::default());

                theirs.write_all(&frame(&Message::new(3019u16, vec![]))).unwrap();
                settle().await;

                assert!(subd.is_destroyed());
                let master = master.borrow();
                assert_eq!(master.fatal.len(), 1);
                assert!(master.fatal[0].contains("panicked"));
                assert_eq!(master.gone, vec![7]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_message_escalates_with_dev_fail() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let handler = Box::new(
                    |_: &mut Recorder, subd: &Rc<Subdaemon<Recorder>>, msg: &Message, _: &mut Vec<OwnedFd>| -> Result<usize, Error> {
                        Err(Error::UnexpectedMessage(msg.ty, subd.name().to_owned()))
                    },
                );
                let config = LaunchConfig { dev_fail: true, ..LaunchConfig::default() };
                let subd = attach_with(&master, ours, handler, &config);

                theirs.write_all(&frame(&Message::new(3019u16, vec![]))).unwrap();
                settle().await;

                assert!(subd.is_destroyed());
                let master = master.borrow();
                assert_eq!(master.fatal.len(), 1);
                assert!(master.fatal[0].contains("sent malformed message"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_message_only_closes_worker() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, mut theirs) = UnixStream::pair().unwrap();
                let handler = Box::new(
                    |_: &mut Recorder, _: &Rc<Subdaemon<Recorder>>, msg: &Message, _: &mut Vec<OwnedFd>| -> Result<usize, Error> {
                        Err(Error::Malformed(crate::wire::WireError::UnexpectedType(msg.ty.to_u16())))
                    },
                );
                let subd = attach_with(&master, ours, handler, &LaunchConfig::default());

                theirs.write_all(&frame(&Message::new(3019u16, vec![]))).unwrap();
                settle().await;

                assert!(subd.is_destroyed());
                assert!(master.borrow().fatal.is_empty());
                assert_eq!(master.borrow().gone, vec![7]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    #[should_panic(expected = "does not understand")]
    async fn unknown_outbound_type_panics() {
        LocalSet::new()
            .run_until(async {
                let master = Rc::new(RefCell::new(Recorder::default()));
                let (ours, _theirs) = UnixStream::pair().unwrap();
                let subd = attach(&master, ours);
                subd.send(Message::new(3002u16, vec![]));
            })
            .await;
    }
}
