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

//! Master daemon: owns the channel ledger, supervises the workers and
//! answers JSON commands.

mod commands;
mod keys;
mod workers;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::os::fd::OwnedFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::unistd::Pid;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

pub use self::keys::{load_or_create_secret, NodeKeys};
use crate::channel::{ChainResolver, Channel, Dbid, DevDisconnect, DevOptions, GossipControl, Ledger};
use crate::config::Config;
use crate::launcher::{self, DebugOptions, DescriptorPlan};
use crate::rpc::{Command, CommandTable, Response};
use crate::service::LogStyle;
use crate::store::DiskStore;
use crate::subd::{Handler, LaunchConfig, Master, SubdId, Subdaemon};
use crate::wire::msgs::{GossipInit, GOSSIPD, HSMD};
use crate::wire::{RoleSchema, WireAddrOrSockname};
use crate::Error;

pub struct Lightningd {
    this: Weak<RefCell<Lightningd>>,
    launch: LaunchConfig,
    shutdown_timeout: Duration,
    ledger: Ledger,
    subds: BTreeMap<SubdId, Rc<Subdaemon<Lightningd>>>,
    gossip: Option<Rc<Subdaemon<Lightningd>>>,
    commands: Rc<CommandTable<Lightningd>>,
    stop: CancellationToken,
    failure: Option<Error>,
    next_subd: SubdId,
    /// Workers launched without supervision, reaped on shutdown.
    unsupervised: Vec<(&'static str, Pid)>,
}

impl Lightningd {
    pub fn new(launch: LaunchConfig, ledger: Ledger, shutdown_timeout: Duration) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Lightningd {
                this: this.clone(),
                launch,
                shutdown_timeout,
                ledger,
                subds: empty!(),
                gossip: None,
                commands: Rc::new(commands::table()),
                stop: CancellationToken::new(),
                failure: None,
                next_subd: 1,
                unsupervised: empty!(),
            })
        })
    }

    pub fn ledger(&self) -> &Ledger { &self.ledger }

    pub fn ledger_mut(&mut self) -> &mut Ledger { &mut self.ledger }

    /// Cancelled once the node has to stop.
    pub fn stop_token(&self) -> CancellationToken { self.stop.clone() }

    pub fn failure(&self) -> Option<&Error> { self.failure.as_ref() }

    pub fn subdaemons(&self) -> impl Iterator<Item = &Rc<Subdaemon<Lightningd>>> {
        self.subds.values()
    }

    fn next_id(&mut self) -> SubdId {
        let id = self.next_subd;
        self.next_subd += 1;
        id
    }

    fn master(&self) -> Result<Rc<RefCell<Lightningd>>, Error> {
        self.this.upgrade().ok_or_else(|| Error::Terminate(s!("master state is gone")))
    }

    /// Launches hsmd without supervision, giving it the node secret file.
    /// Returns its message socket.
    pub fn start_hsm(&mut self, secret: File) -> Result<OwnedFd, Error> {
        let plan = DescriptorPlan::new().with_owned(secret.into());
        let (pid, hsm) = launcher::launch_raw(&self.launch.daemon_dir, HSMD, plan, &self.launch.debug)
            .map_err(|err| {
                warn!("subd {} failed: {}", HSMD, err);
                err
            })?;
        self.unsupervised.push((HSMD, pid));
        Ok(hsm)
    }

    /// Launches the gossip role, hands it the hsmd connection and asks it to
    /// start listening.
    pub fn start_gossip(
        master: &Rc<RefCell<Self>>,
        bind: &[WireAddrOrSockname],
        hsm: OwnedFd,
    ) -> Result<(), Error> {
        let mut ld = master.borrow_mut();
        let id = ld.next_id();
        let gossip = Subdaemon::global(
            master,
            &ld.launch,
            id,
            &GOSSIPD,
            DescriptorPlan::new(),
            Box::new(workers::gossip_msg),
        )?;
        let init = GossipInit {
            node_id: ld.ledger.node_id(),
            bind: bind.to_vec(),
            dev_no_reconnect: ld.ledger.dev_no_reconnect(),
        };
        gossip.request(&init, Some(hsm), None, Box::new(workers::gossip_init_reply));
        ld.install_gossip(gossip);
        ld.reconnect_peers();
        Ok(())
    }

    fn install_gossip(&mut self, gossip: Rc<Subdaemon<Lightningd>>) {
        self.ledger.set_gossip(gossip.clone());
        self.subds.insert(gossip.id(), gossip.clone());
        self.gossip = Some(gossip);
    }

    /// Asks gossipd to reach every peer with a live channel restored from
    /// the store.
    fn reconnect_peers(&self) {
        let Some(gossip) = &self.gossip else { return };
        if self.ledger.dev_no_reconnect() {
            return;
        }
        let peers: BTreeSet<_> = self
            .ledger
            .channels()
            .filter(|channel| channel.persists() && channel.is_active() && channel.error().is_none())
            .map(Channel::peer)
            .collect();
        for peer in peers {
            debug!("Reaching out to {} to restore its channel", peer);
            gossip.reach_peer(peer);
        }
    }

    /// Launches a worker owning channel `dbid`, handing it `fds`. The
    /// previous owner of the channel, if any, is released.
    fn spawn_per_peer(
        &mut self,
        dbid: Dbid,
        schema: &'static RoleSchema,
        fds: Vec<OwnedFd>,
        handler: Handler<Lightningd>,
    ) -> Result<Rc<Subdaemon<Lightningd>>, Error> {
        let master = self.master()?;
        let plan = fds.into_iter().fold(DescriptorPlan::new(), DescriptorPlan::with_owned);
        let id = self.next_id();
        let subd = Subdaemon::per_peer(&master, &self.launch, id, schema, dbid, plan, handler)?;
        self.adopt(dbid, subd.clone());
        Ok(subd)
    }

    fn adopt(&mut self, dbid: Dbid, subd: Rc<Subdaemon<Lightningd>>) {
        self.subds.insert(subd.id(), subd.clone());
        self.ledger.set_owner(dbid, Some(subd));
    }

    /// Worker of role `schema` currently bound to channel `dbid`.
    fn owner_subd(&self, dbid: Dbid, schema: &RoleSchema) -> Option<Rc<Subdaemon<Lightningd>>> {
        self.subds
            .values()
            .find(|subd| subd.channel() == Some(dbid) && subd.name() == schema.role)
            .cloned()
    }

    /// Runs a JSON command. The response arrives on the returned receiver,
    /// possibly after further worker messages were processed.
    pub fn execute(
        master: &Rc<RefCell<Self>>,
        method: &str,
        params: Value,
        id: Value,
    ) -> oneshot::Receiver<Response> {
        let (cmd, rx) = Command::new(id, method);
        let mut ld = master.borrow_mut();
        let commands = ld.commands.clone();
        ld.begin_transaction();
        commands.dispatch(&mut ld, cmd, params);
        if let Err(err) = ld.commit_transaction() {
            ld.fatal(err);
        }
        rx
    }

    /// Stops every worker, waiting up to the shutdown timeout for each.
    /// Unsupervised workers go last, once the workers using them are gone.
    pub async fn shutdown(master: &Rc<RefCell<Self>>) {
        let (subds, unsupervised, timeout) = {
            let mut ld = master.borrow_mut();
            let subds = ld.subds.values().cloned().collect::<Vec<_>>();
            (subds, std::mem::take(&mut ld.unsupervised), ld.shutdown_timeout)
        };
        info!("Shutting down {} subdaemons", subds.len());
        for subd in subds {
            subd.shutdown(timeout).await;
        }
        for (name, pid) in unsupervised {
            match launcher::reap_within(pid, timeout).await {
                Some(status) => debug!("{}({}): exited with {:?}", name, pid, status),
                None => debug!("{}({}): exit status unknown", name, pid),
            }
        }
    }
}

impl Master for Lightningd {
    fn begin_transaction(&mut self) { self.ledger.store_mut().begin_transaction() }

    fn commit_transaction(&mut self) -> Result<(), Error> {
        self.ledger.store_mut().commit_transaction().map_err(Error::from)
    }

    fn peer_misbehaved(&mut self, dbid: Dbid, reason: String) { self.ledger.fail_permanent(dbid, &reason) }

    fn owner_died(&mut self, dbid: Dbid, reason: String) { self.ledger.fail_transient(dbid, &reason) }

    fn subdaemon_gone(&mut self, id: SubdId) {
        if self.subds.remove(&id).is_some() {
            trace!("Subdaemon {} removed, {} left", id, self.subds.len());
        }
    }

    fn fatal(&mut self, err: Error) {
        error!("{} {}", "Fatal:".err(), err.err_details());
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        self.stop.cancel();
    }
}

/// On-chain resolution is not part of this node: channels which have to be
/// closed on chain are only reported.
#[derive(Copy, Clone, Debug, Default)]
pub struct OnchainLog;

impl ChainResolver for OnchainLog {
    fn drop_to_chain(&self, channel: &Channel) {
        warn!(
            "Channel {}: has to be closed on chain ({})",
            channel.dbid(),
            channel.error().unwrap_or("no reason recorded")
        );
    }
}

pub fn run(config: Config) -> Result<(), Error> {
    debug!("Starting master runtime");
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    LocalSet::new().block_on(&runtime, serve(config))
}

async fn serve(config: Config) -> Result<(), Error> {
    fs::create_dir_all(&config.data_dir)?;
    let secret = load_or_create_secret(&config.hsm_secret_file())?;
    let keys = NodeKeys::derive(&secret)?;
    info!("{}: {}", "Local node id".ended(), keys.node_id.addr());

    let store = DiskStore::open(config.channel_dir())?;
    let disconnect = config.dev.disconnect.as_ref().map(DevDisconnect::open).transpose()?;
    let launch = LaunchConfig {
        daemon_dir: config.daemon_dir.clone(),
        debug: DebugOptions {
            debugger_for: config.dev.debug_subdaemon.clone(),
            disconnect_fd: disconnect.as_ref().map(DevDisconnect::raw_fd),
        },
        dev_fail: config.dev.subdaemon_fail,
    };
    let dev = DevOptions { no_reconnect: config.dev.no_reconnect, disconnect };
    let ledger = Ledger::new(keys.node_id, keys.peer_seed, Box::new(store), Rc::new(OnchainLog), dev);
    let ld = Lightningd::new(launch, ledger, config.shutdown_timeout);

    let loaded = ld.borrow_mut().ledger.load()?;
    info!("Restored {} channels", loaded.amount());
    let hsm = ld.borrow_mut().start_hsm(File::open(config.hsm_secret_file())?)?;
    Lightningd::start_gossip(&ld, &config.bind, hsm)?;
    info!("{}", "lightningd started".promo());

    let stop = ld.borrow().stop_token();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("{}", "Interrupted, stopping".action());
        }
        _ = stop.cancelled() => {}
    }

    Lightningd::shutdown(&ld).await;
    let failure = ld.borrow_mut().failure.take();
    match failure {
        Some(err) => Err(err),
        None => {
            info!("{}", "lightningd stopped".ended());
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    use bitcoin::secp256k1::PublicKey;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::channel::{test_pubkey, ChannelState, ShortChannelId};
    use crate::rpc::{ERROR_GENERIC, JSONRPC2_INVALID_PARAMS, JSONRPC2_METHOD_NOT_FOUND};
    use crate::store::{ChannelRecord, MemoryStore, Store};
    use crate::wire::msgs::{
        ChannelFundingLocked, ChannelGotShutdown, ChannelShutdownComplete, ClosingComplete,
        GossipPeerConnected, GossipReleasePeer, GossipReleasePeerReply, OpeningFunderReply,
        WireMessage, CHANNELD, CLOSINGD, OPENINGD,
    };
    use crate::wire::{Message, WireAddr};

    /// Directory where every per-peer worker is `cat`, which just sits on
    /// its message socket.
    fn worker_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for role in [OPENINGD.role, CHANNELD.role, CLOSINGD.role, HSMD] {
            std::os::unix::fs::symlink("/bin/cat", dir.path().join(role)).unwrap();
        }
        dir
    }

    fn node(daemon_dir: &Path, store: &MemoryStore) -> Rc<RefCell<Lightningd>> {
        let launch = LaunchConfig { daemon_dir: daemon_dir.to_path_buf(), ..LaunchConfig::default() };
        let ledger = Ledger::new(
            test_pubkey(1),
            [5u8; 32],
            Box::new(store.clone()),
            Rc::new(OnchainLog),
            DevOptions::default(),
        );
        Lightningd::new(launch, ledger, Duration::from_millis(500))
    }

    /// Supervises a worker connected over a socket pair; without `dbid` it
    /// becomes the gossip role. Returns the worker end of the pair.
    fn attach(
        ld: &Rc<RefCell<Lightningd>>,
        schema: &'static RoleSchema,
        handler: Handler<Lightningd>,
        dbid: Option<Dbid>,
    ) -> (Rc<Subdaemon<Lightningd>>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut node = ld.borrow_mut();
        let id = node.next_id();
        let subd =
            Subdaemon::attach(ld, &node.launch, id, schema, None, ours, handler, dbid.is_none()).unwrap();
        match dbid {
            Some(dbid) => {
                subd.bind_channel(dbid);
                node.adopt(dbid, subd.clone());
            }
            None => node.install_gossip(subd.clone()),
        }
        (subd, theirs)
    }

    fn channel_in(ld: &Rc<RefCell<Lightningd>>, peer: PublicKey, state: ChannelState) -> Dbid {
        let path = [
            ChannelState::Uninitialized,
            ChannelState::Openingd,
            ChannelState::ChanneldAwaitingLockin,
            ChannelState::ChanneldNormal,
            ChannelState::ChanneldShuttingDown,
            ChannelState::ClosingdSigexchange,
        ];
        let mut node = ld.borrow_mut();
        node.begin_transaction();
        let dbid = node.ledger.new_channel(peer);
        for pair in path.windows(2) {
            if node.ledger.channel(dbid).unwrap().state() == state {
                break;
            }
            node.ledger.set_state(dbid, pair[0], pair[1]);
        }
        node.commit_transaction().unwrap();
        dbid
    }

    fn frame(msg: &Message) -> Vec<u8> {
        let body = msg.to_body();
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend(body);
        out
    }

    fn send_fds(stream: &UnixStream, count: usize) {
        use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
        let file = tempfile::tempfile().unwrap();
        let raw = [file.as_raw_fd()];
        for _ in 0..count {
            sendmsg::<()>(
                stream.as_raw_fd(),
                &[std::io::IoSlice::new(&[0])],
                &[ControlMessage::ScmRights(&raw)],
                MsgFlags::empty(),
                None,
            )
            .unwrap();
        }
    }

    fn read_type(stream: &mut UnixStream, len: usize) -> (u16, Vec<u8>) {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        (u16::from_be_bytes([buf[4], buf[5]]), buf.split_off(6))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn owner(ld: &Rc<RefCell<Lightningd>>, dbid: Dbid) -> Option<String> {
        ld.borrow().ledger.channel(dbid).and_then(Channel::owner_name)
    }

    fn state(ld: &Rc<RefCell<Lightningd>>, dbid: Dbid) -> ChannelState {
        ld.borrow().ledger.channel(dbid).unwrap().state()
    }

    #[test]
    fn commands_without_workers() {
        let store = MemoryStore::new();
        let ld = node(Path::new("/nonexistent"), &store);

        let info = Lightningd::execute(&ld, "getinfo", json!([]), json!(1)).try_recv().unwrap();
        let info = info.result.unwrap();
        assert_eq!(info["id"], test_pubkey(1).to_string());
        assert_eq!(info["num_peers"], 0);

        let help = Lightningd::execute(&ld, "help", Value::Null, json!(2)).try_recv().unwrap();
        let names: Vec<String> = help.result.unwrap()["help"]
            .as_array()
            .unwrap()
            .iter()
            .map(|cmd| cmd["command"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["help", "getinfo", "listpeers", "fundchannel", "stop"]);

        let params = json!([test_pubkey(2).to_string(), 100_000]);
        let fund = Lightningd::execute(&ld, "fundchannel", params, json!(3)).try_recv().unwrap();
        assert_eq!(fund.error.as_ref().map(|err| err.code), Some(ERROR_GENERIC));
        assert_eq!(fund.error_message(), Some("Peer not connected"));

        let bad = Lightningd::execute(&ld, "fundchannel", json!(["nonsense"]), json!(4)).try_recv().unwrap();
        assert_eq!(bad.error.unwrap().code, JSONRPC2_INVALID_PARAMS);

        let unknown = Lightningd::execute(&ld, "connect", json!([]), json!(5)).try_recv().unwrap();
        assert_eq!(unknown.error.unwrap().code, JSONRPC2_METHOD_NOT_FOUND);

        let stop = Lightningd::execute(&ld, "stop", json!([]), json!(6)).try_recv().unwrap();
        assert_eq!(stop.result, Some(json!("Shutting down")));
        assert!(ld.borrow().stop_token().is_cancelled());
        assert!(ld.borrow().failure().is_none());
    }

    #[test]
    fn listpeers_reports_channels() {
        let store = MemoryStore::new();
        let ld = node(Path::new("/nonexistent"), &store);
        let peer = test_pubkey(2);
        let dbid = channel_in(&ld, peer, ChannelState::ChanneldNormal);
        let scid = ShortChannelId::new(600_000, 3, 0);
        ld.borrow_mut().ledger.set_scid(dbid, scid);

        let params = json!({ "id": peer.to_string() });
        let list = Lightningd::execute(&ld, "listpeers", params, json!(1)).try_recv().unwrap();
        let list = list.result.unwrap();
        assert_eq!(list["peers"][0]["id"], peer.to_string());
        assert_eq!(list["peers"][0]["channels"][0]["state"], "CHANNELD_NORMAL");
        assert_eq!(list["peers"][0]["channels"][0]["short_channel_id"], scid.to_string());
        assert_eq!(list["peers"][0]["channels"][0]["owner"], Value::Null);

        let params = json!([test_pubkey(3).to_string()]);
        let other = Lightningd::execute(&ld, "listpeers", params, json!(2)).try_recv().unwrap();
        assert_eq!(other.result.unwrap()["peers"], json!([]));
    }

    #[test]
    fn fatal_error_stops_node_once() {
        let ld = node(Path::new("/nonexistent"), &MemoryStore::new());
        ld.borrow_mut().fatal(Error::Terminate(s!("first")));
        ld.borrow_mut().fatal(Error::Terminate(s!("second")));
        let node = ld.borrow();
        assert!(node.stop_token().is_cancelled());
        assert!(matches!(node.failure(), Some(Error::Terminate(reason)) if reason == "first"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn peer_connection_starts_openingd() {
        LocalSet::new()
            .run_until(async {
                let dir = worker_dir();
                let store = MemoryStore::new();
                let ld = node(dir.path(), &store);
                let (_gossip, mut gossipd) = attach(&ld, &GOSSIPD, Box::new(workers::gossip_msg), None);

                let peer = test_pubkey(2);
                let connected = GossipPeerConnected { peer, addr: WireAddr::Padding };
                gossipd.write_all(&frame(&connected.to_message())).unwrap();
                send_fds(&gossipd, 2);
                settle().await;

                let dbid = ld.borrow().ledger.peer_active_channel(&peer).unwrap();
                assert_eq!(state(&ld, dbid), ChannelState::Openingd);
                assert!(owner(&ld, dbid).unwrap().starts_with("lightning_openingd("));
                assert_eq!(store.saves(), 0);

                Lightningd::shutdown(&ld).await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_openingd_forgets_channel() {
        LocalSet::new()
            .run_until(async {
                let store = MemoryStore::new();
                let ld = node(Path::new("/nonexistent"), &store);
                let (gossip, mut gossipd) = attach(&ld, &GOSSIPD, Box::new(workers::gossip_msg), None);

                let peer = test_pubkey(2);
                let connected = GossipPeerConnected { peer, addr: WireAddr::Padding };
                gossipd.write_all(&frame(&connected.to_message())).unwrap();
                send_fds(&gossipd, 2);
                settle().await;

                assert!(ld.borrow().ledger.peer(&peer).is_none());
                assert_eq!(store.deletes(), 1);
                assert!(!gossip.is_destroyed());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn funding_hands_over_to_channeld() {
        LocalSet::new()
            .run_until(async {
                let dir = worker_dir();
                let store = MemoryStore::new();
                let ld = node(dir.path(), &store);
                let peer = test_pubkey(2);
                let dbid = channel_in(&ld, peer, ChannelState::Openingd);
                let (opening, mut openingd) =
                    attach(&ld, &OPENINGD, Box::new(workers::openingd_msg), Some(dbid));

                let params = json!({ "id": peer.to_string(), "satoshi": 250_000 });
                let mut rx = Lightningd::execute(&ld, "fundchannel", params, json!(7));
                settle().await;
                assert!(rx.try_recv().is_err());
                let (ty, payload) = read_type(&mut openingd, 4 + 2 + 16);
                assert_eq!(ty, 6001);
                assert_eq!(&payload[..8], &250_000u64.to_be_bytes());

                let again = json!([peer.to_string(), 1000]);
                let busy = Lightningd::execute(&ld, "fundchannel", again, json!(8)).try_recv().unwrap();
                assert_eq!(busy.error_message(), Some("Already funding channel"));

                let scid = ShortChannelId::new(700_000, 5, 1);
                openingd.write_all(&frame(&OpeningFunderReply { scid }.to_message())).unwrap();
                send_fds(&openingd, 2);
                settle().await;

                let response = rx.try_recv().unwrap();
                assert_eq!(response.result.unwrap()["short_channel_id"], scid.to_string());
                assert_eq!(state(&ld, dbid), ChannelState::ChanneldAwaitingLockin);
                assert!(owner(&ld, dbid).unwrap().starts_with("lightning_channeld("));
                assert!(opening.is_destroyed());
                let record = store.record(dbid).unwrap();
                assert_eq!(record.state, ChannelState::ChanneldAwaitingLockin);
                assert_eq!(record.scid, Some(scid));
                assert_eq!(record.funding_sat, 250_000);

                Lightningd::shutdown(&ld).await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn channeld_drives_mutual_close() {
        LocalSet::new()
            .run_until(async {
                let dir = worker_dir();
                let store = MemoryStore::new();
                let ld = node(dir.path(), &store);
                let dbid = channel_in(&ld, test_pubkey(2), ChannelState::ChanneldAwaitingLockin);
                let (channeld, mut theirs) =
                    attach(&ld, &CHANNELD, Box::new(workers::channeld_msg), Some(dbid));

                let scid = ShortChannelId::new(700_001, 2, 0);
                theirs.write_all(&frame(&ChannelFundingLocked { scid }.to_message())).unwrap();
                settle().await;
                assert_eq!(state(&ld, dbid), ChannelState::ChanneldNormal);
                assert_eq!(store.record(dbid).unwrap().scid, Some(scid));

                let shutdown = ChannelGotShutdown { scriptpubkey: vec![0x00, 0x14] };
                theirs.write_all(&frame(&shutdown.to_message())).unwrap();
                settle().await;
                assert_eq!(state(&ld, dbid), ChannelState::ChanneldShuttingDown);

                theirs.write_all(&frame(&ChannelShutdownComplete {}.to_message())).unwrap();
                send_fds(&theirs, 2);
                settle().await;
                assert_eq!(state(&ld, dbid), ChannelState::ClosingdSigexchange);
                assert!(owner(&ld, dbid).unwrap().starts_with("lightning_closingd("));
                assert!(channeld.is_destroyed());

                Lightningd::shutdown(&ld).await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn closing_complete_releases_closingd() {
        LocalSet::new()
            .run_until(async {
                let store = MemoryStore::new();
                let ld = node(Path::new("/nonexistent"), &store);
                let dbid = channel_in(&ld, test_pubkey(2), ChannelState::ClosingdSigexchange);
                let (closingd, mut theirs) =
                    attach(&ld, &CLOSINGD, Box::new(workers::closingd_msg), Some(dbid));

                theirs.write_all(&frame(&ClosingComplete { fee_sat: 180 }.to_message())).unwrap();
                settle().await;

                assert_eq!(state(&ld, dbid), ChannelState::ClosingdComplete);
                assert_eq!(owner(&ld, dbid), None);
                assert!(closingd.is_destroyed());
                assert_eq!(store.record(dbid).unwrap().state, ChannelState::ClosingdComplete);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn misplaced_message_reconnects_peer() {
        LocalSet::new()
            .run_until(async {
                let store = MemoryStore::new();
                let ld = node(Path::new("/nonexistent"), &store);
                let peer = test_pubkey(2);
                let dbid = channel_in(&ld, peer, ChannelState::ChanneldNormal);
                let (_gossip, mut gossipd) = attach(&ld, &GOSSIPD, Box::new(workers::gossip_msg), None);
                let (channeld, mut theirs) =
                    attach(&ld, &CHANNELD, Box::new(workers::channeld_msg), Some(dbid));

                let locked = ChannelFundingLocked { scid: ShortChannelId::new(1, 1, 1) };
                theirs.write_all(&frame(&locked.to_message())).unwrap();
                settle().await;

                assert!(channeld.is_destroyed());
                assert_eq!(state(&ld, dbid), ChannelState::ChanneldNormal);
                assert_eq!(owner(&ld, dbid), None);
                let (ty, payload) = read_type(&mut gossipd, 4 + 2 + 33);
                assert_eq!(ty, 3010);
                assert_eq!(payload, peer.serialize().to_vec());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn restored_channel_resumes_with_channeld() {
        LocalSet::new()
            .run_until(async {
                let dir = worker_dir();
                let peer = test_pubkey(2);
                let mut store = MemoryStore::new();
                store.begin_transaction();
                store.save_channel(&ChannelRecord {
                    dbid: 4,
                    peer,
                    state: ChannelState::ChanneldNormal,
                    scid: Some(ShortChannelId::new(650_000, 9, 1)),
                    funding_sat: 1_000_000,
                    error: None,
                });
                store.commit_transaction().unwrap();

                let ld = node(dir.path(), &store);
                assert_eq!(ld.borrow_mut().ledger.load().unwrap(), 1);
                let (_gossip, mut gossipd) = attach(&ld, &GOSSIPD, Box::new(workers::gossip_msg), None);
                ld.borrow().reconnect_peers();
                settle().await;
                let (ty, _) = read_type(&mut gossipd, 4 + 2 + 33);
                assert_eq!(ty, 3010);

                let connected = GossipPeerConnected { peer, addr: WireAddr::Padding };
                gossipd.write_all(&frame(&connected.to_message())).unwrap();
                send_fds(&gossipd, 2);
                settle().await;

                assert!(owner(&ld, 4).unwrap().starts_with("lightning_channeld("));
                assert_eq!(ld.borrow().ledger.peer(&peer).unwrap().channels(), &[4]);

                Lightningd::shutdown(&ld).await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fundchannel_releases_peer_from_gossipd() {
        LocalSet::new()
            .run_until(async {
                let dir = worker_dir();
                let store = MemoryStore::new();
                let ld = node(dir.path(), &store);
                let (gossip, mut gossipd) = attach(&ld, &GOSSIPD, Box::new(workers::gossip_msg), None);

                let peer = test_pubkey(2);
                let params = json!([peer.to_string(), 300_000]);
                let mut rx = Lightningd::execute(&ld, "fundchannel", params, json!(1));
                settle().await;
                let (ty, payload) = read_type(&mut gossipd, 4 + 2 + 33);
                assert_eq!(ty, GossipReleasePeer::TYPE.to_u16());
                assert_eq!(payload, peer.serialize().to_vec());
                assert_eq!(gossip.pending_requests(), 1);

                let reply = GossipReleasePeerReply { addr: WireAddr::Padding };
                gossipd.write_all(&frame(&reply.to_message())).unwrap();
                send_fds(&gossipd, 2);
                settle().await;

                let dbid = ld.borrow().ledger.peer_active_channel(&peer).unwrap();
                assert_eq!(state(&ld, dbid), ChannelState::Openingd);
                assert!(ld.borrow().ledger.channel(dbid).unwrap().has_opening_cmd());
                assert_eq!(ld.borrow().ledger.channel(dbid).unwrap().funding_sat(), 300_000);
                let openingd = ld.borrow().owner_subd(dbid, &OPENINGD).unwrap();
                assert_eq!(openingd.pending_requests(), 1);
                assert!(rx.try_recv().is_err());

                Lightningd::shutdown(&ld).await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fundchannel_for_unknown_peer_fails() {
        LocalSet::new()
            .run_until(async {
                let ld = node(Path::new("/nonexistent"), &MemoryStore::new());
                let (_gossip, mut gossipd) = attach(&ld, &GOSSIPD, Box::new(workers::gossip_msg), None);

                let params = json!([test_pubkey(2).to_string(), 300_000]);
                let mut rx = Lightningd::execute(&ld, "fundchannel", params, json!(1));
                settle().await;
                read_type(&mut gossipd, 4 + 2 + 33);

                let fail = Message::new(GossipReleasePeer::TYPE.reply_fail(), vec![]);
                gossipd.write_all(&frame(&fail)).unwrap();
                settle().await;

                assert_eq!(rx.try_recv().unwrap().error_message(), Some("Peer not connected"));
                assert!(ld.borrow().ledger.peer(&test_pubkey(2)).is_none());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn openingd_exit_fails_pending_funding() {
        LocalSet::new()
            .run_until(async {
                let store = MemoryStore::new();
                let ld = node(Path::new("/nonexistent"), &store);
                let peer = test_pubkey(2);
                let dbid = channel_in(&ld, peer, ChannelState::Openingd);
                let (opening, mut openingd) =
                    attach(&ld, &OPENINGD, Box::new(workers::openingd_msg), Some(dbid));

                let params = json!([peer.to_string(), 100_000]);
                let mut rx = Lightningd::execute(&ld, "fundchannel", params, json!(1));
                settle().await;
                read_type(&mut openingd, 4 + 2 + 16);
                assert_eq!(opening.pending_requests(), 1);

                drop(openingd);
                settle().await;

                let response = rx.try_recv().unwrap();
                let message = response.error_message().unwrap();
                assert!(message.starts_with("Owning subdaemon lightning_openingd died"), "{}", message);
                assert!(opening.is_destroyed());
                assert!(ld.borrow().ledger.channel(dbid).is_none());
                assert!(ld.borrow().ledger.peer(&peer).is_none());
                assert_eq!(store.deletes(), 1);
                assert!(ld.borrow().failure().is_none());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn channeld_exit_reconnects_peer() {
        LocalSet::new()
            .run_until(async {
                let store = MemoryStore::new();
                let ld = node(Path::new("/nonexistent"), &store);
                let peer = test_pubkey(2);
                let dbid = channel_in(&ld, peer, ChannelState::ChanneldNormal);
                let (_gossip, mut gossipd) = attach(&ld, &GOSSIPD, Box::new(workers::gossip_msg), None);
                let (channeld, theirs) = attach(&ld, &CHANNELD, Box::new(workers::channeld_msg), Some(dbid));

                drop(theirs);
                settle().await;

                assert!(channeld.is_destroyed());
                assert_eq!(state(&ld, dbid), ChannelState::ChanneldNormal);
                assert_eq!(owner(&ld, dbid), None);
                assert_eq!(ld.borrow().ledger.channel(dbid).unwrap().error(), None);
                let (ty, payload) = read_type(&mut gossipd, 4 + 2 + 33);
                assert_eq!(ty, 3010);
                assert_eq!(payload, peer.serialize().to_vec());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stale_funder_reply_is_rejected() {
        LocalSet::new()
            .run_until(async {
                let store = MemoryStore::new();
                let ld = node(Path::new("/nonexistent"), &store);
                let peer = test_pubkey(2);
                let dbid = channel_in(&ld, peer, ChannelState::Openingd);
                let (opening, mut openingd) =
                    attach(&ld, &OPENINGD, Box::new(workers::openingd_msg), Some(dbid));

                let params = json!([peer.to_string(), 100_000]);
                let mut rx = Lightningd::execute(&ld, "fundchannel", params, json!(1));
                settle().await;
                read_type(&mut openingd, 4 + 2 + 16);

                {
                    let mut node = ld.borrow_mut();
                    node.begin_transaction();
                    node.ledger.set_state(dbid, ChannelState::Openingd, ChannelState::ChanneldAwaitingLockin);
                    node.commit_transaction().unwrap();
                }
                let reply = OpeningFunderReply { scid: ShortChannelId::new(700_000, 1, 0) };
                openingd.write_all(&frame(&reply.to_message())).unwrap();
                send_fds(&openingd, 2);
                settle().await;

                assert_eq!(rx.try_recv().unwrap().error_message(), Some("Channel is no longer being opened"));
                assert!(opening.is_destroyed());
                assert_eq!(state(&ld, dbid), ChannelState::ChanneldAwaitingLockin);
                assert_eq!(ld.borrow().ledger.channel(dbid).unwrap().scid(), None);
                assert!(ld.borrow().failure().is_none());
                // the store is not left inside a transaction
                let info = Lightningd::execute(&ld, "getinfo", json!([]), json!(2)).try_recv().unwrap();
                assert_eq!(info.result.unwrap()["num_peers"], 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn panicking_handler_stops_node() {
        LocalSet::new()
            .run_until(async {
                let ld = node(Path::new("/nonexistent"), &MemoryStore::new());
                let dbid = channel_in(&ld, test_pubkey(2), ChannelState::ChanneldNormal);
                let handler: Handler<Lightningd> = Box::new(
                    move |ld: &mut Lightningd, _: &Rc<Subdaemon<Lightningd>>, _: &Message, _: &mut Vec<OwnedFd>| -> Result<usize, Error> {
                        // not the state the channel is in
                        ld.ledger.set_state(dbid, ChannelState::Openingd, ChannelState::ChanneldAwaitingLockin);
                        Ok(0)
                    },
                );
                let (channeld, mut theirs) = attach(&ld, &CHANNELD, handler, Some(dbid));

                let locked = ChannelFundingLocked { scid: ShortChannelId::new(1, 1, 1) };
                theirs.write_all(&frame(&locked.to_message())).unwrap();
                settle().await;

                assert!(channeld.is_destroyed());
                let node = ld.borrow();
                assert!(node.stop_token().is_cancelled());
                assert!(matches!(node.failure(), Some(Error::Terminate(reason)) if reason.contains("panicked")));
                assert!(node.subdaemons().all(|subd| subd.id() != channeld.id()));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn hsmd_is_reaped_on_shutdown() {
        LocalSet::new()
            .run_until(async {
                let dir = worker_dir();
                let ld = node(dir.path(), &MemoryStore::new());
                let hsm = ld.borrow_mut().start_hsm(tempfile::tempfile().unwrap()).unwrap();
                assert_eq!(ld.borrow().unsupervised.len(), 1);
                let (_, pid) = ld.borrow().unsupervised[0];

                // hsmd is `cat`, which exits once its message socket closes
                drop(hsm);
                Lightningd::shutdown(&ld).await;
                assert!(ld.borrow().unsupervised.is_empty());
                assert_eq!(nix::sys::wait::waitpid(pid, None), Err(nix::errno::Errno::ECHILD));
            })
            .await;
    }
}
