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

//! Messages the workers send on their own, and the replies to the requests
//! the master issues.

use std::os::fd::OwnedFd;
use std::rc::Rc;

use bitcoin::secp256k1::PublicKey;
use serde_json::json;

use super::commands::{self, Funding};
use super::Lightningd;
use crate::channel::{ChannelState, Dbid};
use crate::rpc::{Command, ERROR_GENERIC};
use crate::service::LogStyle;
use crate::subd::Subdaemon;
use crate::wire::msgs::{
    parse_reply, ChannelFundingLocked, ChannelGotShutdown, ChannelInit, ChannelShutdownComplete,
    ClosingComplete, ClosingInit, GossipInit, GossipPeerConnected, GossipReleasePeer, OpeningFunder,
    OpeningInit, ReplyOutcome, WireMessage, CHANNELD, CLOSINGD, GOSSIPD, OPENINGD,
};
use crate::wire::Message;
use crate::Error;

type Subd = Rc<Subdaemon<Lightningd>>;

pub(super) fn gossip_msg(
    ld: &mut Lightningd,
    subd: &Subd,
    msg: &Message,
    fds: &mut Vec<OwnedFd>,
) -> Result<usize, Error> {
    if msg.ty != GossipPeerConnected::TYPE {
        return Err(Error::UnexpectedMessage(msg.ty, subd.name().to_owned()));
    }
    if fds.len() < GossipPeerConnected::FDS {
        return Ok(GossipPeerConnected::FDS);
    }
    let connected = GossipPeerConnected::from_message(msg)?;
    ld.peer_connected(connected, std::mem::take(fds));
    Ok(0)
}

pub(super) fn gossip_init_reply(
    ld: &mut Lightningd,
    _subd: &Subd,
    msg: &Message,
    _fds: Vec<OwnedFd>,
) -> Result<(), Error> {
    match parse_reply::<GossipInit>(msg)? {
        ReplyOutcome::Success(reply) => {
            for addr in &reply.bound {
                info!("{} {}", "Listening on".progress(), addr.addr());
            }
            if reply.bound.is_empty() {
                debug!("gossipd is not listening for incoming connections");
            }
            trace!("gossipd serves node {}", ld.ledger.node_id());
            Ok(())
        }
        ReplyOutcome::Failure => Err(Error::WorkerFailure(GOSSIPD.role.to_owned(), s!("init refused"))),
    }
}

pub(super) fn openingd_msg(
    _ld: &mut Lightningd,
    subd: &Subd,
    msg: &Message,
    _fds: &mut Vec<OwnedFd>,
) -> Result<usize, Error> {
    Err(Error::UnexpectedMessage(msg.ty, subd.name().to_owned()))
}

pub(super) fn channeld_msg(
    ld: &mut Lightningd,
    subd: &Subd,
    msg: &Message,
    fds: &mut Vec<OwnedFd>,
) -> Result<usize, Error> {
    let Some(dbid) = subd.channel() else {
        debug!("{}: ignoring message for a released channel", subd);
        return Ok(0);
    };
    let ty = msg.ty;
    if ty == ChannelFundingLocked::TYPE {
        let locked = ChannelFundingLocked::from_message(msg)?;
        ld.expect_state(subd, dbid, ChannelState::ChanneldAwaitingLockin, ty)?;
        ld.ledger.set_scid(dbid, locked.scid);
        ld.ledger.set_state(dbid, ChannelState::ChanneldAwaitingLockin, ChannelState::ChanneldNormal);
    } else if ty == ChannelGotShutdown::TYPE {
        let shutdown = ChannelGotShutdown::from_message(msg)?;
        ld.expect_state(subd, dbid, ChannelState::ChanneldNormal, ty)?;
        debug!("Channel {}: peer closes to {} byte script", dbid, shutdown.scriptpubkey.len());
        ld.ledger.set_state(dbid, ChannelState::ChanneldNormal, ChannelState::ChanneldShuttingDown);
    } else if ty == ChannelShutdownComplete::TYPE {
        ChannelShutdownComplete::from_message(msg)?;
        ld.expect_state(subd, dbid, ChannelState::ChanneldShuttingDown, ty)?;
        if fds.len() < ChannelShutdownComplete::FDS {
            return Ok(ChannelShutdownComplete::FDS);
        }
        ld.ledger.set_state(dbid, ChannelState::ChanneldShuttingDown, ChannelState::ClosingdSigexchange);
        ld.start_closingd(dbid, std::mem::take(fds));
    } else {
        return Err(Error::UnexpectedMessage(ty, subd.name().to_owned()));
    }
    Ok(0)
}

pub(super) fn closingd_msg(
    ld: &mut Lightningd,
    subd: &Subd,
    msg: &Message,
    _fds: &mut Vec<OwnedFd>,
) -> Result<usize, Error> {
    let Some(dbid) = subd.channel() else { return Ok(0) };
    if msg.ty != ClosingComplete::TYPE {
        return Err(Error::UnexpectedMessage(msg.ty, subd.name().to_owned()));
    }
    let complete = ClosingComplete::from_message(msg)?;
    ld.expect_state(subd, dbid, ChannelState::ClosingdSigexchange, msg.ty)?;
    info!("Channel {}: mutual close paid {} sat in fees", dbid, complete.fee_sat.amount());
    ld.ledger.set_state(dbid, ChannelState::ClosingdSigexchange, ChannelState::ClosingdComplete);
    // nothing left for closingd to do
    ld.ledger.set_owner(dbid, None);
    Ok(0)
}

impl Lightningd {
    /// Workers may only report what their channel state allows.
    fn expect_state(
        &self,
        subd: &Subd,
        dbid: Dbid,
        state: ChannelState,
        ty: crate::wire::MsgType,
    ) -> Result<(), Error> {
        match self.ledger.channel(dbid) {
            Some(channel) if channel.state() == state => Ok(()),
            Some(channel) => {
                warn!("{}: message {} in state {}", subd, ty, channel.state());
                Err(Error::UnexpectedMessage(ty, subd.name().to_owned()))
            }
            None => Err(Error::UnexpectedMessage(ty, subd.name().to_owned())),
        }
    }

    /// A peer finished the handshake with gossipd and its connection is
    /// handed over to the worker its channel needs.
    fn peer_connected(&mut self, connected: GossipPeerConnected, fds: Vec<OwnedFd>) {
        let peer = connected.peer;
        info!("Peer {} connected from {}", peer, connected.addr);

        if let Some(dbid) = self.ledger.peer_active_channel(&peer) {
            let (state, failed) = match self.ledger.channel(dbid) {
                Some(channel) => (channel.state(), channel.error().is_some()),
                None => return,
            };
            if !state.persists() {
                // the opening attempt died with the old connection
                self.ledger.fail_transient(dbid, "peer reconnected");
            } else if failed {
                info!("Channel {}: {} reconnected, but the channel is being closed on chain", dbid, peer);
                return;
            } else if state == ChannelState::ClosingdSigexchange {
                self.start_closingd(dbid, fds);
                return;
            } else {
                self.start_channeld(dbid, fds, true);
                return;
            }
        }

        self.open_channel(peer, fds);
    }

    /// Creates a channel with `peer` and starts openingd on its connection.
    fn open_channel(&mut self, peer: PublicKey, fds: Vec<OwnedFd>) -> Option<Dbid> {
        let dbid = self.ledger.new_channel(peer);
        let seed = *self.ledger.channel(dbid)?.seed();
        match self.spawn_per_peer(dbid, &OPENINGD, fds, Box::new(openingd_msg)) {
            Ok(subd) => {
                self.ledger.set_state(dbid, ChannelState::Uninitialized, ChannelState::Openingd);
                subd.send_msg(&OpeningInit { seed, peer });
                Some(dbid)
            }
            Err(err) => {
                warn!("Could not start {} for {}: {}", OPENINGD.role, peer, err);
                self.ledger.free_channel(dbid, "Could not start openingd");
                None
            }
        }
    }

    /// gossipd answered a request to hand over the connection of `peer`,
    /// which `cmd` wants to fund a channel with.
    pub(super) fn peer_released(
        &mut self,
        peer: PublicKey,
        cmd: Command,
        funding: Funding,
        msg: &Message,
        fds: Vec<OwnedFd>,
    ) -> Result<(), Error> {
        let released = match parse_reply::<GossipReleasePeer>(msg)? {
            ReplyOutcome::Success(released) => released,
            ReplyOutcome::Failure => {
                cmd.fail(ERROR_GENERIC, "Peer not connected");
                return Ok(());
            }
        };
        if let Some(dbid) = self.ledger.peer_active_channel(&peer) {
            // connected on its own in the meantime
            drop(fds);
            commands::fund_channel(self, dbid, cmd, funding);
            return Ok(());
        }
        info!("Peer {} released by gossipd, connected from {}", peer, released.addr);
        match self.open_channel(peer, fds) {
            Some(dbid) => commands::fund_channel(self, dbid, cmd, funding),
            None => cmd.fail(ERROR_GENERIC, "Could not start openingd"),
        }
        Ok(())
    }

    fn start_channeld(&mut self, dbid: Dbid, fds: Vec<OwnedFd>, reconnected: bool) {
        let Some(channel) = self.ledger.channel(dbid) else { return };
        let init = ChannelInit { seed: *channel.seed(), scid: channel.scid(), reconnected };
        match self.spawn_per_peer(dbid, &CHANNELD, fds, Box::new(channeld_msg)) {
            Ok(subd) => subd.send_msg(&init),
            Err(err) => {
                warn!("Could not start {} for channel {}: {}", CHANNELD.role, dbid, err);
                self.ledger.fail_transient(dbid, "Could not start channeld");
            }
        }
    }

    fn start_closingd(&mut self, dbid: Dbid, fds: Vec<OwnedFd>) {
        let Some(channel) = self.ledger.channel(dbid) else { return };
        let init = ClosingInit { seed: *channel.seed(), scid: channel.scid() };
        match self.spawn_per_peer(dbid, &CLOSINGD, fds, Box::new(closingd_msg)) {
            Ok(subd) => subd.send_msg(&init),
            Err(err) => {
                warn!("Could not start {} for channel {}: {}", CLOSINGD.role, dbid, err);
                self.ledger.fail_transient(dbid, "Could not start closingd");
            }
        }
    }

    /// Funding transaction is negotiated: the channel persists from now on
    /// and channeld takes over the peer connection.
    pub(super) fn funder_reply(
        &mut self,
        subd: &Subd,
        dbid: Dbid,
        msg: &Message,
        fds: Vec<OwnedFd>,
    ) -> Result<(), Error> {
        let reply = match parse_reply::<OpeningFunder>(msg)? {
            ReplyOutcome::Success(reply) => reply,
            ReplyOutcome::Failure => {
                return Err(Error::WorkerFailure(OPENINGD.role.to_owned(), s!("funding failed")))
            }
        };
        if let Err(err) = self.expect_state(subd, dbid, ChannelState::Openingd, msg.ty) {
            if let Some(cmd) = self.ledger.take_opening_cmd(dbid) {
                cmd.fail(ERROR_GENERIC, "Channel is no longer being opened");
            }
            return Err(err);
        }
        self.ledger.set_scid(dbid, reply.scid);
        self.ledger.set_state(dbid, ChannelState::Openingd, ChannelState::ChanneldAwaitingLockin);

        let cmd = self.ledger.take_opening_cmd(dbid);
        self.start_channeld(dbid, fds, false);
        let Some(cmd) = cmd else { return Ok(()) };
        match self.ledger.channel(dbid) {
            Some(channel) if channel.owner_name().is_some() => cmd.success(json!({
                "channel_id": dbid,
                "short_channel_id": reply.scid.to_string(),
            })),
            _ => cmd.fail(ERROR_GENERIC, "Channel funded, but channeld could not be started"),
        }
        Ok(())
    }
}
