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

use std::collections::BTreeMap;
use std::rc::Rc;

use bitcoin::secp256k1::PublicKey;

use super::{
    derive_channel_seed, ChainResolver, Channel, ChannelState, DevDisconnect, Dbid, GossipControl,
    Owner, Peer, ShortChannelId,
};
use crate::rpc::{Command, ERROR_GENERIC};
use crate::store::{Store, StoreError};

/// Developer switches affecting channel failure handling.
#[derive(Debug, Default)]
pub struct DevOptions {
    /// Never ask gossipd to reconnect after a transient failure.
    pub no_reconnect: bool,
    pub disconnect: Option<DevDisconnect>,
}

/// The channel and peer graph of the node, kept in sync with the store.
pub struct Ledger {
    node_id: PublicKey,
    peer_seed: [u8; 32],
    peers: BTreeMap<PublicKey, Peer>,
    channels: BTreeMap<Dbid, Channel>,
    pub(super) store: Box<dyn Store>,
    pub(super) gossip: Option<Rc<dyn GossipControl>>,
    pub(super) chain: Rc<dyn ChainResolver>,
    pub(super) dev: DevOptions,
}

impl Ledger {
    pub fn new(
        node_id: PublicKey,
        peer_seed: [u8; 32],
        store: Box<dyn Store>,
        chain: Rc<dyn ChainResolver>,
        dev: DevOptions,
    ) -> Ledger {
        Ledger {
            node_id,
            peer_seed,
            peers: empty!(),
            channels: empty!(),
            store,
            gossip: None,
            chain,
            dev,
        }
    }

    pub fn node_id(&self) -> PublicKey { self.node_id }

    pub fn set_gossip(&mut self, gossip: Rc<dyn GossipControl>) { self.gossip = Some(gossip) }

    pub fn dev_no_reconnect(&self) -> bool { self.dev.no_reconnect }

    pub fn store_mut(&mut self) -> &mut dyn Store { self.store.as_mut() }

    /// Restores the persisted channels. Returns how many were loaded.
    pub fn load(&mut self) -> Result<usize, StoreError> {
        let records = self.store.load_channels()?;
        let count = records.len();
        for record in records {
            let seed = derive_channel_seed(&self.peer_seed, &record.peer, record.dbid);
            debug!("Loaded channel {} with {} in {}", record.dbid, record.peer, record.state);
            let channel = Channel::with_record(record, seed);
            self.link(channel);
        }
        Ok(count)
    }

    /// Creates an uninitialized channel with `peer`, creating the peer if
    /// needed.
    pub fn new_channel(&mut self, peer: PublicKey) -> Dbid {
        let dbid = self.store.next_dbid();
        let seed = derive_channel_seed(&self.peer_seed, &peer, dbid);
        debug!("New channel {} with {}", dbid, peer);
        self.link(Channel::new(dbid, peer, seed));
        dbid
    }

    fn link(&mut self, channel: Channel) {
        let dbid = channel.dbid;
        self.peers
            .entry(channel.peer)
            .or_insert_with(|| Peer { id: channel.peer, channels: vec![] })
            .channels
            .push(dbid);
        self.channels.insert(dbid, channel);
    }

    pub fn channel(&self, dbid: Dbid) -> Option<&Channel> { self.channels.get(&dbid) }

    pub(super) fn channel_mut(&mut self, dbid: Dbid) -> Option<&mut Channel> {
        self.channels.get_mut(&dbid)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> { self.channels.values() }

    pub fn peer(&self, id: &PublicKey) -> Option<&Peer> { self.peers.get(id) }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> { self.peers.values() }

    /// First channel with `peer` which is not yet closed.
    pub fn peer_active_channel(&self, peer: &PublicKey) -> Option<Dbid> {
        self.peers.get(peer)?.channels.iter().copied().find(|dbid| {
            self.channels.get(dbid).map(Channel::is_active).unwrap_or_default()
        })
    }

    /// Our side of the channel in gossip messages.
    pub fn direction(&self, peer: &PublicKey) -> u8 {
        if self.node_id.serialize() < peer.serialize() {
            0
        } else {
            1
        }
    }

    /// Moves channel `dbid` from `old` to `new`, saving it if it has to
    /// persist.
    ///
    /// # Panics
    ///
    /// If the channel is unknown or is not in state `old`.
    pub fn set_state(&mut self, dbid: Dbid, old: ChannelState, new: ChannelState) {
        let channel = self.channels.get_mut(&dbid).unwrap_or_else(|| panic!("unknown channel {}", dbid));
        info!("Channel {}: State changed from {} to {}", dbid, channel.state, new);
        if channel.state != old {
            panic!("channel state {} should be {}", channel.state, old);
        }
        channel.state = new;
        if channel.persists() {
            self.store.save_channel(&channel.to_record());
        }
    }

    /// Replaces the owner of a channel; the previous owner is told to let
    /// go of it.
    pub fn set_owner(&mut self, dbid: Dbid, owner: Option<Rc<dyn Owner>>) {
        let old = match self.channels.get_mut(&dbid) {
            Some(channel) => std::mem::replace(&mut channel.owner, owner),
            None => return,
        };
        if let Some(old) = old {
            old.release_channel(dbid);
        }
    }

    pub fn set_scid(&mut self, dbid: Dbid, scid: ShortChannelId) {
        if let Some(channel) = self.channels.get_mut(&dbid) {
            channel.scid = Some(scid);
        }
    }

    pub fn set_funding(&mut self, dbid: Dbid, funding_sat: u64) {
        if let Some(channel) = self.channels.get_mut(&dbid) {
            channel.funding_sat = funding_sat;
        }
    }

    /// Parks `cmd` on the channel until funding completes or the channel
    /// goes away. Gives the command back if the channel is unknown.
    pub fn set_opening_cmd(&mut self, dbid: Dbid, cmd: Command) -> Result<(), Command> {
        match self.channels.get_mut(&dbid) {
            Some(channel) => {
                channel.opening_cmd = Some(cmd);
                Ok(())
            }
            None => Err(cmd),
        }
    }

    pub fn take_opening_cmd(&mut self, dbid: Dbid) -> Option<Command> {
        self.channels.get_mut(&dbid)?.opening_cmd.take()
    }

    /// Forgets a channel: fails its pending opening command with `why`,
    /// deletes its record and detaches its owner. The peer goes away with
    /// its last channel.
    pub fn free_channel(&mut self, dbid: Dbid, why: &str) {
        self.set_owner(dbid, None);
        let mut channel = match self.channels.remove(&dbid) {
            Some(channel) => channel,
            None => return,
        };
        if let Some(cmd) = channel.opening_cmd.take() {
            cmd.fail(ERROR_GENERIC, why);
        }
        self.store.delete_channel(dbid);

        if let Some(peer) = self.peers.get_mut(&channel.peer) {
            peer.channels.retain(|id| *id != dbid);
            if peer.channels.is_empty() {
                debug!("Last channel of {} is gone, forgetting peer", channel.peer);
                self.peers.remove(&channel.peer);
            }
        }
    }
}
