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

//! Channels, their peers and the collaborators a channel reports to.

mod failure;
mod ledger;

use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use bitcoin::hashes::{sha256, Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

pub use failure::DevDisconnect;
pub use ledger::{DevOptions, Ledger};

use crate::lifeline::Lifeline;
use crate::rpc::Command;
use crate::store::ChannelRecord;
use crate::wire::{WireDecode, WireEncode, WireError, WireReader};

/// Database id of a channel; never zero for a stored channel.
pub type Dbid = u64;

/// Channel lifecycle states, in the order a channel goes through them.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    #[display("UNINITIALIZED")]
    Uninitialized,

    #[display("OPENINGD")]
    Openingd,

    #[display("CHANNELD_AWAITING_LOCKIN")]
    ChanneldAwaitingLockin,

    #[display("CHANNELD_NORMAL")]
    ChanneldNormal,

    #[display("CHANNELD_SHUTTING_DOWN")]
    ChanneldShuttingDown,

    #[display("CLOSINGD_SIGEXCHANGE")]
    ClosingdSigexchange,

    #[display("CLOSINGD_COMPLETE")]
    ClosingdComplete,

    #[display("FUNDING_SPEND_SEEN")]
    FundingSpendSeen,

    #[display("ONCHAIN")]
    Onchain,
}

impl ChannelState {
    /// Once the funding transaction is negotiated the channel must not be
    /// lost silently.
    pub fn persists(self) -> bool { self >= ChannelState::ChanneldAwaitingLockin }

    pub fn is_active(self) -> bool {
        !matches!(
            self,
            ChannelState::ClosingdComplete | ChannelState::FundingSpendSeen | ChannelState::Onchain
        )
    }
}

/// Short channel id: funding block height, transaction index and output.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", transparent)]
pub struct ShortChannelId(u64);

impl ShortChannelId {
    pub fn new(block: u32, tx: u32, output: u16) -> ShortChannelId {
        ShortChannelId(
            ((block as u64 & 0xFF_FFFF) << 40) | ((tx as u64 & 0xFF_FFFF) << 16) | output as u64,
        )
    }

    pub fn block(self) -> u32 { (self.0 >> 40) as u32 }

    pub fn tx(self) -> u32 { ((self.0 >> 16) & 0xFF_FFFF) as u32 }

    pub fn output(self) -> u16 { self.0 as u16 }

    pub fn to_u64(self) -> u64 { self.0 }
}

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block(), self.tx(), self.output())
    }
}

impl WireEncode for ShortChannelId {
    fn wire_encode(&self, out: &mut Vec<u8>) { self.0.wire_encode(out) }
}

impl WireDecode for ShortChannelId {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        u64::wire_decode(reader).map(ShortChannelId)
    }
}

/// Whoever currently drives a channel, normally a per-peer worker.
pub trait Owner {
    fn name(&self) -> String;

    /// The channel is being taken away from this owner.
    fn release_channel(&self, dbid: Dbid);
}

/// Requests the channel layer makes to the gossip role.
pub trait GossipControl {
    fn disable_channel(&self, scid: ShortChannelId, direction: u8, active: bool);

    fn reach_peer(&self, peer: PublicKey);
}

/// On-chain resolution path for channels which can not be closed
/// cooperatively any more.
pub trait ChainResolver {
    fn drop_to_chain(&self, channel: &Channel);
}

pub struct Channel {
    pub(crate) dbid: Dbid,
    pub(crate) peer: PublicKey,
    pub(crate) state: ChannelState,
    pub(crate) owner: Option<Rc<dyn Owner>>,
    /// First protocol error which failed the channel.
    pub(crate) error: Option<String>,
    pub(crate) seed: [u8; 32],
    pub(crate) scid: Option<ShortChannelId>,
    pub(crate) funding_sat: u64,
    /// Command waiting for the channel to be funded.
    pub(crate) opening_cmd: Option<Command>,
    lifeline: Rc<Lifeline>,
}

impl Channel {
    pub(crate) fn new(dbid: Dbid, peer: PublicKey, seed: [u8; 32]) -> Channel {
        Channel {
            dbid,
            peer,
            state: ChannelState::Uninitialized,
            owner: None,
            error: None,
            seed,
            scid: None,
            funding_sat: 0,
            opening_cmd: None,
            lifeline: Rc::new(Lifeline::new()),
        }
    }

    pub(crate) fn with_record(record: ChannelRecord, seed: [u8; 32]) -> Channel {
        let mut channel = Channel::new(record.dbid, record.peer, seed);
        channel.state = record.state;
        channel.error = record.error;
        channel.scid = record.scid;
        channel.funding_sat = record.funding_sat;
        channel
    }

    pub fn to_record(&self) -> ChannelRecord {
        ChannelRecord {
            dbid: self.dbid,
            peer: self.peer,
            state: self.state,
            scid: self.scid,
            funding_sat: self.funding_sat,
            error: self.error.clone(),
        }
    }

    pub fn dbid(&self) -> Dbid { self.dbid }

    pub fn peer(&self) -> PublicKey { self.peer }

    pub fn state(&self) -> ChannelState { self.state }

    pub fn persists(&self) -> bool { self.state.persists() }

    pub fn is_active(&self) -> bool { self.state.is_active() }

    pub fn error(&self) -> Option<&str> { self.error.as_deref() }

    pub fn seed(&self) -> &[u8; 32] { &self.seed }

    pub fn scid(&self) -> Option<ShortChannelId> { self.scid }

    pub fn funding_sat(&self) -> u64 { self.funding_sat }

    pub fn owner_name(&self) -> Option<String> { self.owner.as_ref().map(|owner| owner.name()) }

    pub fn has_opening_cmd(&self) -> bool { self.opening_cmd.is_some() }

    /// Destroyed together with the channel; requests made on behalf of the
    /// channel hang their callbacks on it.
    pub fn lifeline(&self) -> &Rc<Lifeline> { &self.lifeline }
}

impl Drop for Channel {
    fn drop(&mut self) { self.lifeline.destroy() }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Peer {
    pub(crate) id: PublicKey,
    /// In creation order.
    pub(crate) channels: Vec<Dbid>,
}

impl Peer {
    pub fn id(&self) -> PublicKey { self.id }

    pub fn channels(&self) -> &[Dbid] { &self.channels }
}

/// Single-block HKDF-SHA256 (RFC 5869) producing 32 bytes.
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let mut engine = HmacEngine::<sha256::Hash>::new(salt);
    engine.input(ikm);
    let prk = Hmac::<sha256::Hash>::from_engine(engine);

    let mut engine = HmacEngine::<sha256::Hash>::new(&prk[..]);
    engine.input(info);
    engine.input(&[1u8]);
    Hmac::<sha256::Hash>::from_engine(engine).into_inner()
}

/// Secret unique to a channel and reproducible across restarts.
///
/// # Panics
///
/// If `dbid` is zero.
pub fn derive_channel_seed(peer_seed: &[u8; 32], peer: &PublicKey, dbid: Dbid) -> [u8; 32] {
    assert_ne!(dbid, 0, "channel seed requires a stored channel");
    let mut input = Vec::with_capacity(33 + 8);
    input.extend_from_slice(&peer.serialize());
    input.extend_from_slice(&dbid.to_le_bytes());
    hkdf_sha256(peer_seed, &input, b"per-peer seed")
}

#[cfg(test)]
pub(crate) fn test_pubkey(n: u8) -> PublicKey {
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    let sk = SecretKey::from_slice(&[n.max(1); 32]).expect("valid test key");
    PublicKey::from_secret_key(&Secp256k1::new(), &sk)
}
