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

//! Typed payloads of the messages the master exchanges with its workers,
//! and the per-role message tables.

use bitcoin::secp256k1::PublicKey;

use super::{
    decode_payload, encode_payload, Message, MsgSpec, MsgType, RoleSchema, WireAddr,
    WireAddrOrSockname, WireDecode, WireEncode, WireError, WireReader,
};
use crate::channel::ShortChannelId;

/// Payload bound to a single message type.
pub trait WireMessage: WireEncode + WireDecode {
    const TYPE: MsgType;

    fn to_message(&self) -> Message { Message::new(Self::TYPE, encode_payload(self)) }

    fn from_message(msg: &Message) -> Result<Self, WireError> {
        if msg.ty != Self::TYPE {
            return Err(WireError::UnexpectedType(msg.ty.to_u16()));
        }
        decode_payload(&msg.payload)
    }
}

/// Request with a statically known reply.
///
/// The reply type is always `TYPE + REPLY_OFFSET`; requests with
/// `HAS_FAIL` may instead be answered by an empty failure reply at
/// `TYPE + REPLYFAIL_OFFSET`, which carries no descriptors.
pub trait WireRequest: WireMessage {
    type Reply: WireMessage;

    /// Number of descriptors following a successful reply.
    const REPLY_FDS: usize;
    const HAS_FAIL: bool;
}

/// Decoded answer to a request.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ReplyOutcome<T> {
    Success(T),
    Failure,
}

/// Decodes a message received as the answer to request `R`.
pub fn parse_reply<R: WireRequest>(msg: &Message) -> Result<ReplyOutcome<R::Reply>, WireError> {
    if msg.ty == R::TYPE.reply() {
        decode_payload(&msg.payload).map(ReplyOutcome::Success)
    } else if R::HAS_FAIL && msg.ty == R::TYPE.reply_fail() {
        Ok(ReplyOutcome::Failure)
    } else {
        Err(WireError::UnexpectedType(msg.ty.to_u16()))
    }
}

macro_rules! wire_msg {
    ($(#[$attr:meta])* $name:ident = $ty:literal { $($field:ident : $fty:ty),* $(,)? }) => {
        $(#[$attr])*
        #[derive(Clone, PartialEq, Eq, Debug)]
        pub struct $name {
            $(pub $field: $fty),*
        }

        impl WireEncode for $name {
            #[allow(unused_variables)]
            fn wire_encode(&self, out: &mut Vec<u8>) {
                $(self.$field.wire_encode(out);)*
            }
        }

        impl WireDecode for $name {
            #[allow(unused_variables)]
            fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
                Ok($name { $($field: <$fty as WireDecode>::wire_decode(reader)?),* })
            }
        }

        impl WireMessage for $name {
            const TYPE: MsgType = MsgType::new($ty);
        }
    };
}

macro_rules! wire_request {
    ($name:ident => $reply:ident, fds: $fds:literal, fail: $fail:literal) => {
        impl WireRequest for $name {
            type Reply = $reply;
            const REPLY_FDS: usize = $fds;
            const HAS_FAIL: bool = $fail;
        }
    };
}

// gossipd

/// Signing worker. It is launched unsupervised and its message socket is
/// handed to gossipd right after `gossipctl_init`.
pub const HSMD: &str = "lightning_hsmd";

wire_msg!(
    /// Starts the gossip role with the addresses it should listen on; the
    /// master follows it with the hsmd connection.
    GossipInit = 3000 {
        node_id: PublicKey,
        bind: Vec<WireAddrOrSockname>,
        dev_no_reconnect: bool,
    }
);
wire_msg!(GossipInitReply = 3100 { bound: Vec<WireAddrOrSockname> });
wire_request!(GossipInit => GossipInitReply, fds: 0, fail: false);

wire_msg!(
    /// Asks gossipd to hand a connected peer over to the master.
    GossipReleasePeer = 3013 { peer: PublicKey }
);
wire_msg!(GossipReleasePeerReply = 3113 { addr: WireAddr });
wire_request!(GossipReleasePeer => GossipReleasePeerReply, fds: 2, fail: true);

wire_msg!(GossipReachPeer = 3010 { peer: PublicKey });

wire_msg!(GossipDisableChannel = 3019 {
    scid: ShortChannelId,
    direction: u8,
    active: bool,
});

wire_msg!(
    /// Peer finished the handshake; followed by the peer and gossip
    /// connection descriptors.
    GossipPeerConnected = 3002 { peer: PublicKey, addr: WireAddr }
);

impl GossipPeerConnected {
    pub const FDS: usize = 2;
}

// openingd

wire_msg!(OpeningInit = 6000 { seed: [u8; 32], peer: PublicKey });

wire_msg!(OpeningFunder = 6001 { funding_sat: u64, push_msat: u64 });
wire_msg!(OpeningFunderReply = 6101 { scid: ShortChannelId });
wire_request!(OpeningFunder => OpeningFunderReply, fds: 2, fail: false);

// channeld

wire_msg!(ChannelInit = 1000 {
    seed: [u8; 32],
    scid: Option<ShortChannelId>,
    reconnected: bool,
});
wire_msg!(ChannelFundingLocked = 1006 { scid: ShortChannelId });
wire_msg!(ChannelGotShutdown = 1024 { scriptpubkey: Vec<u8> });
wire_msg!(ChannelShutdownComplete = 1025 {});

impl ChannelShutdownComplete {
    pub const FDS: usize = 2;
}

// closingd

wire_msg!(ClosingInit = 2001 { seed: [u8; 32], scid: Option<ShortChannelId> });
wire_msg!(ClosingComplete = 2004 { fee_sat: u64 });

pub static GOSSIPD: RoleSchema = RoleSchema {
    role: "lightning_gossipd",
    messages: &[
        MsgSpec::request::<GossipInit>("gossipctl_init"),
        MsgSpec::reply::<GossipInit>("gossipctl_init_reply"),
        MsgSpec::request::<GossipReleasePeer>("gossipctl_release_peer"),
        MsgSpec::reply::<GossipReleasePeer>("gossipctl_release_peer_reply"),
        MsgSpec::reply_fail::<GossipReleasePeer>("gossipctl_release_peer_replyfail"),
        MsgSpec::notify::<GossipReachPeer>("gossipctl_reach_peer"),
        MsgSpec::notify::<GossipDisableChannel>("gossip_disable_channel"),
        MsgSpec::unsolicited::<GossipPeerConnected>("gossip_peer_connected", GossipPeerConnected::FDS),
    ],
};

pub static OPENINGD: RoleSchema = RoleSchema {
    role: "lightning_openingd",
    messages: &[
        MsgSpec::notify::<OpeningInit>("opening_init"),
        MsgSpec::request::<OpeningFunder>("opening_funder"),
        MsgSpec::reply::<OpeningFunder>("opening_funder_reply"),
    ],
};

pub static CHANNELD: RoleSchema = RoleSchema {
    role: "lightning_channeld",
    messages: &[
        MsgSpec::notify::<ChannelInit>("channel_init"),
        MsgSpec::unsolicited::<ChannelFundingLocked>("channel_funding_locked", 0),
        MsgSpec::unsolicited::<ChannelGotShutdown>("channel_got_shutdown", 0),
        MsgSpec::unsolicited::<ChannelShutdownComplete>(
            "channel_shutdown_complete",
            ChannelShutdownComplete::FDS,
        ),
    ],
};

pub static CLOSINGD: RoleSchema = RoleSchema {
    role: "lightning_closingd",
    messages: &[
        MsgSpec::notify::<ClosingInit>("closing_init"),
        MsgSpec::unsolicited::<ClosingComplete>("closing_complete", 0),
    ],
};

pub static ALL_ROLES: [&RoleSchema; 4] = [&GOSSIPD, &OPENINGD, &CHANNELD, &CLOSINGD];
