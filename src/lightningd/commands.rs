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

use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::str::FromStr;

use bitcoin::secp256k1::PublicKey;
use serde_json::{json, Value};

use super::Lightningd;
use crate::channel::{Channel, ChannelState, Dbid};
use crate::rpc::{param, Command, CommandTable, JsonCommand, ERROR_GENERIC, JSONRPC2_INVALID_PARAMS};
use crate::subd::Subdaemon;
use crate::wire::msgs::{GossipReleasePeer, OpeningFunder, OPENINGD};
use crate::wire::Message;

pub(super) fn table() -> CommandTable<Lightningd> {
    CommandTable::new()
        .with(JsonCommand {
            name: "help",
            handler: json_help,
            description: "List available commands, or give verbose help on one {command}",
            verbose: Some(
                "help [command]\nWithout arguments lists every command with a short description; \
                 with a command name prints its detailed usage.",
            ),
        })
        .with(JsonCommand {
            name: "getinfo",
            handler: json_getinfo,
            description: "Show information about this node",
            verbose: None,
        })
        .with(JsonCommand {
            name: "listpeers",
            handler: json_listpeers,
            description: "Show current peers, if {id} is specified only that peer",
            verbose: Some(
                "listpeers [id]\nLists peers together with their channels: state, short channel \
                 id, funding amount, owning subdaemon and the error which failed the channel.",
            ),
        })
        .with(JsonCommand {
            name: "fundchannel",
            handler: json_fundchannel,
            description: "Fund channel with {id} using {satoshi} satoshis, pushing {push_msat} to the peer",
            verbose: Some(
                "fundchannel id satoshi [push_msat]\nThe peer must be connected; gossipd hands \
                 over its connection if no channel is open with it yet. Completes once the \
                 funding transaction is negotiated, returning the short channel id.",
            ),
        })
        .with(JsonCommand {
            name: "stop",
            handler: json_stop,
            description: "Shut down the lightningd process",
            verbose: None,
        })
}

fn json_help(ld: &mut Lightningd, cmd: Command, params: Value) {
    let command = param(&params, 0, "command").and_then(Value::as_str);
    match ld.commands.help(command) {
        Ok(help) => cmd.success(help),
        Err(err) => cmd.fail(JSONRPC2_INVALID_PARAMS, err),
    }
}

fn json_getinfo(ld: &mut Lightningd, cmd: Command, _params: Value) {
    let ledger = &ld.ledger;
    cmd.success(json!({
        "id": ledger.node_id().to_string(),
        "num_peers": ledger.peers().count(),
        "num_active_channels": ledger.channels().filter(|channel| channel.is_active()).count(),
        "num_subdaemons": ld.subds.len(),
    }))
}

fn channel_json(channel: &Channel) -> Value {
    json!({
        "channel_id": channel.dbid(),
        "state": channel.state(),
        "short_channel_id": channel.scid().map(|scid| scid.to_string()),
        "funding_sat": channel.funding_sat(),
        "owner": channel.owner_name(),
        "error": channel.error(),
    })
}

fn json_listpeers(ld: &mut Lightningd, cmd: Command, params: Value) {
    let filter = match param(&params, 0, "id").map(parse_pubkey).transpose() {
        Ok(filter) => filter,
        Err(err) => return cmd.fail(JSONRPC2_INVALID_PARAMS, err),
    };
    let ledger = &ld.ledger;
    let peers: Vec<Value> = ledger
        .peers()
        .filter(|peer| filter.map(|id| id == peer.id()).unwrap_or(true))
        .map(|peer| {
            let channels: Vec<Value> = peer
                .channels()
                .iter()
                .filter_map(|dbid| ledger.channel(*dbid))
                .map(channel_json)
                .collect();
            json!({ "id": peer.id().to_string(), "channels": channels })
        })
        .collect();
    cmd.success(json!({ "peers": peers }))
}

fn parse_pubkey(value: &Value) -> Result<PublicKey, String> {
    value
        .as_str()
        .and_then(|s| PublicKey::from_str(s).ok())
        .ok_or_else(|| format!("'{}' is not a valid node id", value))
}

fn parse_u64(value: Option<&Value>, name: &str) -> Result<Option<u64>, String> {
    match value {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("'{}' should be an amount, not '{}'", name, value)),
    }
}

/// Amounts requested by `fundchannel`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) struct Funding {
    pub funding_sat: u64,
    pub push_msat: u64,
}

fn json_fundchannel(ld: &mut Lightningd, mut cmd: Command, params: Value) {
    let peer = match param(&params, 0, "id").ok_or_else(|| s!("missing required parameter 'id'")) {
        Ok(value) => match parse_pubkey(value) {
            Ok(peer) => peer,
            Err(err) => return cmd.fail(JSONRPC2_INVALID_PARAMS, err),
        },
        Err(err) => return cmd.fail(JSONRPC2_INVALID_PARAMS, err),
    };
    let amounts = parse_u64(param(&params, 1, "satoshi"), "satoshi")
        .and_then(|sat| sat.ok_or_else(|| s!("missing required parameter 'satoshi'")))
        .and_then(|sat| Ok((sat, parse_u64(param(&params, 2, "push_msat"), "push_msat")?)));
    let funding = match amounts {
        Ok((funding_sat, push)) => Funding { funding_sat, push_msat: push.unwrap_or_default() },
        Err(err) => return cmd.fail(JSONRPC2_INVALID_PARAMS, err),
    };

    if let Some(dbid) = ld.ledger.peer_active_channel(&peer) {
        return fund_channel(ld, dbid, cmd, funding);
    }
    // gossipd may hold a connection to the peer without a channel
    let Some(gossip) = ld.gossip.clone() else {
        return cmd.fail(ERROR_GENERIC, "Peer not connected");
    };
    cmd.still_pending();
    debug!("Asking gossipd to release {}", peer);
    gossip.request(
        &GossipReleasePeer { peer },
        None,
        None,
        Box::new(move |ld: &mut Lightningd, _: &Rc<Subdaemon<Lightningd>>, msg: &Message, fds: Vec<OwnedFd>| {
            ld.peer_released(peer, cmd, funding, msg, fds)
        }),
    );
}

/// Asks openingd of channel `dbid` to fund it; `cmd` completes once the
/// funding transaction is negotiated.
pub(super) fn fund_channel(ld: &mut Lightningd, dbid: Dbid, mut cmd: Command, funding: Funding) {
    let lifeline = match ld.ledger.channel(dbid) {
        Some(channel) if channel.state() != ChannelState::Openingd => {
            return cmd.fail(ERROR_GENERIC, format!("Peer already {}", channel.state()))
        }
        Some(channel) if channel.has_opening_cmd() => {
            return cmd.fail(ERROR_GENERIC, "Already funding channel")
        }
        Some(channel) => channel.lifeline().clone(),
        None => return cmd.fail(ERROR_GENERIC, "Peer not connected"),
    };
    let Some(openingd) = ld.owner_subd(dbid, &OPENINGD) else {
        return cmd.fail(ERROR_GENERIC, "Peer is not being opened");
    };

    cmd.still_pending();
    if let Err(cmd) = ld.ledger.set_opening_cmd(dbid, cmd) {
        return cmd.fail(ERROR_GENERIC, "Channel is gone");
    }
    ld.ledger.set_funding(dbid, funding.funding_sat);
    info!("Channel {}: funding {} sat", dbid, funding.funding_sat);
    openingd.request(
        &OpeningFunder { funding_sat: funding.funding_sat, push_msat: funding.push_msat },
        None,
        Some(&lifeline),
        Box::new(move |ld: &mut Lightningd, subd: &Rc<Subdaemon<Lightningd>>, msg: &Message, fds: Vec<OwnedFd>| {
            ld.funder_reply(subd, dbid, msg, fds)
        }),
    );
}

fn json_stop(ld: &mut Lightningd, cmd: Command, _params: Value) {
    info!("Stop requested");
    cmd.success(json!("Shutting down"));
    ld.stop.cancel();
}
