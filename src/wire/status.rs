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

use super::{Message, WireError};

/// Trace status type: payload is a printable log line.
pub const STATUS_TRACE: u16 = 0x7FFF;
/// Bit marking the failure status family.
pub const STATUS_FAIL: u16 = 0x8000;

/// Failure class reported by a worker right before it exits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
pub enum FailClass {
    #[display("STATUS_FAIL_MASTER_IO")]
    MasterIo = 0x8000,

    #[display("STATUS_FAIL_HSM_IO")]
    HsmIo = 0x8001,

    #[display("STATUS_FAIL_GOSSIP_IO")]
    GossipIo = 0x8002,

    #[display("STATUS_FAIL_INTERNAL_ERROR")]
    InternalError = 0x8003,

    #[display("STATUS_FAIL_PEER_IO")]
    PeerIo = 0x8004,

    #[display("STATUS_FAIL_PEER_BAD")]
    PeerBad = 0x8005,
}

impl FailClass {
    pub fn from_type(ty: u16) -> Option<FailClass> {
        Some(match ty {
            0x8000 => FailClass::MasterIo,
            0x8001 => FailClass::HsmIo,
            0x8002 => FailClass::GossipIo,
            0x8003 => FailClass::InternalError,
            0x8004 => FailClass::PeerIo,
            0x8005 => FailClass::PeerBad,
            _ => return None,
        })
    }

    /// Failures caused by the remote peer are expected and are never fatal
    /// to the node.
    pub fn is_peer_caused(self) -> bool { matches!(self, FailClass::PeerIo | FailClass::PeerBad) }
}

/// Out-of-band status message sent by a worker.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StatusMsg {
    Trace(String),
    Fail(FailClass, String),
}

impl StatusMsg {
    /// Classifies a message: `Ok(None)` if it is not a status message at all.
    pub fn parse(msg: &Message) -> Result<Option<StatusMsg>, WireError> {
        let ty = msg.ty.to_u16();
        if ty == STATUS_TRACE {
            return printable(&msg.payload).map(StatusMsg::Trace).map(Some);
        }
        if ty & STATUS_FAIL == 0 {
            return Ok(None);
        }
        let class = FailClass::from_type(ty).ok_or(WireError::UnknownStatus(ty))?;
        let text = printable(&msg.payload)?;
        Ok(Some(StatusMsg::Fail(class, text)))
    }
}

fn printable(payload: &[u8]) -> Result<String, WireError> {
    if let Some(byte) = payload.iter().find(|b| !(b.is_ascii_graphic() || **b == b' ')) {
        return Err(WireError::NonPrintable(*byte));
    }
    // all bytes are ascii at this point
    Ok(payload.iter().map(|b| *b as char).collect())
}
