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

//! Messages exchanged between the master and its workers.
//!
//! Every message is a big-endian `u16` type followed by a type-specific
//! payload. Request types have their reply at `REPLY_OFFSET` and, where a
//! request declares one, a failure reply at `REPLYFAIL_OFFSET`.

mod addr;
mod codec;
pub mod msgs;
mod schema;
mod status;

use std::fmt::{self, Display, Formatter};

pub use addr::{WireAddr, WireAddrOrSockname, SOCKNAME_LEN};
pub use codec::{
    decode_payload, encode_payload, WireDecode, WireEncode, WireError, WireReader,
};
pub use schema::{MsgKind, MsgSpec, RoleSchema, SchemaError};
pub use status::{FailClass, StatusMsg, STATUS_FAIL, STATUS_TRACE};

/// Offset between a request type and its reply type.
pub const REPLY_OFFSET: u16 = 100;
/// Offset between a request type and its failure reply type.
pub const REPLYFAIL_OFFSET: u16 = 200;
/// Upper bound on a single message body.
pub const MAX_MSG_LEN: usize = 16 * 1024 * 1024;

/// Numeric message type.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display(inner)]
pub struct MsgType(u16);

impl From<u16> for MsgType {
    fn from(ty: u16) -> Self { MsgType(ty) }
}

impl MsgType {
    pub const fn new(ty: u16) -> MsgType { MsgType(ty) }

    pub const fn to_u16(self) -> u16 { self.0 }

    pub const fn reply(self) -> MsgType { MsgType(self.0 + REPLY_OFFSET) }

    pub const fn reply_fail(self) -> MsgType { MsgType(self.0 + REPLYFAIL_OFFSET) }
}

/// A single framed message: type plus opaque payload.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    pub ty: MsgType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(ty: impl Into<MsgType>, payload: Vec<u8>) -> Message {
        Message { ty: ty.into(), payload }
    }

    /// Parses a message body (type + payload) as it comes out of a frame.
    pub fn from_body(body: Vec<u8>) -> Result<Message, WireError> {
        if body.len() < 2 {
            return Err(WireError::NoType(body.len()));
        }
        let ty = u16::from_be_bytes([body[0], body[1]]);
        Ok(Message { ty: MsgType(ty), payload: body[2..].to_vec() })
    }

    /// Serializes the body (type + payload), without the frame length.
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.payload.len() + 2);
        body.extend_from_slice(&self.ty.to_u16().to_be_bytes());
        body.extend_from_slice(&self.payload);
        body
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}({} bytes)", self.ty, self.payload.len())
    }
}
