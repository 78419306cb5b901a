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

use std::collections::BTreeSet;

use super::msgs::{WireMessage, WireRequest};
use super::{MsgType, STATUS_FAIL, STATUS_TRACE};

/// Role a message type plays in the master <-> worker conversation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MsgKind {
    /// Master -> worker request expecting a reply.
    Request { reply_fds: usize, has_fail: bool },
    /// Worker -> master reply to a request.
    Reply { fds: usize },
    /// Worker -> master failure reply; never carries descriptors.
    ReplyFail,
    /// Master -> worker message without a reply.
    Notify,
    /// Worker -> master message which is not a reply.
    Unsolicited { fds: usize },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MsgSpec {
    pub ty: MsgType,
    pub name: &'static str,
    pub kind: MsgKind,
}

impl MsgSpec {
    pub const fn request<R: WireRequest>(name: &'static str) -> MsgSpec {
        MsgSpec {
            ty: R::TYPE,
            name,
            kind: MsgKind::Request { reply_fds: R::REPLY_FDS, has_fail: R::HAS_FAIL },
        }
    }

    pub const fn reply<R: WireRequest>(name: &'static str) -> MsgSpec {
        MsgSpec { ty: R::TYPE.reply(), name, kind: MsgKind::Reply { fds: R::REPLY_FDS } }
    }

    pub const fn reply_fail<R: WireRequest>(name: &'static str) -> MsgSpec {
        MsgSpec { ty: R::TYPE.reply_fail(), name, kind: MsgKind::ReplyFail }
    }

    pub const fn notify<M: WireMessage>(name: &'static str) -> MsgSpec {
        MsgSpec { ty: M::TYPE, name, kind: MsgKind::Notify }
    }

    pub const fn unsolicited<M: WireMessage>(name: &'static str, fds: usize) -> MsgSpec {
        MsgSpec { ty: M::TYPE, name, kind: MsgKind::Unsolicited { fds } }
    }
}

/// Inconsistencies in a role's message table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum SchemaError {
    /// message type {0} is declared twice
    DuplicateType(MsgType),

    /// request {0} has no reply entry
    MissingReply(MsgType),

    /// request {0} declares a failure reply which is not in the table
    MissingFailReply(MsgType),

    /// reply {0} does not answer any request
    OrphanReply(MsgType),

    /// failure reply {0} belongs to a request without a failure variant
    UndeclaredFailReply(MsgType),

    /// reply {0} carries a different number of descriptors than its request expects
    FdCountMismatch(MsgType),

    /// message type {0} collides with the status range
    ReservedType(MsgType),
}

/// Static message table of one worker role.
#[derive(Debug)]
pub struct RoleSchema {
    pub role: &'static str,
    pub messages: &'static [MsgSpec],
}

impl RoleSchema {
    pub fn spec(&self, ty: MsgType) -> Option<&'static MsgSpec> {
        self.messages.iter().find(|spec| spec.ty == ty)
    }

    /// Human-readable name of a message type, including status types.
    pub fn name_of(&self, ty: MsgType) -> &'static str {
        match ty.to_u16() {
            STATUS_TRACE => "status_trace",
            code if code & STATUS_FAIL != 0 => "status_fail",
            _ => self.spec(ty).map(|spec| spec.name).unwrap_or("unknown"),
        }
    }

    /// Whether the worker understands `ty` when sent by the master.
    pub fn accepts(&self, ty: MsgType) -> bool {
        matches!(self.spec(ty), Some(MsgSpec { kind: MsgKind::Request { .. } | MsgKind::Notify, .. }))
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = BTreeSet::new();
        for spec in self.messages {
            if spec.ty.to_u16() >= STATUS_TRACE {
                return Err(SchemaError::ReservedType(spec.ty));
            }
            if !seen.insert(spec.ty) {
                return Err(SchemaError::DuplicateType(spec.ty));
            }
        }

        for spec in self.messages {
            match spec.kind {
                MsgKind::Request { reply_fds, has_fail } => {
                    match self.spec(spec.ty.reply()).map(|reply| reply.kind) {
                        Some(MsgKind::Reply { fds }) if fds == reply_fds => {}
                        Some(MsgKind::Reply { .. }) => {
                            return Err(SchemaError::FdCountMismatch(spec.ty.reply()))
                        }
                        _ => return Err(SchemaError::MissingReply(spec.ty)),
                    }
                    let fail = self.spec(spec.ty.reply_fail()).map(|fail| fail.kind);
                    if has_fail && fail != Some(MsgKind::ReplyFail) {
                        return Err(SchemaError::MissingFailReply(spec.ty));
                    }
                }
                MsgKind::Reply { .. } => {
                    if !self.is_request(spec.ty.to_u16().checked_sub(super::REPLY_OFFSET)) {
                        return Err(SchemaError::OrphanReply(spec.ty));
                    }
                }
                MsgKind::ReplyFail => {
                    let request = spec
                        .ty
                        .to_u16()
                        .checked_sub(super::REPLYFAIL_OFFSET)
                        .and_then(|ty| self.spec(MsgType::new(ty)));
                    match request.map(|req| req.kind) {
                        Some(MsgKind::Request { has_fail: true, .. }) => {}
                        Some(MsgKind::Request { has_fail: false, .. }) => {
                            return Err(SchemaError::UndeclaredFailReply(spec.ty))
                        }
                        _ => return Err(SchemaError::OrphanReply(spec.ty)),
                    }
                }
                MsgKind::Notify | MsgKind::Unsolicited { .. } => {}
            }
        }
        Ok(())
    }

    fn is_request(&self, ty: Option<u16>) -> bool {
        matches!(
            ty.and_then(|ty| self.spec(MsgType::new(ty))),
            Some(MsgSpec { kind: MsgKind::Request { .. }, .. })
        )
    }
}
