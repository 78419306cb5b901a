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

use std::io;

use amplify::IoError;

use crate::config::ConfigError;
use crate::launcher::SpawnError;
use crate::request::ReplyMismatch;
use crate::store::StoreError;
use crate::wire::{MsgType, WireError};

#[derive(Debug, Display, From, Error)]
#[display(doc_comments)]
#[non_exhaustive]
pub enum Error {
    /// I/O error: {0:?}
    #[from(io::Error)]
    Io(IoError),

    /// system call failure: {0}
    #[from]
    Sys(nix::errno::Errno),

    /// failed to launch a worker: {0}
    #[from]
    Spawn(SpawnError),

    /// malformed message: {0}
    #[from]
    Malformed(WireError),

    /// protocol violation: {0}
    #[from]
    ReplyMismatch(ReplyMismatch),

    /// worker connection is closed
    Closed,

    /// worker announced a descriptor but sent none
    NoDescriptor,

    /// `{1}` sent message {0} which is not expected from it
    UnexpectedMessage(MsgType, String),

    /// worker `{0}` must not exit, yet it terminated with {1}
    MustNotExit(String, String),

    /// worker `{0}` failed: {1}
    WorkerFailure(String, String),

    /// storage failure: {0}
    #[from]
    Store(StoreError),

    /// configuration error: {0}
    #[from]
    Config(ConfigError),

    /// unrecoverable error "{0}"
    Terminate(String),
}

impl Error {
    /// Whether the error describes the worker connection going away rather
    /// than anything the worker said.
    pub fn is_closed(&self) -> bool { matches!(self, Error::Closed) }
}
