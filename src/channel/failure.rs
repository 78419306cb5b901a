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

//! Permanent and transient channel failures.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use super::{Dbid, Ledger};

/// Marker a developer writes into the disconnect file to turn the next
/// transient failure into a permanent one.
const PERMFAIL: &[u8; 8] = b"permfail";

/// The `--dev-disconnect` file, shared with every worker.
#[derive(Debug)]
pub struct DevDisconnect {
    file: File,
}

impl DevDisconnect {
    pub fn open(path: impl AsRef<Path>) -> Result<DevDisconnect, io::Error> {
        File::open(path).map(DevDisconnect::from)
    }

    pub fn raw_fd(&self) -> RawFd { self.file.as_raw_fd() }

    /// Consumes the `permfail` marker if it is next in the file; otherwise
    /// the read position is left where it was.
    pub fn permanent(&mut self) -> bool {
        match self.check() {
            Ok(found) => found,
            Err(err) => {
                warn!("Unable to read the dev-disconnect file: {}", err);
                false
            }
        }
    }

    fn check(&mut self) -> Result<bool, io::Error> {
        let mut buf = [0u8; 8];
        let mut read = 0;
        while read < buf.len() {
            match self.file.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        if read == buf.len() && &buf == PERMFAIL {
            return Ok(true);
        }
        self.file.seek(SeekFrom::Current(-(read as i64)))?;
        Ok(false)
    }
}

impl From<File> for DevDisconnect {
    fn from(file: File) -> Self { DevDisconnect { file } }
}

impl Ledger {
    /// The channel can not continue: it is handed to the chain if it
    /// persists and forgotten otherwise.
    pub fn fail_permanent(&mut self, dbid: Dbid, why: &str) {
        let (peer, state, scid) = match self.channel(dbid) {
            Some(channel) => (channel.peer, channel.state, channel.scid),
            None => {
                debug!("Permanent failure of unknown channel {}: {}", dbid, why);
                return;
            }
        };

        if let (Some(scid), Some(gossip)) = (scid, &self.gossip) {
            gossip.disable_channel(scid, self.direction(&peer), false);
        }
        warn!("Channel {}: Peer permanent failure in {}: {}", dbid, state, why);

        let Some(channel) = self.channel_mut(dbid) else { return };
        // later errors, e.g. from on-chain resolution, do not replace it
        if channel.error.is_none() {
            channel.error = Some(why.to_owned());
        }
        let persists = channel.persists();

        self.set_owner(dbid, None);
        if persists {
            if let Some(channel) = self.channel(dbid) {
                self.chain.drop_to_chain(channel);
            }
        } else {
            self.free_channel(dbid, why);
        }
    }

    /// Worker-side invariant violation affecting the channel.
    pub fn internal_error(&mut self, dbid: Dbid, why: &str) {
        if let Some(channel) = self.channel(dbid) {
            error!("Channel {}: Peer internal error {}: {}", dbid, channel.state, why);
        }
        self.fail_permanent(dbid, "Internal error");
    }

    /// Lost the connection or the worker: reconnect to the peer if the
    /// channel is worth it, forget the channel otherwise.
    pub fn fail_transient(&mut self, dbid: Dbid, why: &str) {
        let state = match self.channel(dbid) {
            Some(channel) => channel.state,
            None => {
                debug!("Transient failure of unknown channel {}: {}", dbid, why);
                return;
            }
        };
        info!("Channel {}: Peer transient failure in {}: {}", dbid, state, why);

        if self.dev.disconnect.as_mut().map(DevDisconnect::permanent).unwrap_or_default() {
            self.internal_error(dbid, "dev_disconnect permfail");
            return;
        }

        self.set_owner(dbid, None);

        let Some(channel) = self.channel(dbid) else { return };
        if !channel.persists() {
            info!("Channel {}: Only reached state {}: forgetting", dbid, state);
            self.free_channel(dbid, why);
            return;
        }

        // a channel already failed permanently is on its way to the chain
        if channel.is_active() && channel.error.is_none() {
            if self.dev.no_reconnect {
                return;
            }
            if let Some(gossip) = &self.gossip {
                gossip.reach_peer(channel.peer);
            }
        }
    }
}
