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

//! Transactional channel storage.
//!
//! Every message a worker sends is processed inside one transaction: writes
//! are staged and reach the backing storage only on commit.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use amplify::IoError;
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelState, Dbid, ShortChannelId};

const CHANNEL_EXT: &str = "channel";

/// Persisted part of a channel.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
pub struct ChannelRecord {
    pub dbid: Dbid,
    pub peer: PublicKey,
    pub state: ChannelState,
    pub scid: Option<ShortChannelId>,
    pub funding_sat: u64,
    pub error: Option<String>,
}

#[derive(Debug, Display, From, Error)]
#[display(doc_comments)]
pub enum StoreError {
    /// I/O error: {0:?}
    #[from(io::Error)]
    Io(IoError),

    /// channel file `{0}` is corrupted: {1}
    Corrupted(String, String),
}

pub trait Store {
    /// # Panics
    ///
    /// If a transaction is already open.
    fn begin_transaction(&mut self);

    fn commit_transaction(&mut self) -> Result<(), StoreError>;

    /// # Panics
    ///
    /// Outside of a transaction.
    fn save_channel(&mut self, record: &ChannelRecord);

    /// # Panics
    ///
    /// Outside of a transaction.
    fn delete_channel(&mut self, dbid: Dbid);

    fn load_channels(&mut self) -> Result<Vec<ChannelRecord>, StoreError>;

    /// Fresh non-zero id, never handed out before.
    fn next_dbid(&mut self) -> Dbid;
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Staged {
    Save(ChannelRecord),
    Delete(Dbid),
}

/// Writes collected by an open transaction.
#[derive(Debug, Default)]
struct Transaction {
    open: bool,
    staged: Vec<Staged>,
}

impl Transaction {
    fn begin(&mut self) {
        assert!(!self.open, "nested store transaction");
        self.open = true;
    }

    fn stage(&mut self, op: Staged) {
        assert!(self.open, "store write outside of a transaction");
        self.staged.push(op);
    }

    fn finish(&mut self) -> Vec<Staged> {
        assert!(self.open, "commit without a transaction");
        self.open = false;
        std::mem::take(&mut self.staged)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    tx: Transaction,
    records: BTreeMap<Dbid, ChannelRecord>,
    last_dbid: Dbid,
    saves: usize,
    deletes: usize,
}

/// In-memory store; clones share the same contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Rc<RefCell<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore { MemoryStore::default() }

    /// Number of `save_channel` calls so far.
    pub fn saves(&self) -> usize { self.inner.borrow().saves }

    /// Number of `delete_channel` calls so far.
    pub fn deletes(&self) -> usize { self.inner.borrow().deletes }

    pub fn record(&self, dbid: Dbid) -> Option<ChannelRecord> {
        self.inner.borrow().records.get(&dbid).cloned()
    }
}

impl Store for MemoryStore {
    fn begin_transaction(&mut self) { self.inner.borrow_mut().tx.begin() }

    fn commit_transaction(&mut self) -> Result<(), StoreError> {
        let mut inner = self.inner.borrow_mut();
        for op in inner.tx.finish() {
            match op {
                Staged::Save(record) => {
                    inner.last_dbid = inner.last_dbid.max(record.dbid);
                    inner.records.insert(record.dbid, record);
                }
                Staged::Delete(dbid) => {
                    inner.records.remove(&dbid);
                }
            }
        }
        Ok(())
    }

    fn save_channel(&mut self, record: &ChannelRecord) {
        let mut inner = self.inner.borrow_mut();
        inner.tx.stage(Staged::Save(record.clone()));
        inner.saves += 1;
    }

    fn delete_channel(&mut self, dbid: Dbid) {
        let mut inner = self.inner.borrow_mut();
        inner.tx.stage(Staged::Delete(dbid));
        inner.deletes += 1;
    }

    fn load_channels(&mut self) -> Result<Vec<ChannelRecord>, StoreError> {
        Ok(self.inner.borrow().records.values().cloned().collect())
    }

    fn next_dbid(&mut self) -> Dbid {
        let mut inner = self.inner.borrow_mut();
        inner.last_dbid += 1;
        inner.last_dbid
    }
}

/// One JSON file per channel under a directory.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    tx: Transaction,
    last_dbid: Dbid,
}

impl DiskStore {
    /// Opens the channel directory, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<DiskStore, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut store = DiskStore { dir, tx: Transaction::default(), last_dbid: 0 };
        store.last_dbid = store.stored_ids()?.into_iter().max().unwrap_or_default();
        Ok(store)
    }

    pub fn channel_file(&self, dbid: Dbid) -> PathBuf {
        let mut file = self.dir.join(dbid.to_string());
        file.set_extension(CHANNEL_EXT);
        file
    }

    fn stored_ids(&self) -> Result<Vec<Dbid>, StoreError> {
        let mut ids = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CHANNEL_EXT) {
                continue;
            }
            match path.file_stem().and_then(|stem| stem.to_str()).map(str::parse::<Dbid>) {
                Some(Ok(dbid)) => ids.push(dbid),
                _ => warn!("Skipping unexpected file {} in the channel directory", path.display()),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn write(&self, record: &ChannelRecord) -> Result<(), StoreError> {
        let file = self.channel_file(record.dbid);
        let data = serde_json::to_vec_pretty(record)
            .map_err(|err| StoreError::Corrupted(file.display().to_string(), err.to_string()))?;
        let mut tmp = file.clone();
        tmp.set_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &file)?;
        Ok(())
    }
}

impl Store for DiskStore {
    fn begin_transaction(&mut self) { self.tx.begin() }

    fn commit_transaction(&mut self) -> Result<(), StoreError> {
        for op in self.tx.finish() {
            match op {
                Staged::Save(record) => self.write(&record)?,
                Staged::Delete(dbid) => match fs::remove_file(self.channel_file(dbid)) {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                    _ => {}
                },
            }
        }
        Ok(())
    }

    fn save_channel(&mut self, record: &ChannelRecord) {
        self.last_dbid = self.last_dbid.max(record.dbid);
        self.tx.stage(Staged::Save(record.clone()))
    }

    fn delete_channel(&mut self, dbid: Dbid) { self.tx.stage(Staged::Delete(dbid)) }

    fn load_channels(&mut self) -> Result<Vec<ChannelRecord>, StoreError> {
        let mut records = vec![];
        for dbid in self.stored_ids()? {
            let file = self.channel_file(dbid);
            let data = fs::read(&file)?;
            let record: ChannelRecord = serde_json::from_slice(&data)
                .map_err(|err| StoreError::Corrupted(file.display().to_string(), err.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    fn next_dbid(&mut self) -> Dbid {
        self.last_dbid += 1;
        self.last_dbid
    }
}
