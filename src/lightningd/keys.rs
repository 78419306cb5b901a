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

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use bitcoin::secp256k1::rand::{thread_rng, RngCore};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::channel::hkdf_sha256;
use crate::Error;

/// Keys of the node, all derived from the `hsm_secret`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct NodeKeys {
    pub node_id: PublicKey,
    pub peer_seed: [u8; 32],
}

impl NodeKeys {
    pub fn derive(secret: &[u8; 32]) -> Result<NodeKeys, Error> {
        let node_key = SecretKey::from_slice(&hkdf_sha256(&[], secret, b"nodeid"))
            .map_err(|_| Error::Terminate(s!("node secret does not yield a valid node key")))?;
        Ok(NodeKeys {
            node_id: PublicKey::from_secret_key(&Secp256k1::signing_only(), &node_key),
            peer_seed: hkdf_sha256(&[], secret, b"peer seed"),
        })
    }
}

/// Reads the node secret, creating it on the first start.
pub fn load_or_create_secret(path: &Path) -> Result<[u8; 32], Error> {
    match fs::read(path) {
        Ok(data) => <[u8; 32]>::try_from(data.as_slice()).map_err(|_| {
            Error::Terminate(format!("{} must contain exactly 32 bytes", path.display()))
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let mut secret = [0u8; 32];
            thread_rng().fill_bytes(&mut secret);
            let mut file = OpenOptions::new().write(true).create_new(true).mode(0o400).open(path)?;
            file.write_all(&secret)?;
            file.sync_all()?;
            info!("Created new node secret in {}", path.display());
            Ok(secret)
        }
        Err(err) => Err(err.into()),
    }
}
