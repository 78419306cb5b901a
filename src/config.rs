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

#![allow(clippy::needless_borrow)] // due to a bug in `display(Debug)`

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use amplify::IoError;
use serde::Deserialize;

#[cfg(feature = "shell")]
use crate::opts::Opts;
use crate::wire::{WireAddr, WireAddrOrSockname};

pub const HSM_SECRET_FILE: &str = "hsm_secret";
pub const CHANNEL_DIR: &str = "channels";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Display, From, Error)]
#[display(doc_comments)]
pub enum ConfigError {
    /// unable to read configuration file `{0}`: {1:?}
    Read(String, IoError),

    /// configuration file `{0}` is invalid: {1}
    Parse(String, String),

    /// `{0}` is neither a socket address nor a unix socket path shorter
    /// than 108 bytes
    BadAddr(String),

    /// unable to determine the daemon directory: {0:?}
    #[from(io::Error)]
    DaemonDir(IoError),
}

/// Developer switches.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct DevConfig {
    pub debug_subdaemon: Option<String>,
    pub disconnect: Option<PathBuf>,
    pub subdaemon_fail: bool,
    pub no_reconnect: bool,
}

/// Final configuration resulting from data contained in config file,
/// environment variables and command-line options.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display(Debug)]
pub struct Config {
    /// Directory for the node secret and channel records
    pub data_dir: PathBuf,

    /// Directory with the worker executables
    pub daemon_dir: PathBuf,

    /// Addresses gossipd listens on
    pub bind: Vec<WireAddrOrSockname>,

    /// Grace period for workers on shutdown
    pub shutdown_timeout: Duration,

    pub dev: DevConfig,
}

/// Values which may be given in the TOML configuration file.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(crate = "serde_crate", rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub daemon_dir: Option<PathBuf>,
    pub bind_addr: Option<Vec<String>>,
    pub shutdown_timeout: Option<u64>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<FileConfig, ConfigError> {
        let name = path.display().to_string();
        let data = fs::read_to_string(path).map_err(|err| ConfigError::Read(name.clone(), err.into()))?;
        toml::from_str(&data).map_err(|err| ConfigError::Parse(name, err.to_string()))
    }
}

impl Config {
    /// Defaults for a node living in `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>, daemon_dir: impl Into<PathBuf>) -> Config {
        Config {
            data_dir: data_dir.into(),
            daemon_dir: daemon_dir.into(),
            bind: vec![],
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            dev: DevConfig::default(),
        }
    }

    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(dir) = file.daemon_dir {
            self.daemon_dir = dir;
        }
        if let Some(addrs) = file.bind_addr {
            self.bind = addrs.iter().map(String::as_str).map(parse_bind).collect::<Result<_, _>>()?;
        }
        if let Some(secs) = file.shutdown_timeout {
            self.shutdown_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    pub fn hsm_secret_file(&self) -> PathBuf { self.data_dir.join(HSM_SECRET_FILE) }

    pub fn channel_dir(&self) -> PathBuf { self.data_dir.join(CHANNEL_DIR) }
}

/// Parses a listening address: a socket address or a unix socket path.
pub fn parse_bind(addr: &str) -> Result<WireAddrOrSockname, ConfigError> {
    if let Ok(sockaddr) = addr.parse::<SocketAddr>() {
        return Ok(WireAddrOrSockname::Wire(WireAddr::Inet(sockaddr)));
    }
    if addr.is_empty() {
        return Err(ConfigError::BadAddr(addr.to_owned()));
    }
    WireAddrOrSockname::sockname(addr).map_err(|_| ConfigError::BadAddr(addr.to_owned()))
}

#[cfg(feature = "shell")]
impl TryFrom<Opts> for Config {
    type Error = ConfigError;

    fn try_from(opts: Opts) -> Result<Self, Self::Error> {
        let daemon_dir = match &opts.daemon_dir {
            Some(dir) => dir.clone(),
            None => {
                let exe = std::env::current_exe()?;
                exe.parent().map(Path::to_path_buf).unwrap_or_default()
            }
        };
        let mut config = Config::with_data_dir(&opts.data_dir, daemon_dir);

        if let Some(path) = opts.config_file() {
            debug!("Reading configuration from {}", path.display());
            config.apply_file(FileConfig::read(&path)?)?;
            // the command line still wins
            if let Some(dir) = &opts.daemon_dir {
                config.daemon_dir = dir.clone();
            }
        }
        if !opts.bind.is_empty() {
            config.bind = opts.bind.iter().map(String::as_str).map(parse_bind).collect::<Result<_, _>>()?;
        }
        if let Some(secs) = opts.shutdown_timeout {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        config.dev = DevConfig {
            debug_subdaemon: opts.dev_debug_subdaemon,
            disconnect: opts.dev_disconnect,
            subdaemon_fail: opts.dev_subdaemon_fail,
            no_reconnect: opts.dev_no_reconnect,
        };
        Ok(config)
    }
}
