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

use std::path::PathBuf;

use clap::ValueHint;

#[cfg(any(target_os = "linux"))]
pub const LIGHTNING_DATA_DIR: &'static str = "~/.lightning_master";
#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
pub const LIGHTNING_DATA_DIR: &'static str = "~/.lightning_master";
#[cfg(target_os = "macos")]
pub const LIGHTNING_DATA_DIR: &str = "~/Library/Application Support/Lightning Master";

pub const LIGHTNING_CONFIG: &str = "{data_dir}/lightningd.toml";

/// Lightning node master daemon.
///
/// Launches and supervises the per-role worker daemons and keeps track of
/// the node channels.
#[derive(Parser, Clone, PartialEq, Eq, Debug)]
#[clap(name = "lightningd", bin_name = "lightningd", author, version)]
pub struct Opts {
    /// Set verbosity level.
    ///
    /// Can be used multiple times to increase verbosity.
    #[clap(short, long, global = true, parse(from_occurrences))]
    pub verbose: u8,

    /// Data directory path.
    ///
    /// Path to the directory that contains the node secret and channel
    /// records.
    #[clap(
        short,
        long,
        global = true,
        default_value = LIGHTNING_DATA_DIR,
        env = "LIGHTNING_DATA_DIR",
        value_hint = ValueHint::DirPath
    )]
    pub data_dir: PathBuf,

    /// Path for the configuration file.
    ///
    /// Defaults to `lightningd.toml` inside the data directory, if it
    /// exists. NB: Command-line options override configuration file values.
    #[clap(short, long, global = true, env = "LIGHTNING_CONFIG", value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Directory containing the worker daemon executables.
    ///
    /// Defaults to the directory of the running executable.
    #[clap(long, env = "LIGHTNING_DAEMON_DIR", value_hint = ValueHint::DirPath)]
    pub daemon_dir: Option<PathBuf>,

    /// Address for the gossip daemon to listen on.
    ///
    /// Either `<ip>:<port>` or a path to a unix socket. Can be given
    /// multiple times.
    #[clap(long = "bind-addr")]
    pub bind: Vec<String>,

    /// Seconds to wait for a worker to exit on shutdown before killing it.
    #[clap(long)]
    pub shutdown_timeout: Option<u64>,

    /// Run workers whose name ends with the given suffix with `--debugger`.
    #[clap(long)]
    pub dev_debug_subdaemon: Option<String>,

    /// File with disconnect instructions passed to every worker.
    #[clap(long, value_hint = ValueHint::FilePath)]
    pub dev_disconnect: Option<PathBuf>,

    /// Treat any worker misbehaviour as fatal for the node.
    #[clap(long)]
    pub dev_subdaemon_fail: bool,

    /// Never reconnect to peers after a transient channel failure.
    #[clap(long)]
    pub dev_no_reconnect: bool,
}

impl Opts {
    /// Expands `~` and `{data_dir}` placeholders in path options.
    pub fn process(&mut self) {
        self.data_dir = PathBuf::from(expand(&self.data_dir.display().to_string()));
        let data_dir = self.data_dir.display().to_string();
        let resolve = |path: &PathBuf| {
            PathBuf::from(expand(&path.display().to_string().replace("{data_dir}", &data_dir)))
        };
        self.config = self.config.as_ref().map(resolve);
        self.daemon_dir = self.daemon_dir.as_ref().map(resolve);
        self.dev_disconnect = self.dev_disconnect.as_ref().map(resolve);
    }

    /// Configuration file to read: the given one, or the default one if it
    /// exists.
    pub fn config_file(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            let path = PathBuf::from(
                LIGHTNING_CONFIG.replace("{data_dir}", &self.data_dir.display().to_string()),
            );
            path.exists().then_some(path)
        })
    }
}

fn expand(path: &str) -> String { shellexpand::tilde(path).to_string() }
