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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    missing_docs
)]

//! Main executable for lightningd: lightning node master daemon supervising
//! the gossip, opening, channel and closing workers.

#[macro_use]
extern crate log;

use std::env;

use clap::Parser;
use lightning_master::lightningd;
use lightning_master::opts::Opts;
use lightning_master::{Config, Error, LogStyle};
use log::LevelFilter;

fn main() -> Result<(), Error> {
    println!("lightningd: lightning node master daemon");

    let mut opts = Opts::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", match opts.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        });
    }
    env_logger::init();
    log::set_max_level(LevelFilter::Trace);

    trace!("Command-line arguments: {:?}", &opts);
    opts.process();
    trace!("Processed arguments: {:?}", &opts);

    let config = Config::try_from(opts)?;
    trace!("Daemon configuration: {:?}", &config);
    debug!("Data directory {}", config.data_dir.display());
    debug!("Worker executables in {}", config.daemon_dir.display());

    debug!("Starting runtime ...");
    lightningd::run(config).map_err(|err| {
        error!("{} {}", "lightningd failed:".err(), err.err_details());
        err
    })
}
