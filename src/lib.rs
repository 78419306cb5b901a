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
    // unused_imports,
    // dead_code
    // missing_docs,
)]

//! Master daemon of a lightning node: launches the per-role worker
//! processes, talks to them over framed unix sockets and drives the channel
//! lifecycle from what they report.

#[macro_use]
extern crate amplify;
#[cfg(feature = "shell")]
#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate serde_crate as serde;

pub mod channel;
pub mod config;
mod error;
pub mod launcher;
pub mod lifeline;
pub mod lightningd;
#[cfg(feature = "shell")]
pub mod opts;
pub mod queue;
pub mod request;
pub mod rpc;
mod service;
pub mod store;
pub mod subd;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use error::Error;
pub use service::LogStyle;
