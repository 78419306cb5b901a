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

#[macro_use]
extern crate clap;

use std::fs;

use clap::IntoApp;
use clap_complete::generate_to;
use clap_complete::shells::*;

pub mod opts {
    include!("src/opts.rs");
}

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=src/opts.rs");
    let outdir = "./shell";
    fs::create_dir_all(outdir)?;

    let mut app = opts::Opts::into_app();
    let name = app.get_name().to_string();
    generate_to(Bash, &mut app, &name, &outdir)?;
    generate_to(PowerShell, &mut app, &name, &outdir)?;
    generate_to(Zsh, &mut app, &name, &outdir)?;

    Ok(())
}
