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

use std::fmt::Display;

use colored::{ColoredString, Colorize};

/// Highlighting of log message fragments.
pub trait LogStyle: Display {
    fn promo(&self) -> ColoredString { self.to_string().bold().bright_blue() }

    fn promoter(&self) -> ColoredString { self.to_string().italic().bright_blue() }

    fn action(&self) -> ColoredString { self.to_string().bold().yellow() }

    fn progress(&self) -> ColoredString { self.to_string().bold().green() }

    fn ended(&self) -> ColoredString { self.to_string().bold().bright_green() }

    fn ender(&self) -> ColoredString { self.to_string().italic().bright_green() }

    fn amount(&self) -> ColoredString { self.to_string().bold().bright_white() }

    fn addr(&self) -> ColoredString { self.to_string().bold().bright_yellow() }

    fn err(&self) -> ColoredString { self.to_string().bold().bright_red() }

    fn err_details(&self) -> ColoredString { self.to_string().bold().red() }
}

impl<T> LogStyle for T where T: Display {}
