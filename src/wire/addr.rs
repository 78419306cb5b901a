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

use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{WireDecode, WireEncode, WireError, WireReader};

/// Size of `sun_path` in `struct sockaddr_un`.
pub const SOCKNAME_LEN: usize = 108;

const ADDR_TYPE_PADDING: u8 = 0;
const ADDR_TYPE_IPV4: u8 = 1;
const ADDR_TYPE_IPV6: u8 = 2;

/// Network address as carried inside worker messages.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WireAddr {
    Padding,
    Inet(SocketAddr),
}

/// Either a network address or a local unix socket name.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WireAddrOrSockname {
    Wire(WireAddr),
    Sockname(String),
}

impl WireAddrOrSockname {
    /// Local socket name; it must leave room for the NUL terminator.
    pub fn sockname(name: impl Into<String>) -> Result<Self, WireError> {
        let name = name.into();
        if !sockname_fits(&name) {
            return Err(WireError::BadSockname(name.len()));
        }
        Ok(WireAddrOrSockname::Sockname(name))
    }
}

fn sockname_fits(name: &str) -> bool { name.len() < SOCKNAME_LEN && !name.contains('\0') }

impl Display for WireAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WireAddr::Padding => f.write_str("<padding>"),
            WireAddr::Inet(addr) => Display::fmt(addr, f),
        }
    }
}

impl Display for WireAddrOrSockname {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WireAddrOrSockname::Wire(addr) => Display::fmt(addr, f),
            WireAddrOrSockname::Sockname(name) => f.write_str(name),
        }
    }
}

impl WireEncode for WireAddr {
    fn wire_encode(&self, out: &mut Vec<u8>) {
        match self {
            WireAddr::Padding => ADDR_TYPE_PADDING.wire_encode(out),
            WireAddr::Inet(SocketAddr::V4(addr)) => {
                ADDR_TYPE_IPV4.wire_encode(out);
                out.extend_from_slice(&addr.ip().octets());
                addr.port().wire_encode(out);
            }
            WireAddr::Inet(SocketAddr::V6(addr)) => {
                ADDR_TYPE_IPV6.wire_encode(out);
                out.extend_from_slice(&addr.ip().octets());
                addr.port().wire_encode(out);
            }
        }
    }
}

impl WireDecode for WireAddr {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        let ip = match u8::wire_decode(reader)? {
            ADDR_TYPE_PADDING => return Ok(WireAddr::Padding),
            ADDR_TYPE_IPV4 => Ipv4Addr::from(reader.take_array::<4>("ipv4")?).into(),
            ADDR_TYPE_IPV6 => Ipv6Addr::from(reader.take_array::<16>("ipv6")?).into(),
            unknown => return Err(WireError::UnknownAddrType(unknown)),
        };
        let port = u16::wire_decode(reader)?;
        Ok(WireAddr::Inet(SocketAddr::new(ip, port)))
    }
}

impl WireEncode for WireAddrOrSockname {
    fn wire_encode(&self, out: &mut Vec<u8>) {
        match self {
            WireAddrOrSockname::Wire(addr) => {
                false.wire_encode(out);
                addr.wire_encode(out);
            }
            WireAddrOrSockname::Sockname(name) => {
                assert!(
                    sockname_fits(name),
                    "socket name of {} bytes does not fit sun_path",
                    name.len()
                );
                true.wire_encode(out);
                let mut buf = [0u8; SOCKNAME_LEN];
                buf[..name.len()].copy_from_slice(name.as_bytes());
                out.extend_from_slice(&buf);
            }
        }
    }
}

impl WireDecode for WireAddrOrSockname {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        if !bool::wire_decode(reader)? {
            return WireAddr::wire_decode(reader).map(WireAddrOrSockname::Wire);
        }
        let buf = reader.take(SOCKNAME_LEN, "sockname")?;
        let end = buf.iter().position(|b| *b == 0).ok_or(WireError::UnterminatedSockname)?;
        Ok(WireAddrOrSockname::Sockname(String::from_utf8_lossy(&buf[..end]).into_owned()))
    }
}
