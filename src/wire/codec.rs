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

//! Big-endian payload encoding used by all master <-> worker messages.

use bitcoin::secp256k1::PublicKey;

/// Errors decoding a message or its payload. Any of them makes the message
/// malformed and closes the connection it arrived on.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum WireError {
    /// message body of {0} bytes is too short to carry a message type
    NoType(usize),

    /// message body of {0} bytes exceeds the frame size limit
    Oversized(usize),

    /// connection closed in the middle of a message frame
    Truncated,

    /// payload ended before field `{0}` was read
    UnexpectedEnd(&'static str),

    /// {0} unparsed bytes left after the payload
    TrailingData(usize),

    /// status string contains non-printable byte {0:#04x}
    NonPrintable(u8),

    /// unknown failure status code {0:#06x}
    UnknownStatus(u16),

    /// unix socket name is not NUL-terminated
    UnterminatedSockname,

    /// unix socket name of {0} bytes does not fit a socket address
    BadSockname(usize),

    /// unknown wire address type {0}
    UnknownAddrType(u8),

    /// invalid public key encoding
    InvalidPubkey,

    /// message type {0} was not expected here
    UnexpectedType(u16),
}

/// Types which can be written into a message payload.
pub trait WireEncode {
    fn wire_encode(&self, out: &mut Vec<u8>);
}

/// Types which can be read back from a message payload.
pub trait WireDecode: Sized {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError>;
}

/// Cursor over a payload which never reads past its end.
pub struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self { WireReader { data } }

    pub fn remaining(&self) -> usize { self.data.len() }

    pub fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        if self.data.len() < len {
            return Err(WireError::UnexpectedEnd(field));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    pub fn take_array<const LEN: usize>(
        &mut self,
        field: &'static str,
    ) -> Result<[u8; LEN], WireError> {
        let mut buf = [0u8; LEN];
        buf.copy_from_slice(self.take(LEN, field)?);
        Ok(buf)
    }

    /// Takes everything which is left.
    pub fn rest(&mut self) -> &'a [u8] { std::mem::take(&mut self.data) }

    /// Fails if anything is left unread.
    pub fn finish(self) -> Result<(), WireError> {
        match self.data.len() {
            0 => Ok(()),
            len => Err(WireError::TrailingData(len)),
        }
    }
}

/// Decodes the whole payload as a single value, rejecting trailing bytes.
pub fn decode_payload<T: WireDecode>(payload: &[u8]) -> Result<T, WireError> {
    let mut reader = WireReader::new(payload);
    let value = T::wire_decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

pub fn encode_payload<T: WireEncode>(value: &T) -> Vec<u8> {
    let mut out = vec![];
    value.wire_encode(&mut out);
    out
}

macro_rules! impl_wire_int {
    ($ty:ty, $name:literal) => {
        impl WireEncode for $ty {
            fn wire_encode(&self, out: &mut Vec<u8>) { out.extend_from_slice(&self.to_be_bytes()) }
        }

        impl WireDecode for $ty {
            fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
                Ok(<$ty>::from_be_bytes(reader.take_array($name)?))
            }
        }
    };
}

impl_wire_int!(u8, "u8");
impl_wire_int!(u16, "u16");
impl_wire_int!(u32, "u32");
impl_wire_int!(u64, "u64");

impl WireEncode for bool {
    fn wire_encode(&self, out: &mut Vec<u8>) { out.push(*self as u8) }
}

impl WireDecode for bool {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        Ok(u8::wire_decode(reader)? != 0)
    }
}

impl WireEncode for [u8; 32] {
    fn wire_encode(&self, out: &mut Vec<u8>) { out.extend_from_slice(self) }
}

impl WireDecode for [u8; 32] {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        reader.take_array("bytes32")
    }
}

impl WireEncode for PublicKey {
    fn wire_encode(&self, out: &mut Vec<u8>) { out.extend_from_slice(&self.serialize()) }
}

impl WireDecode for PublicKey {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        let data = reader.take(33, "pubkey")?;
        PublicKey::from_slice(data).map_err(|_| WireError::InvalidPubkey)
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    /// # Panics
    ///
    /// If the vector has more items than a `u16` count can express.
    fn wire_encode(&self, out: &mut Vec<u8>) {
        let count = u16::try_from(self.len())
            .unwrap_or_else(|_| panic!("{} items do not fit a message field", self.len()));
        count.wire_encode(out);
        for item in self {
            item.wire_encode(out);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        let count = u16::wire_decode(reader)?;
        (0..count).map(|_| T::wire_decode(reader)).collect()
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn wire_encode(&self, out: &mut Vec<u8>) {
        match self {
            Some(value) => {
                true.wire_encode(out);
                value.wire_encode(out);
            }
            None => false.wire_encode(out),
        }
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn wire_decode(reader: &mut WireReader) -> Result<Self, WireError> {
        match bool::wire_decode(reader)? {
            true => T::wire_decode(reader).map(Some),
            false => Ok(None),
        }
    }
}
