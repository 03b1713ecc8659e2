//! SSH wire format reading/writing.
//!
//! The traits here are what `sunset_sshwire_derive` implements for the
//! [`packets`](crate::packets) definitions. Encoding goes through a
//! `&mut dyn SSHSink`, decoding borrows from the input buffer.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use ascii::{AsAsciiStr, AsciiChar, AsciiStr};
use pretty_hex::PrettyHex;

use crate::*;
use packets::{Packet, ParseContext};

/// Destination for encoded bytes
pub trait SSHSink {
    fn push(&mut self, v: &[u8]) -> WireResult<()>;
}

/// Input being decoded. Returned slices borrow from the input.
pub trait SSHSource<'de> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]>;
    fn pos(&self) -> usize;
    fn ctx(&mut self) -> &mut ParseContext;
}

pub trait SSHEncode {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()>;
}

/// Enums whose variant name is encoded by the parent struct
pub trait SSHEncodeEnum {
    /// Fails for an `Unknown` variant, those are only ever received.
    fn variant_name(&self) -> WireResult<&'static str>;
}

pub trait SSHDecode<'de>: Sized {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>;
}

/// Enums decoded with a variant name read earlier by the parent struct
pub trait SSHDecodeEnum<'de>: Sized {
    fn dec_enum<S>(s: &mut S, var: &'de [u8]) -> WireResult<Self>
    where
        S: SSHSource<'de>;
}

/// Errors from [`SSHEncode`] and [`SSHDecode`], converted to [`Error`]
/// at the API boundary.
#[derive(Debug)]
pub enum WireError {
    NoRoom,
    RanOut,
    BadString,
    BadName,
    UnknownVariant,
    PacketWrong,
    SSHProtoError,
    UnknownPacket { number: u8 },
}

pub type WireResult<T> = core::result::Result<T, WireError>;

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w {
            WireError::NoRoom => Error::NoRoom,
            WireError::RanOut => Error::RanOut,
            WireError::BadString => Error::BadString,
            WireError::BadName => Error::BadName,
            WireError::SSHProtoError => Error::SSHProtoError,
            WireError::PacketWrong => Error::PacketWrong,
            WireError::UnknownVariant => Error::bug_err_msg("Can't encode Unknown"),
            WireError::UnknownPacket { number } => Error::UnknownPacket { number },
        }
    }
}

/// Parses a channel [`Packet`] from a complete payload.
///
/// Trailing bytes are an error unless an unknown channel type or request
/// was seen, in which case the rest of the payload was left unparsed.
pub fn packet_from_bytes<'a>(b: &'a [u8], ctx: &ParseContext) -> Result<Packet<'a>> {
    let mut ctx = ctx.clone();
    ctx.seen_unknown = false;
    let mut r = Reader::new(b, ctx);
    let p = Packet::dec(&mut r)?;
    if r.remaining() > 0 && !r.ctx.seen_unknown {
        return Err(Error::WrongPacketLength);
    }
    Ok(p)
}

/// Encodes `value` into a new buffer.
pub fn write_ssh_vec(value: &dyn SSHEncode) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    value.enc(&mut v)?;
    Ok(v)
}

impl SSHSink for Vec<u8> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.extend_from_slice(v);
        Ok(())
    }
}

struct Reader<'de> {
    input: &'de [u8],
    pos: usize,
    ctx: ParseContext,
}

impl<'de> Reader<'de> {
    fn new(input: &'de [u8], ctx: ParseContext) -> Self {
        Self { input, pos: 0, ctx }
    }

    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }
}

impl<'de> SSHSource<'de> for Reader<'de> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]> {
        let end = self.pos.checked_add(len).ok_or(WireError::RanOut)?;
        let t = self.input.get(self.pos..end).ok_or(WireError::RanOut)?;
        self.pos = end;
        Ok(t)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn ctx(&mut self) -> &mut ParseContext {
        &mut self.ctx
    }
}

/// Writes a `u32` length prefix then the bytes.
fn enc_string(v: &[u8], s: &mut dyn SSHSink) -> WireResult<()> {
    let len = u32::try_from(v.len()).map_err(|_| WireError::NoRoom)?;
    len.enc(s)?;
    s.push(v)
}

fn dec_string<'de, S: SSHSource<'de>>(s: &mut S) -> WireResult<&'de [u8]> {
    let len = u32::dec(s)?;
    s.take(len as usize)
}

/// A SSH `string` of arbitrary binary data.
#[derive(Clone, PartialEq)]
pub struct BinString<'a>(pub &'a [u8]);

impl<'a> AsRef<[u8]> for BinString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl fmt::Debug for BinString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinString(len={})", self.0.len())
    }
}

impl SSHEncode for BinString<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        enc_string(self.0, s)
    }
}

impl<'de> SSHDecode<'de> for BinString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        dec_string(s).map(BinString)
    }
}

/// A SSH `string` holding text, such as a command, hostname or socket
/// path.
///
/// The protocol says UTF-8 but peers don't always comply, so the bytes
/// are kept as received. Protocol identifiers in [`packets`] are `&str`
/// instead, and always ASCII.
#[derive(Clone, Copy, PartialEq)]
pub struct TextString<'a>(pub &'a [u8]);

impl<'a> TextString<'a> {
    pub fn as_str(&self) -> Result<&'a str> {
        Ok(core::str::from_utf8(self.0)?)
    }

    pub fn as_ascii(&self) -> Result<&'a str> {
        self.0.as_ascii_str().map_err(|_| Error::BadString).map(|s| s.as_str())
    }

    /// An owned copy, invalid UTF-8 replaced.
    pub fn to_lossy(&self) -> String {
        String::from_utf8_lossy(self.0).into_owned()
    }
}

impl<'a> AsRef<[u8]> for TextString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl<'a> From<&'a str> for TextString<'a> {
    fn from(s: &'a str) -> Self {
        TextString(s.as_bytes())
    }
}

impl fmt::Debug for TextString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.0) {
            Ok(s) => write!(f, "TextString(\"{}\")", s.escape_default()),
            Err(_) => write!(f, "TextString(not utf8!, {:#?})", self.0.hex_dump()),
        }
    }
}

impl SSHEncode for TextString<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        enc_string(self.0, s)
    }
}

impl<'de> SSHDecode<'de> for TextString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        dec_string(s).map(TextString)
    }
}

impl SSHEncode for u8 {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        s.push(&[*self])
    }
}

impl SSHEncode for bool {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        u8::from(*self).enc(s)
    }
}

impl SSHEncode for u32 {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        s.push(&self.to_be_bytes())
    }
}

// A name, length prefixed
impl SSHEncode for &str {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        enc_string(self.as_bytes(), s)
    }
}

impl<'de> SSHDecode<'de> for u8 {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(s.take(1)?[0])
    }
}

impl<'de> SSHDecode<'de> for bool {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(u8::dec(s)? != 0)
    }
}

impl<'de> SSHDecode<'de> for u32 {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let b: [u8; 4] = s.take(4)?.try_into().map_err(|_| WireError::RanOut)?;
        Ok(u32::from_be_bytes(b))
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for &'a str {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        try_as_ascii_str(dec_string(s)?)
    }
}

/// Checks a SSH name: ASCII without control characters, RFC4251 section 6.
pub fn try_as_ascii(t: &[u8]) -> WireResult<&AsciiStr> {
    let n = t.as_ascii_str().map_err(|_| WireError::BadName)?;
    if n.chars().any(|ch| ch.is_ascii_control() || ch == AsciiChar::DEL) {
        return Err(WireError::BadName);
    }
    Ok(n)
}

pub fn try_as_ascii_str(t: &[u8]) -> WireResult<&str> {
    try_as_ascii(t).map(AsciiStr::as_str)
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::*;
    use error::Error;
    use log::trace;
    use muxlog::init_test_log;
    use packets::*;
    use pretty_hex::PrettyHex;
    use sshwire::*;

    /// Checks that two items serialize the same
    pub fn assert_serialize_equal(p1: &dyn SSHEncode, p2: &dyn SSHEncode) {
        assert_eq!(write_ssh_vec(p1).unwrap(), write_ssh_vec(p2).unwrap());
    }

    pub fn test_roundtrip(p: &Packet) {
        let buf = write_ssh_vec(p).unwrap();
        trace!("wrote packet {:?}", buf.hex_dump());

        let p2 = packet_from_bytes(&buf, &ParseContext::default()).unwrap();
        trace!("returned packet {:#?}", p2);
        assert_serialize_equal(p, &p2);
    }

    #[test]
    fn data_layout() {
        init_test_log();
        let p: Packet = ChannelData { num: 3, data: BinString(b"hello") }.into();
        let v = write_ssh_vec(&p).unwrap();
        // type byte, recipient, length prefix, data
        assert_eq!(v.len(), 1 + 4 + 4 + 5);
        assert_eq!(v[0], 94);
        assert_eq!(&v[1..5], &3u32.to_be_bytes());
        assert_eq!(&v[ChannelData::DATA_OFFSET..], b"hello");
    }

    #[test]
    fn trailing_bytes_rejected() {
        init_test_log();
        let p: Packet = ChannelEof { num: 7 }.into();
        let mut v = write_ssh_vec(&p).unwrap();
        v.push(0);
        let r = packet_from_bytes(&v, &ParseContext::default());
        assert!(matches!(r, Err(Error::WrongPacketLength)));
    }

    #[test]
    fn truncated_packet() {
        init_test_log();
        let p: Packet = ChannelWindowAdjust { num: 7, adjust: 1000 }.into();
        let v = write_ssh_vec(&p).unwrap();
        let r = packet_from_bytes(&v[..v.len() - 1], &ParseContext::default());
        assert!(matches!(r, Err(Error::RanOut)));
    }

    #[test]
    fn oversized_string_length() {
        init_test_log();
        // data length claims more than the payload holds
        let mut v = vec![94];
        v.extend_from_slice(&1u32.to_be_bytes());
        v.extend_from_slice(&u32::MAX.to_be_bytes());
        v.extend_from_slice(b"abc");
        let r = packet_from_bytes(&v, &ParseContext::default());
        assert!(matches!(r, Err(Error::RanOut)));
    }

    #[test]
    fn control_chars_in_names() {
        assert!(try_as_ascii_str(b"exec").is_ok());
        assert!(try_as_ascii_str(b"ex\x07ec").is_err());
        assert!(try_as_ascii_str("écho".as_bytes()).is_err());
    }
}
