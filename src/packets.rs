//! SSH connection protocol channel packets.
//!
//! A [`Packet`] can be encoded/decoded to the SSH wire format using [`sshwire`].
//! Channel messages are described in [RFC4254](https://tools.ietf.org/html/rfc4254)
//! SSH Connection Protocol, the `@openssh.com` ones in OpenSSH's PROTOCOL file.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use sunset_sshwire_derive::*;

use crate::*;
use sshwire::{BinString, TextString};
use sshwire::{SSHEncode, SSHDecode, SSHSource, SSHSink, WireResult, WireError};
use sshwire::{SSHEncodeEnum, SSHDecodeEnum};

// Any `enum` needs to have special handling to select a variant when deserializing.
// This is done with `#[sshwire(...)]` attributes.

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ChannelOpen<'a> {
    // channel_type is implicit in ty below
    #[sshwire(variant_name = ty)]
    pub num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub ty: ChannelOpenType<'a>,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub enum ChannelOpenType<'a> {
    #[sshwire(variant = "session")]
    Session,
    #[sshwire(variant = "forwarded-tcpip")]
    ForwardedTcpip(ForwardedTcpip<'a>),
    #[sshwire(variant = "direct-tcpip")]
    DirectTcpip(DirectTcpip<'a>),
    #[sshwire(variant = "direct-streamlocal@openssh.com")]
    DirectStreamLocal(DirectStreamLocal<'a>),
    #[sshwire(variant = "forwarded-streamlocal@openssh.com")]
    ForwardedStreamLocal(ForwardedStreamLocal<'a>),
    #[sshwire(variant = "x11")]
    X11(X11<'a>),
    // auth-agent@openssh.com isn't handled
    #[sshwire(unknown)]
    Unknown(Unknown<'a>),
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelOpenConfirmation {
    pub num: u32,
    pub sender_num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelOpenFailure<'a> {
    pub num: u32,
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: &'a str,
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelWindowAdjust {
    pub num: u32,
    pub adjust: u32,
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelData<'a> {
    pub num: u32,
    pub data: BinString<'a>,
}

impl ChannelData<'_> {
    // offset into a packet payload, includes packet type byte
    pub const DATA_OFFSET: usize = 9;
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelDataExt<'a> {
    pub num: u32,
    pub code: u32,
    pub data: BinString<'a>,
}

impl ChannelDataExt<'_> {
    // offset into a packet payload, includes packet type byte
    pub const DATA_OFFSET: usize = 13;
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelEof {
    pub num: u32,
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelClose {
    pub num: u32,
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelSuccess {
    pub num: u32,
}

#[derive(Debug,SSHEncode, SSHDecode)]
pub struct ChannelFailure {
    pub num: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ChannelRequest<'a> {
    pub num: u32,

    // request name is implicit in req below
    #[sshwire(variant_name = req)]

    pub want_reply: bool,
    pub req: ChannelReqType<'a>,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub enum ChannelReqType<'a> {
    #[sshwire(variant = "shell")]
    Shell,
    #[sshwire(variant = "exec")]
    Exec(Exec<'a>),
    #[sshwire(variant = "pty-req")]
    Pty(PtyReq<'a>),
    #[sshwire(variant = "x11-req")]
    X11Req(X11Req<'a>),
    #[sshwire(variant = "env")]
    Env(Env<'a>),
    #[sshwire(variant = "subsystem")]
    Subsystem(Subsystem<'a>),
    #[sshwire(variant = "window-change")]
    WinChange(WinChange),
    #[sshwire(variant = "xon-xoff")]
    XonXoff(XonXoff),
    #[sshwire(variant = "signal")]
    Signal(Signal<'a>),
    #[sshwire(variant = "exit-status")]
    ExitStatus(ExitStatus),
    #[sshwire(variant = "exit-signal")]
    ExitSignal(ExitSignal<'a>),
    #[sshwire(variant = "break")]
    Break(Break),
    #[sshwire(variant = "eow@openssh.com")]
    Eow,
    #[sshwire(variant = "keepalive@openssh.com")]
    KeepAlive,
    // auth-agent-req@openssh.com is not implemented
    #[sshwire(unknown)]
    Unknown(Unknown<'a>),
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Exec<'a> {
    pub command: TextString<'a>,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Subsystem<'a> {
    pub subsystem: TextString<'a>,
}

/// The contents of a `"pty-req"` request.
#[derive(Debug, SSHEncode, SSHDecode)]
pub struct PtyReq<'a> {
    pub term: TextString<'a>,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: BinString<'a>,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct X11Req<'a> {
    pub single_connection: bool,
    pub protocol: &'a str,
    pub cookie: TextString<'a>,
    pub screen: u32,
}

/// An environment variable
#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Env<'a> {
    pub name: TextString<'a>,
    pub value: TextString<'a>,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct WinChange {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct XonXoff {
    pub client_can_do: bool,
}

/// A unix signal channel request
#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Signal<'a> {
    pub sig: &'a str,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ExitStatus {
    pub status: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ExitSignal<'a> {
    pub signal: &'a str,
    pub core: bool,
    pub error: TextString<'a>,
    pub lang: &'a str,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct Break {
    pub length: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ForwardedTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct DirectTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct DirectStreamLocal<'a> {
    pub socket_path: TextString<'a>,
    pub reserved: &'a str,
    pub reserved_port: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ForwardedStreamLocal<'a> {
    pub socket_path: TextString<'a>,
    pub reserved: TextString<'a>,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct X11<'a> {
    pub origin: TextString<'a>,
    pub origin_port: u32,
}

// Placeholder for unknown channel types or request names. These are non-fatal
// and need to be handled by the relevant code.
// This is deliberately not Serializable, we only receive it.
#[derive(Clone, PartialEq)]
pub struct Unknown<'a>(pub &'a [u8]);

impl<'a> Unknown<'a> {
    pub fn new(name: &'a [u8]) -> Self {
        Unknown(name)
    }
}

impl core::fmt::Display for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = sshwire::try_as_ascii_str(self.0) {
            f.write_str(s)
        } else {
            write!(f, "non-ascii {:?}", self.0.hex_dump())
        }
    }
}

impl core::fmt::Debug for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// State to be passed to decoding.
#[derive(Default, Clone, Debug)]
pub struct ParseContext {
    // Set to true if an unknown variant is encountered.
    // Packet length checks should be omitted in that case.
    pub(crate) seen_unknown: bool,
}

impl ParseContext {
    pub fn new() -> Self {
        ParseContext { seen_unknown: false }
    }
}

/// We have repeated `match` statements for the various packet types, use a macro
macro_rules! messagetypes {
    (
        $( ( $message_num:literal,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_MESSAGE_NAME:ident
            ),
             )*
    ) => {


#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum MessageNumber {
    // variants are eg
    // SSH_MSG_CHANNEL_OPEN = 90,
    $(
    $SSH_MESSAGE_NAME = $message_num,
    )*
}

impl TryFrom<u8> for MessageNumber {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            // eg
            // 90 = Ok(MessageNumber::SSH_MSG_CHANNEL_OPEN)
            $(
            $message_num => Ok(MessageNumber::$SSH_MESSAGE_NAME),
            )*
            _ => {
                Err(Error::UnknownPacket { number: v })
            }
        }
    }
}

impl SSHEncode for Packet<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        let t = self.message_num() as u8;
        t.enc(s)?;
        match self {
            // eg
            // Packet::ChannelOpen(p) => {
            // ...
            $(
            Packet::$SpecificPacketVariant(p) => {
                p.enc(s)?
            }
            )*
        };
        Ok(())
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for Packet<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let msg_num = u8::dec(s)?;
        let ty = MessageNumber::try_from(msg_num);
        let ty = match ty {
            Ok(t) => t,
            Err(_) => return Err(WireError::UnknownPacket { number: msg_num })
        };

        // Decode based on the message number
        let p = match ty {
            $(
            MessageNumber::$SSH_MESSAGE_NAME => Packet::$SpecificPacketVariant(SSHDecode::dec(s)?),
            )*
        };
        Ok(p)
    }
}

/// Top level channel packet enum
#[derive(Debug)]
pub enum Packet<'a> {
    // eg ChannelOpen(ChannelOpen<'a>),
    $(
    $SpecificPacketVariant($SpecificPacketType),
    )*
}

impl<'a> Packet<'a> {
    pub fn message_num(&self) -> MessageNumber {
        match self {
            $(
            Packet::$SpecificPacketVariant(_) => {
                MessageNumber::$SSH_MESSAGE_NAME
            }
            )*
        }
    }
}

$(
impl<'a> From<$SpecificPacketType> for Packet<'a> {
    fn from(s: $SpecificPacketType) -> Packet<'a> {
        Packet::$SpecificPacketVariant(s)
    }
}
)*

} } // macro

messagetypes![
(90, ChannelOpen, ChannelOpen<'a>, SSH_MSG_CHANNEL_OPEN),
(91, ChannelOpenConfirmation, ChannelOpenConfirmation, SSH_MSG_CHANNEL_OPEN_CONFIRMATION),
(92, ChannelOpenFailure, ChannelOpenFailure<'a>, SSH_MSG_CHANNEL_OPEN_FAILURE),
(93, ChannelWindowAdjust, ChannelWindowAdjust, SSH_MSG_CHANNEL_WINDOW_ADJUST),
(94, ChannelData, ChannelData<'a>, SSH_MSG_CHANNEL_DATA),
(95, ChannelDataExt, ChannelDataExt<'a>, SSH_MSG_CHANNEL_EXTENDED_DATA),
(96, ChannelEof, ChannelEof, SSH_MSG_CHANNEL_EOF),
(97, ChannelClose, ChannelClose, SSH_MSG_CHANNEL_CLOSE),
(98, ChannelRequest, ChannelRequest<'a>, SSH_MSG_CHANNEL_REQUEST),
(99, ChannelSuccess, ChannelSuccess, SSH_MSG_CHANNEL_SUCCESS),
(100, ChannelFailure, ChannelFailure, SSH_MSG_CHANNEL_FAILURE),
];

impl Packet<'_> {
    /// The local channel number a received packet is addressed to.
    ///
    /// `None` for `SSH_MSG_CHANNEL_OPEN`, which carries the sender's number.
    pub fn recipient(&self) -> Option<u32> {
        let n = match self {
            Packet::ChannelOpen(_) => return None,
            Packet::ChannelOpenConfirmation(p) => p.num,
            Packet::ChannelOpenFailure(p) => p.num,
            Packet::ChannelWindowAdjust(p) => p.num,
            Packet::ChannelData(p) => p.num,
            Packet::ChannelDataExt(p) => p.num,
            Packet::ChannelEof(p) => p.num,
            Packet::ChannelClose(p) => p.num,
            Packet::ChannelRequest(p) => p.num,
            Packet::ChannelSuccess(p) => p.num,
            Packet::ChannelFailure(p) => p.num,
        };
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use crate::muxlog::init_test_log;
    use crate::packets::*;
    use crate::sshwire::tests::test_roundtrip;
    use crate::sshwire::{packet_from_bytes, write_ssh_vec};
    use crate::{packets, sshwire};
    use pretty_hex::PrettyHex;

    #[test]
    /// check round trip of packet enums is right
    fn packet_type() {
        for i in 0..=255 {
            let ty = packets::MessageNumber::try_from(i);
            if let Ok(ty) = ty {
                assert_eq!(i, ty as u8);
            }
        }
        assert!(packets::MessageNumber::try_from(20).is_err());
    }

    #[test]
    fn roundtrip_channel_open() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 111,
            initial_window: 50000,
            max_packet: 20000,
            ty: ChannelOpenType::DirectTcpip(DirectTcpip {
                address: "localhost".into(),
                port: 4444,
                origin: "somewhere".into(),
                origin_port: 0,
            }),
        });
        test_roundtrip(&p);

        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 899,
            max_packet: 14,
            ty: ChannelOpenType::Session,
        });
        test_roundtrip(&p);

        let p = Packet::ChannelOpen(ChannelOpen {
            num: 3,
            initial_window: 1 << 20,
            max_packet: 32768,
            ty: ChannelOpenType::DirectStreamLocal(DirectStreamLocal {
                socket_path: "/run/app.sock".into(),
                reserved: "",
                reserved_port: 0,
            }),
        });
        test_roundtrip(&p);
    }

    #[test]
    fn streamlocal_wire_name() {
        init_test_log();
        let p: Packet = ChannelOpen {
            num: 9,
            initial_window: 100,
            max_packet: 100,
            ty: ChannelOpenType::ForwardedStreamLocal(ForwardedStreamLocal {
                socket_path: "/tmp/s".into(),
                reserved: "".into(),
            }),
        }.into();
        let v = write_ssh_vec(&p).unwrap();
        let name = b"forwarded-streamlocal@openssh.com";
        assert_eq!(&v[1..5], &(name.len() as u32).to_be_bytes());
        assert_eq!(&v[5..5+name.len()], name);
    }

    #[test]
    fn roundtrip_requests() {
        init_test_log();
        let reqs = [
            ChannelReqType::Shell,
            ChannelReqType::Exec(Exec { command: "uname -a".into() }),
            ChannelReqType::Env(Env { name: "LANG".into(), value: "C".into() }),
            ChannelReqType::XonXoff(XonXoff { client_can_do: true }),
            ChannelReqType::Break(Break { length: 500 }),
            ChannelReqType::Eow,
            ChannelReqType::KeepAlive,
            ChannelReqType::ExitSignal(ExitSignal {
                signal: "TERM",
                core: false,
                error: "".into(),
                lang: "",
            }),
        ];
        for req in reqs {
            let p: Packet = ChannelRequest { num: 2, want_reply: true, req }.into();
            test_roundtrip(&p);
        }
    }

    #[test]
    fn unknown_method() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 899,
            max_packet: 14,
            ty: ChannelOpenType::Session,
        });
        let mut buf1 = write_ssh_vec(&p).unwrap();
        // change a byte
        buf1[8] = 'X' as u8;
        trace!("broken: {:?}", buf1.hex_dump());
        let ctx = ParseContext::default();
        let p2 = packet_from_bytes(&buf1, &ctx).unwrap();
        trace!("broken: {p2:#?}");
        assert!(matches!(p2,
            Packet::ChannelOpen(ChannelOpen { ty: ChannelOpenType::Unknown(_), ..})
        ));
        assert_eq!(p2.recipient(), None);
    }

    #[test]
    fn unknown_request_skips_payload() {
        init_test_log();
        // "auth-agent-req@openssh.com" with want_reply, then trailing payload
        let mut v = vec![98];
        v.extend_from_slice(&5u32.to_be_bytes());
        let name = b"auth-agent-req@openssh.com";
        v.extend_from_slice(&(name.len() as u32).to_be_bytes());
        v.extend_from_slice(name);
        v.push(1);
        v.extend_from_slice(b"extra");
        let p = packet_from_bytes(&v, &ParseContext::default()).unwrap();
        match p {
            Packet::ChannelRequest(ChannelRequest {
                num: 5,
                want_reply: true,
                req: ChannelReqType::Unknown(u),
            }) => assert_eq!(u.to_string(), "auth-agent-req@openssh.com"),
            p => panic!("wrong packet {p:?}"),
        }
    }

    #[test]
    fn recipients() {
        let p: Packet = ChannelClose { num: 44 }.into();
        assert_eq!(p.recipient(), Some(44));
        let p: Packet = ChannelOpenConfirmation {
            num: 1,
            sender_num: 2,
            initial_window: 0,
            max_packet: 0,
        }.into();
        assert_eq!(p.recipient(), Some(1));
    }

    #[test]
    #[should_panic]
    fn unknown_method_ser() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 200000,
            max_packet: 88200,
            ty: ChannelOpenType::Unknown(Unknown(b"audio-stream"))
        });
        write_ssh_vec(&p).unwrap();
    }
}
