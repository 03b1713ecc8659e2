//! Events delivered to applications using channels
//!
//! Each channel has a [`ChannelEvent`] stream, taken with
//! [`ChannelCore::take_events()`](crate::channel::ChannelCore::take_events).
//! Channels opened by the peer arrive as [`IncomingOpen`] from
//! [`Session::incoming_opens()`](crate::Session::incoming_opens).

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;

use crate::*;
use channel::{ChanDir, ServerChannel};
use packets::{ChannelOpenType, ChannelReqType};
use sshnames::ChanFail;
use sshwire::{BinString, SSHEncodeEnum, TextString};

#[derive(Debug)]
pub enum ChannelEvent {
    /// The peer confirmed our `SSH_MSG_CHANNEL_OPEN`
    OpenConfirmed,
    /// The peer rejected our `SSH_MSG_CHANNEL_OPEN`
    OpenFailed { reason: u32, desc: String },
    Data(Vec<u8>),
    ExtendedData { code: u32, data: Vec<u8> },
    Eof,
    /// The channel finished closing after the peer sent `SSH_MSG_CHANNEL_CLOSE`.
    ///
    /// Raised at most once.
    Closed,
    /// A channel request from the peer.
    ///
    /// If `want_reply` is set the application should answer with
    /// [`ChannelCore::send_request_reply()`](crate::channel::ChannelCore::send_request_reply).
    Request { want_reply: bool, details: ReqDetails },
    /// An error while handling a message for this channel.
    ///
    /// Other channels of the session are unaffected.
    Exception(Error),
    /// The session's transport went away
    Disconnected,
}

/// The contents of a `"pty-req"` request, with storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Pty {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    /// Encoded terminal modes, passed through unparsed
    pub modes: Vec<u8>,
}

/// Like a `packets::ChannelReqType` but with storage.
/// Lifetime-free variants have the packet part directly.
#[derive(Debug, Clone)]
pub enum ReqDetails {
    Shell,
    Exec(String),
    Pty(Pty),
    X11 { single_connection: bool, protocol: String, cookie: String, screen: u32 },
    Env { name: String, value: String },
    Subsystem(String),
    WinChange(packets::WinChange),
    XonXoff(bool),
    Signal(String),
    ExitStatus(u32),
    ExitSignal(ExitSignal),
    /// Break length in milliseconds
    Break(u32),
    Eow,
    KeepAlive,
}

/// Remote process termination by a signal
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub signal: String,
    pub core_dumped: bool,
    pub error: String,
    pub lang: String,
}

impl ReqDetails {
    /// Whether the request solicits `SSH_MSG_CHANNEL_SUCCESS`/`FAILURE`.
    pub fn want_reply(&self) -> bool {
        !matches!(
            self,
            Self::WinChange(_)
                | Self::Signal(_)
                | Self::ExitStatus(_)
                | Self::ExitSignal(_)
                | Self::XonXoff(_)
        )
    }

    /// The request name as sent on the wire
    pub fn name(&self) -> &'static str {
        self.req_type().variant_name().unwrap_or("unknown")
    }

    pub(crate) fn req_type(&self) -> ChannelReqType<'_> {
        match self {
            Self::Shell => ChannelReqType::Shell,
            Self::Exec(cmd) => {
                ChannelReqType::Exec(packets::Exec { command: cmd.as_str().into() })
            }
            Self::Pty(pty) => ChannelReqType::Pty(packets::PtyReq {
                term: pty.term.as_str().into(),
                cols: pty.cols,
                rows: pty.rows,
                width: pty.width,
                height: pty.height,
                modes: BinString(&pty.modes),
            }),
            Self::X11 { single_connection, protocol, cookie, screen } => {
                ChannelReqType::X11Req(packets::X11Req {
                    single_connection: *single_connection,
                    protocol,
                    cookie: cookie.as_str().into(),
                    screen: *screen,
                })
            }
            Self::Env { name, value } => ChannelReqType::Env(packets::Env {
                name: name.as_str().into(),
                value: value.as_str().into(),
            }),
            Self::Subsystem(s) => {
                ChannelReqType::Subsystem(packets::Subsystem { subsystem: s.as_str().into() })
            }
            Self::WinChange(w) => ChannelReqType::WinChange(w.clone()),
            Self::XonXoff(c) => {
                ChannelReqType::XonXoff(packets::XonXoff { client_can_do: *c })
            }
            Self::Signal(sig) => ChannelReqType::Signal(packets::Signal { sig }),
            Self::ExitStatus(status) => {
                ChannelReqType::ExitStatus(packets::ExitStatus { status: *status })
            }
            Self::ExitSignal(e) => ChannelReqType::ExitSignal(packets::ExitSignal {
                signal: &e.signal,
                core: e.core_dumped,
                error: e.error.as_str().into(),
                lang: &e.lang,
            }),
            Self::Break(length) => ChannelReqType::Break(packets::Break { length: *length }),
            Self::Eow => ChannelReqType::Eow,
            Self::KeepAlive => ChannelReqType::KeepAlive,
        }
    }
}

impl TryFrom<&ChannelReqType<'_>> for ReqDetails {
    type Error = Error;

    /// Fails with [`Error::UnknownRequest`] for unrecognised names
    fn try_from(r: &ChannelReqType<'_>) -> Result<Self> {
        let d = match r {
            ChannelReqType::Shell => Self::Shell,
            ChannelReqType::Exec(e) => Self::Exec(e.command.to_lossy()),
            ChannelReqType::Pty(p) => Self::Pty(Pty {
                term: p.term.as_ascii()?.into(),
                cols: p.cols,
                rows: p.rows,
                width: p.width,
                height: p.height,
                modes: p.modes.0.to_vec(),
            }),
            ChannelReqType::X11Req(x) => Self::X11 {
                single_connection: x.single_connection,
                protocol: x.protocol.into(),
                cookie: x.cookie.to_lossy(),
                screen: x.screen,
            },
            ChannelReqType::Env(e) => {
                Self::Env { name: e.name.to_lossy(), value: e.value.to_lossy() }
            }
            ChannelReqType::Subsystem(s) => Self::Subsystem(s.subsystem.to_lossy()),
            ChannelReqType::WinChange(w) => Self::WinChange(w.clone()),
            ChannelReqType::XonXoff(x) => Self::XonXoff(x.client_can_do),
            ChannelReqType::Signal(s) => Self::Signal(s.sig.into()),
            ChannelReqType::ExitStatus(e) => Self::ExitStatus(e.status),
            ChannelReqType::ExitSignal(e) => Self::ExitSignal(ExitSignal {
                signal: e.signal.into(),
                core_dumped: e.core,
                error: e.error.to_lossy(),
                lang: e.lang.into(),
            }),
            ChannelReqType::Break(b) => Self::Break(b.length),
            ChannelReqType::Eow => Self::Eow,
            ChannelReqType::KeepAlive => Self::KeepAlive,
            ChannelReqType::Unknown(u) => {
                return error::UnknownRequest { name: u.to_string() }.fail()
            }
        };
        Ok(d)
    }
}

/// Type specific contents of a `SSH_MSG_CHANNEL_OPEN` from the peer
#[derive(Debug, Clone, PartialEq)]
pub enum OpenInfo {
    Session,
    ForwardedTcpip { address: String, port: u32, origin: String, origin_port: u32 },
    DirectTcpip { address: String, port: u32, origin: String, origin_port: u32 },
    DirectStreamLocal { socket_path: String },
    ForwardedStreamLocal { socket_path: String },
    X11 { origin: String, origin_port: u32 },
}

impl OpenInfo {
    /// Returns the unknown type name as `Err`
    pub(crate) fn from_packet(ty: &ChannelOpenType<'_>) -> Result<Self, String> {
        let i = match ty {
            ChannelOpenType::Session => Self::Session,
            ChannelOpenType::ForwardedTcpip(t) => Self::ForwardedTcpip {
                address: t.address.to_lossy(),
                port: t.port,
                origin: t.origin.to_lossy(),
                origin_port: t.origin_port,
            },
            ChannelOpenType::DirectTcpip(t) => Self::DirectTcpip {
                address: t.address.to_lossy(),
                port: t.port,
                origin: t.origin.to_lossy(),
                origin_port: t.origin_port,
            },
            ChannelOpenType::DirectStreamLocal(s) => {
                Self::DirectStreamLocal { socket_path: s.socket_path.to_lossy() }
            }
            ChannelOpenType::ForwardedStreamLocal(s) => {
                Self::ForwardedStreamLocal { socket_path: s.socket_path.to_lossy() }
            }
            ChannelOpenType::X11(x) => {
                Self::X11 { origin: x.origin.to_lossy(), origin_port: x.origin_port }
            }
            ChannelOpenType::Unknown(u) => return Err(u.to_string()),
        };
        Ok(i)
    }
}

/// A channel the peer asked to open.
///
/// Must be answered with [`accept()`](Self::accept), [`reject()`](Self::reject),
/// or by binding it with [`ChannelForwarded`](crate::ChannelForwarded).
/// Dropping it unanswered rejects it with
/// `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`.
pub struct IncomingOpen {
    pub(crate) session: Arc<Session>,
    info: OpenInfo,
    pub(crate) remote: ChanDir,
    answered: bool,
}

impl IncomingOpen {
    pub(crate) fn new(session: Arc<Session>, info: OpenInfo, remote: ChanDir) -> Self {
        Self { session, info, remote, answered: false }
    }

    pub fn info(&self) -> &OpenInfo {
        &self.info
    }

    /// The peer's channel number
    pub fn remote_num(&self) -> u32 {
        self.remote.num
    }

    /// Sends `SSH_MSG_CHANNEL_OPEN_CONFIRMATION`, returning the open channel.
    pub async fn accept(self) -> Result<Arc<ServerChannel>> {
        let ch = ServerChannel::new(self);
        ch.core().send_open_confirmation().await?;
        Ok(ch)
    }

    pub async fn reject(mut self, reason: ChanFail, desc: &str) -> Result<()> {
        self.answered = true;
        self.session.send_open_failure(self.remote.num, reason, desc).await
    }

    /// Hands responsibility for the answer to a server channel
    pub(crate) fn take(mut self) -> (Arc<Session>, OpenInfo, ChanDir) {
        self.answered = true;
        (self.session.clone(), self.info.clone(), self.remote)
    }
}

impl core::fmt::Debug for IncomingOpen {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IncomingOpen")
            .field("info", &self.info)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Drop for IncomingOpen {
    fn drop(&mut self) {
        if !self.answered {
            debug!("Rejecting unanswered channel open {:?}", self.info);
            let p = packets::ChannelOpenFailure {
                num: self.remote.num,
                reason: ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED as u32,
                desc: "".into(),
                lang: "",
            };
            if !self.session.try_send_message(&p.into()) {
                debug!("Couldn't send open failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::muxlog::init_test_log;
    use crate::event::*;
    use crate::packets::*;

    #[test]
    fn request_reply_kinds() {
        init_test_log();
        assert!(ReqDetails::Exec("ls".into()).want_reply());
        assert!(ReqDetails::KeepAlive.want_reply());
        assert!(ReqDetails::Eow.want_reply());
        assert!(!ReqDetails::XonXoff(true).want_reply());
        assert!(!ReqDetails::ExitStatus(1).want_reply());
        assert!(!ReqDetails::Signal("INT".into()).want_reply());
        assert_eq!(ReqDetails::Eow.name(), "eow@openssh.com");
        assert_eq!(ReqDetails::Break(10).name(), "break");
    }

    #[test]
    fn details_from_packet() {
        init_test_log();
        let r = ChannelReqType::Env(Env { name: "TERM".into(), value: "vt100".into() });
        let d = ReqDetails::try_from(&r).unwrap();
        assert!(matches!(d, ReqDetails::Env { ref name, ref value }
            if name == "TERM" && value == "vt100"));

        let r = ChannelReqType::Unknown(Unknown(b"auth-agent-req@openssh.com"));
        let e = ReqDetails::try_from(&r).unwrap_err();
        assert!(matches!(e, Error::UnknownRequest { ref name }
            if name == "auth-agent-req@openssh.com"));
    }

    #[test]
    fn open_info() {
        let ty = ChannelOpenType::DirectStreamLocal(DirectStreamLocal {
            socket_path: "/run/x.sock".into(),
            reserved: "",
            reserved_port: 0,
        });
        assert_eq!(
            OpenInfo::from_packet(&ty).unwrap(),
            OpenInfo::DirectStreamLocal { socket_path: "/run/x.sock".into() }
        );
        let ty = ChannelOpenType::Unknown(Unknown(b"audio"));
        assert_eq!(OpenInfo::from_packet(&ty).unwrap_err(), "audio");
    }
}
