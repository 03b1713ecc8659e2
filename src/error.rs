#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;
use core::str::Utf8Error;

use snafu::prelude::*;

use crate::channel::ChanNum;

/// The channel layer error type.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// Error in received SSH protocol.
    SSHProtoError,

    /// SSH packet contents doesn't match length
    WrongPacketLength,

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// Received packet at a disallowed time.
    PacketWrong,

    #[snafu(display("Bad channel number {num}"))]
    BadChannel { num: ChanNum },

    /// Channel not opened/confirmed yet
    ///
    /// Returned when the remote channel number, window or packet size are
    /// accessed before the open confirmation, or when EOF is sent on a
    /// channel that isn't open.
    NotOpen,

    /// Channel is already open
    AlreadyOpen,

    /// The session is not connected
    NotConnected,

    /// The session was disconnected while waiting
    SessionDisconnected,

    /// The channel closed while waiting
    ChannelClosed,

    /// Peer answered a channel open with `SSH_MSG_CHANNEL_OPEN_FAILURE`
    #[snafu(display("Channel open rejected, reason {reason}: {desc}"))]
    OpenRejected { reason: u32, desc: String },

    #[snafu(display("Failed to open channel after {attempts} attempts"))]
    ChannelOpenFailed { attempts: u32 },

    /// Peer sent a channel request that isn't recognised.
    #[snafu(display("Unknown channel request \"{name}\""))]
    UnknownRequest { name: String },

    /// Too many channel requests awaiting a reply
    TooManyRequests,

    /// IO Error
    IoError { source: std::io::Error },

    // This state should not be reached, previous logic should have prevented it.
    // Create this using [`Error::bug()`] or [`.trap()`](TrapBug::trap).
    /// Program bug
    Bug,
}

impl Error {
    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    #[cold]
    fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            trace!("Hit a bug: {args}");
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `trace` level.
    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }

    #[cold]
    pub fn bug_err_msg(msg: &str) -> Error {
        Self::bug_fmt(format_args!("{}", msg))
    }
}

/// A channel layer Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    fn trap(self) -> Result<T, Error> {
        // call directly so that Location::caller() works
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError { source: value }
    }
}
