//! SSH connection protocol channels.
//!
//! A [`Session`] multiplexes channels over one transport. The transport
//! feeds it decrypted channel-layer payloads with [`Session::dispatch()`]
//! or [`Session::run()`], and sends what it writes to the outbound queue.

#![forbid(unsafe_code)]

// avoids headscratching
#![deny(unused_must_use)]

// sunset_sshwire_derive output refers to `::sunset::sshwire`
extern crate self as sunset;

pub mod sshwire;
pub mod packets;
pub mod sshnames;
pub mod config;
// exported so that some Channel error variants can be created with .fail().
pub mod error;

pub mod event;
pub mod channel;
pub mod forward;
pub mod session;
pub mod jump;

#[cfg(test)]
mod muxlog;

// Application API
pub use sshwire::TextString;

pub use error::{Error, Result};
pub use session::Session;
pub use config::ConnectionInfo;
pub use sshnames::ChanFail;

pub use channel::{ChanNum, ChannelCore, ChannelHandler};
pub use channel::{ChannelSession, ServerChannel};
pub use event::{ChannelEvent, IncomingOpen, OpenInfo, ReqDetails};
pub use forward::{ChannelDirect, ChannelForwarded, ConnectTarget, DirectTarget, ForwardedPort};
pub use jump::JumpChannel;
