//! Port forwarding channels
//!
//! Direct channels (`direct-tcpip`, `direct-streamlocal@openssh.com`) carry
//! a locally accepted socket to the peer. Forwarded channels
//! (`forwarded-tcpip`, `forwarded-streamlocal@openssh.com`) are opened by
//! the peer and connected to a local service.

mod direct;
mod forwarded;
mod port;
mod socket;

pub use direct::{ChannelDirect, DirectTarget};
pub use forwarded::{ChannelForwarded, ConnectTarget};
pub use port::ForwardedPort;
pub use socket::ForwardStream;
