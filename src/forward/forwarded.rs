//! Remote forwarding, `forwarded-tcpip` and `forwarded-streamlocal@openssh.com`

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::*;
use channel::{ChannelCore, ChannelHandler};
use event::{ChannelEvent, IncomingOpen, OpenInfo};
use forward::port::ForwardedPort;
use forward::socket::{BridgeSocket, ForwardStream};
use sshnames::{ChanFail, OPEN_FAILURE_CONNECT};

/// The local service a forwarded channel is connected to
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectTarget {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    StreamLocal { path: std::path::PathBuf },
}

impl ConnectTarget {
    async fn connect(&self) -> io::Result<Box<dyn ForwardStream>> {
        let s: Box<dyn ForwardStream> = match self {
            Self::Tcp { host, port } => Box::new(TcpStream::connect((host.as_str(), *port)).await?),
            #[cfg(unix)]
            Self::StreamLocal { path } => Box::new(tokio::net::UnixStream::connect(path).await?),
        };
        Ok(s)
    }
}

/// A channel the peer opened for a remote forward, bridged to a local
/// service.
///
/// The open is answered by [`bind()`](Self::bind) once the local
/// connection succeeds or fails.
pub struct ChannelForwarded {
    core: ChannelCore,
    info: OpenInfo,
    socket: BridgeSocket,
}

impl ChannelForwarded {
    pub fn new(open: IncomingOpen) -> Arc<Self> {
        let (session, info, remote) = open.take();
        let ch = Arc::new(Self {
            core: ChannelCore::new_server(&session, remote),
            info,
            socket: BridgeSocket::new(),
        });
        let w: Weak<dyn ChannelHandler> = Arc::downgrade(&ch) as _;
        session.register(ch.core.num(), w);
        ch
    }

    /// What the peer asked to open, usually [`OpenInfo::ForwardedTcpip`]
    /// or [`OpenInfo::ForwardedStreamLocal`]
    pub fn info(&self) -> &OpenInfo {
        &self.info
    }

    /// Connects to `target` and answers the open. When connected, pumps
    /// the socket into the channel until either side finishes, then
    /// closes the channel.
    ///
    /// A failed connection is answered with `SSH_OPEN_CONNECT_FAILED`.
    pub async fn bind(&self, target: &ConnectTarget, port: Option<&ForwardedPort>) -> Result<()> {
        let stream = match target.connect().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Forward to {target:?} failed: {e}");
                self.core
                    .send_open_failure(ChanFail::SSH_OPEN_CONNECT_FAILED, OPEN_FAILURE_CONNECT)
                    .await?;
                return Err(e.into());
            }
        };
        trace!("channel {} connected to {target:?}", self.core.num());

        self.socket.attach(stream)?;
        self.core.send_open_confirmation().await?;

        let r = self.socket.pump(&self.core, port.map(|p| p.closing())).await;
        if let Err(e) = &r {
            debug!("channel {} pump failed: {e}", self.core.num());
        }
        let c = self.close().await;
        r.and(c)
    }
}

#[async_trait]
impl ChannelHandler for ChannelForwarded {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn on_data(&self, data: &[u8]) -> Result<()> {
        self.socket.deliver(&self.core, data).await
    }

    async fn on_eof(&self) -> Result<()> {
        self.core.on_eof();
        self.socket.shutdown_send().await;
        Ok(())
    }

    async fn on_close(&self) -> Result<()> {
        self.socket.shutdown_send().await;
        self.core.on_close_received();
        self.close().await
    }

    async fn on_disconnected(&self) {
        self.core.on_disconnected();
        self.socket.dispose().await;
    }

    async fn on_exception(&self, e: Error) {
        debug!("channel {} error: {e}", self.core.num());
        self.socket.shutdown_send().await;
        self.core.raise(ChannelEvent::Exception(e))
    }

    async fn close(&self) -> Result<()> {
        let r = self.core.close().await;
        self.socket.dispose().await;
        r
    }
}
