//! Tunnels a plain loopback socket through a `direct-tcpip` channel.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::*;
use channel::locked;
use forward::{ChannelDirect, DirectTarget};

/// Hands out loopback sockets that are transparently forwarded to
/// `host:port` via the peer.
///
/// Useful for libraries that only know how to connect a socket
/// themselves.
pub struct JumpChannel {
    session: Arc<Session>,
    host: String,
    port: u32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JumpChannel {
    pub fn new(session: &Arc<Session>, host: &str, port: u32) -> Self {
        Self { session: session.clone(), host: host.into(), port, task: Mutex::new(None) }
    }

    /// Listens on a loopback port for a single connection, and returns
    /// the connected client side.
    ///
    /// The accepted side is bridged to a new [`ChannelDirect`]. Errors
    /// opening the channel are logged, the returned socket sees EOF.
    pub async fn connect(&self) -> Result<TcpStream> {
        if !self.session.is_connected() {
            return error::NotConnected.fail();
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        debug!("jump to {}:{} listening on {addr}", self.host, self.port);

        let session = self.session.clone();
        let target = (self.host.clone(), self.port);
        let task = tokio::spawn(async move {
            let (host, port) = target;
            if let Err(e) = forward_one(listener, session, host.clone(), port).await {
                warn!("jump to {host}:{port} failed: {e}");
            }
        });
        if let Some(prev) = locked(&self.task).replace(task) {
            prev.abort();
        }

        Ok(TcpStream::connect(addr).await?)
    }

    /// Stops the listener or forward started by the last
    /// [`connect()`](Self::connect).
    pub fn stop(&self) {
        if let Some(t) = locked(&self.task).take() {
            t.abort();
        }
    }
}

impl Drop for JumpChannel {
    fn drop(&mut self) {
        self.stop()
    }
}

async fn forward_one(
    listener: TcpListener,
    session: Arc<Session>,
    host: String,
    port: u32,
) -> Result<()> {
    let (stream, from) = listener.accept().await?;
    drop(listener);
    trace!("jump accepted {from}");

    let ch = ChannelDirect::new(&session);
    let target = DirectTarget::Tcp {
        host,
        port,
        originator: from.ip().to_string(),
        originator_port: from.port() as u32,
    };
    ch.open(&target, stream, None).await?;
    ch.bind().await
}
