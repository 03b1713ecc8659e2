//! A socket bridged to a channel

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::io;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;

use crate::*;
use channel::{locked, ChannelCore};
use config::SOCKET_RETRY_DELAY;

/// A byte stream that can be bridged to a channel, such as a
/// `TcpStream` or `UnixStream`.
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type Stream = Box<dyn ForwardStream>;

#[derive(Debug, PartialEq)]
pub(crate) enum SocketErrorKind {
    /// Try the read again shortly
    Resumable,
    /// Expected while closing, ends the pump quietly
    Graceful,
    Fatal,
}

pub(crate) fn classify(e: &io::Error) -> SocketErrorKind {
    match e.kind() {
        io::ErrorKind::WouldBlock => SocketErrorKind::Resumable,
        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => {
            SocketErrorKind::Graceful
        }
        _ if e.raw_os_error() == Some(libc::ENOBUFS) => SocketErrorKind::Resumable,
        _ => SocketErrorKind::Fatal,
    }
}

/// Owns the socket halves of a bridge. Disposed exactly once.
pub(crate) struct BridgeSocket {
    writer: tokio::sync::Mutex<Option<WriteHalf<Stream>>>,
    /// Taken by the pump while it runs
    reader: Mutex<Option<ReadHalf<Stream>>>,
    disposed: watch::Sender<bool>,
}

impl BridgeSocket {
    pub fn new() -> Self {
        let (disposed, _) = watch::channel(false);
        Self {
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            disposed,
        }
    }

    pub fn attach(&self, stream: Stream) -> Result<()> {
        if *self.disposed.borrow() {
            return error::ChannelClosed.fail();
        }
        let (r, w) = tokio::io::split(stream);
        let mut reader = locked(&self.reader);
        let mut writer = self.writer.try_lock().map_err(|_| Error::AlreadyOpen)?;
        if reader.is_some() || writer.is_some() {
            return error::AlreadyOpen.fail();
        }
        *reader = Some(r);
        *writer = Some(w);
        Ok(())
    }

    /// Writes channel data to the socket, if still attached.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        if let Some(w) = w.as_mut() {
            w.write_all(data).await?;
        } else {
            trace!("socket gone, dropping {} bytes", data.len());
        }
        Ok(())
    }

    /// Shuts down the socket's send direction. The receive direction
    /// keeps going so the pump can drain.
    pub async fn shutdown_send(&self) {
        let mut w = self.writer.lock().await;
        if let Some(w) = w.as_mut() {
            if let Err(e) = w.shutdown().await {
                debug!("socket shutdown: {e}");
            }
        }
    }

    pub async fn dispose(&self) {
        if self.disposed.send_replace(true) {
            return;
        }
        trace!("dispose socket");
        // The pump drops the read half when it sees `disposed`
        locked(&self.reader).take();
        self.writer.lock().await.take();
    }

    /// Reads from the socket and sends it as channel data, until the
    /// socket reaches EOF, the channel stops, or the socket is disposed.
    ///
    /// `closing` triggers a shutdown of the socket's send direction.
    pub async fn pump(
        &self,
        core: &ChannelCore,
        closing: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let Some(mut reader) = locked(&self.reader).take() else {
            return Ok(());
        };
        let mut disposed = self.disposed.subscribe();
        let mut closing = closing;
        let mut buf = vec![0u8; core.remote_packet_size()?.max(1) as usize];

        while core.is_open() {
            let wake = tokio::select! {
                r = reader.read(&mut buf) => Wake::Read(r),
                _ = disposed.wait_for(|d| *d) => Wake::Disposed,
                _ = port_closing(&mut closing) => Wake::PortClosing,
            };

            let r = match wake {
                Wake::Read(r) => r,
                Wake::Disposed => break,
                Wake::PortClosing => {
                    debug!("forwarded port closing, channel {}", core.num());
                    self.shutdown_send().await;
                    closing = None;
                    continue;
                }
            };

            match r {
                Ok(0) => {
                    trace!("socket EOF, channel {}", core.num());
                    break;
                }
                Ok(n) => match core.send_data(&buf[..n]).await {
                    Ok(()) => (),
                    Err(Error::ChannelClosed) => break,
                    Err(e) => return Err(e),
                },
                Err(e) => match classify(&e) {
                    SocketErrorKind::Resumable => {
                        trace!("socket read {e}, retrying");
                        tokio::time::sleep(SOCKET_RETRY_DELAY).await;
                    }
                    SocketErrorKind::Graceful => {
                        debug!("socket read {e}, stopping");
                        break;
                    }
                    SocketErrorKind::Fatal => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    /// Channel data from the peer, written to the socket
    pub async fn deliver(&self, core: &ChannelCore, data: &[u8]) -> Result<()> {
        if core.take_input(data.len()).await? {
            self.write_all(data).await?;
        }
        Ok(())
    }
}

enum Wake {
    Read(io::Result<usize>),
    Disposed,
    PortClosing,
}

/// Completes when the port starts closing. Pending forever without a port.
async fn port_closing(closing: &mut Option<watch::Receiver<bool>>) {
    match closing {
        Some(c) => {
            if c.wait_for(|c| *c).await.is_err() {
                // Port dropped without stopping
                std::future::pending::<()>().await
            }
        }
        None => std::future::pending().await,
    }
}
