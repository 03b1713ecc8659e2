//! Local forwarding, `direct-tcpip` and `direct-streamlocal@openssh.com`

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::*;
use channel::client::{OpenOutcome, OpenWaiter};
use channel::{locked, ChannelCore, ChannelHandler};
use event::ChannelEvent;
use forward::port::ForwardedPort;
use forward::socket::{BridgeSocket, ForwardStream};
use packets::{ChannelOpenConfirmation, ChannelOpenType, DirectStreamLocal, DirectTcpip};

/// Where the peer should connect a direct channel
#[derive(Debug, Clone, PartialEq)]
pub enum DirectTarget {
    Tcp {
        host: String,
        port: u32,
        /// Address the local connection came from
        originator: String,
        originator_port: u32,
    },
    /// A unix socket path on the peer
    StreamLocal { path: String },
}

impl DirectTarget {
    fn open_type(&self) -> ChannelOpenType<'_> {
        match self {
            Self::Tcp { host, port, originator, originator_port } => {
                ChannelOpenType::DirectTcpip(DirectTcpip {
                    address: host.as_str().into(),
                    port: *port,
                    origin: originator.as_str().into(),
                    origin_port: *originator_port,
                })
            }
            Self::StreamLocal { path } => ChannelOpenType::DirectStreamLocal(DirectStreamLocal {
                socket_path: path.as_str().into(),
                reserved: "",
                reserved_port: 0,
            }),
        }
    }
}

/// A channel carrying a locally accepted socket to a target the peer
/// connects to.
///
/// [`open()`](Self::open) then [`bind()`](Self::bind).
pub struct ChannelDirect {
    core: ChannelCore,
    open: OpenWaiter,
    socket: BridgeSocket,
    /// From the originating port, until `bind()` takes it
    closing: Mutex<Option<watch::Receiver<bool>>>,
}

impl ChannelDirect {
    pub fn new(session: &Arc<Session>) -> Arc<Self> {
        let ch = Arc::new(Self {
            core: ChannelCore::new_client(session),
            open: OpenWaiter::default(),
            socket: BridgeSocket::new(),
            closing: Mutex::new(None),
        });
        let w: Weak<dyn ChannelHandler> = Arc::downgrade(&ch) as _;
        session.register(ch.core.num(), w);
        ch
    }

    /// Opens the channel for `stream`, which was accepted on `port`.
    ///
    /// A rejected open disposes the stream and returns
    /// [`Error::OpenRejected`].
    pub async fn open(
        &self,
        target: &DirectTarget,
        stream: impl ForwardStream,
        port: Option<&ForwardedPort>,
    ) -> Result<()> {
        if self.core.is_open() {
            return error::AlreadyOpen.fail();
        }
        if !self.core.session().is_connected() {
            return error::NotConnected.fail();
        }

        self.socket.attach(Box::new(stream))?;
        *locked(&self.closing) = port.map(|p| p.closing());

        match self.open.open(&self.core, target.open_type()).await {
            Ok(OpenOutcome::Confirmed) => Ok(()),
            Ok(OpenOutcome::Failed { reason, desc }) => {
                self.socket.dispose().await;
                error::OpenRejected { reason, desc }.fail()
            }
            Err(e) => {
                self.socket.dispose().await;
                Err(e)
            }
        }
    }

    /// Pumps the socket into the channel until either side finishes,
    /// then closes the channel.
    pub async fn bind(&self) -> Result<()> {
        let closing = locked(&self.closing).take();
        let r = self.socket.pump(&self.core, closing).await;
        if let Err(e) = &r {
            debug!("channel {} pump failed: {e}", self.core.num());
        }
        let c = self.close().await;
        r.and(c)
    }
}

#[async_trait]
impl ChannelHandler for ChannelDirect {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn on_open_confirmation(&self, p: &ChannelOpenConfirmation) -> Result<()> {
        self.open.confirm(&self.core, p)
    }

    async fn on_open_failure(&self, reason: u32, desc: String) -> Result<()> {
        self.open.fail(&self.core, reason, desc)
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
        self.open.cancel(&self.core);
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

#[cfg(test)]
mod tests {
    use crate::channel::*;
    use crate::config::ConnectionInfo;
    use crate::error::Error;
    use crate::forward::*;
    use crate::muxlog::init_test_log;
    use crate::packets::*;
    use crate::sshwire::BinString;
    use crate::test::Peer;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
    use tokio::net::{TcpListener, TcpStream};

    /// Fails its first read with `WouldBlock`, then reads `data` and EOF.
    /// Writes are discarded.
    struct StallingStream {
        stalled: bool,
        data: &'static [u8],
    }

    impl AsyncRead for StallingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.stalled {
                self.stalled = true;
                return Poll::Ready(Err(io::ErrorKind::WouldBlock.into()));
            }
            let n = self.data.len().min(buf.remaining());
            let (d, rest) = self.data.split_at(n);
            buf.put_slice(d);
            self.data = rest;
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for StallingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Answers the next open with a confirmation, returning the decoded
    /// open type's debug form
    async fn confirm_open(peer: &mut Peer, remote: u32) -> String {
        let m = peer.recv().await;
        let Packet::ChannelOpen(o) = m.packet() else { panic!() };
        let ty = format!("{:?}", o.ty);
        let num = o.num;
        peer.inject(ChannelOpenConfirmation {
            num,
            sender_num: remote,
            initial_window: 10000,
            max_packet: 1000,
        })
        .await;
        ty
    }

    /// Returns (client side, accepted side) of a loopback connection
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        let (c, s) = tokio::join!(TcpStream::connect(addr), l.accept());
        (c.unwrap(), s.unwrap().0)
    }

    #[tokio::test]
    async fn tcp_bridge() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let (mut client, accepted) = tcp_pair().await;
        let ch = ChannelDirect::new(&peer.session);
        let target = DirectTarget::Tcp {
            host: "db.internal".into(),
            port: 5432,
            originator: "127.0.0.1".into(),
            originator_port: 40000,
        };

        let (r, ty) =
            tokio::join!(ch.open(&target, accepted, None), confirm_open(&mut peer, 70));
        r.unwrap();
        assert!(ty.contains("db.internal"), "{ty}");
        assert!(ch.core().is_open());

        let bind = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.bind().await })
        };

        client.write_all(b"hello").await.unwrap();
        let m = peer.recv().await;
        let Packet::ChannelData(d) = m.packet() else { panic!() };
        assert_eq!(d.num, 70);
        assert_eq!(d.data.0, b"hello");

        let num = ch.core().num().0;
        peer.inject(ChannelData { num, data: BinString(b"world") }).await;
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // local side finishes, the channel closes
        client.shutdown().await.unwrap();
        assert!(matches!(peer.recv().await.packet(), Packet::ChannelEof(ChannelEof { num: 70 })));
        assert!(matches!(peer.recv().await.packet(), Packet::ChannelClose(ChannelClose { num: 70 })));
        peer.inject(ChannelClose { num }).await;
        bind.await.unwrap().unwrap();
        assert!(!ch.core().is_open());
    }

    #[tokio::test]
    async fn open_rejected() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let (mut client, accepted) = tcp_pair().await;
        let ch = ChannelDirect::new(&peer.session);
        let target = DirectTarget::StreamLocal { path: "/run/missing.sock".into() };

        let (r, _) = tokio::join!(ch.open(&target, accepted, None), async {
            let m = peer.recv().await;
            let Packet::ChannelOpen(o) = m.packet() else { panic!() };
            let ChannelOpenType::DirectStreamLocal(s) = &o.ty else { panic!() };
            assert_eq!(s.socket_path.as_str().unwrap(), "/run/missing.sock");
            let num = o.num;
            peer.inject(ChannelOpenFailure {
                num,
                reason: 2,
                desc: "connect failed".into(),
                lang: "",
            })
            .await;
        });
        assert!(matches!(r, Err(Error::OpenRejected { reason: 2, .. })));
        assert!(!ch.core().is_open());

        // socket was disposed
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn eof_half_closes() {
        use tokio::net::UnixStream;

        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let (mut local, bridged) = UnixStream::pair().unwrap();
        let ch = ChannelDirect::new(&peer.session);
        let target = DirectTarget::StreamLocal { path: "/tmp/app.sock".into() };

        let (r, _) = tokio::join!(ch.open(&target, bridged, None), confirm_open(&mut peer, 8));
        r.unwrap();
        let bind = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.bind().await })
        };

        // the peer's EOF only shuts our socket's send direction
        let num = ch.core().num().0;
        peer.inject(ChannelEof { num }).await;
        let mut buf = [0u8; 16];
        assert_eq!(local.read(&mut buf).await.unwrap(), 0);

        local.write_all(b"late").await.unwrap();
        let m = peer.recv().await;
        let Packet::ChannelData(d) = m.packet() else { panic!() };
        assert_eq!(d.data.0, b"late");

        // EOF was received so only CLOSE is sent
        drop(local);
        assert!(matches!(peer.recv().await.packet(), Packet::ChannelClose(_)));
        peer.inject(ChannelClose { num }).await;
        bind.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn port_stop_shuts_socket() {
        use tokio::net::UnixStream;

        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let port = ForwardedPort::new();
        let (mut local, bridged) = UnixStream::pair().unwrap();
        let ch = ChannelDirect::new(&peer.session);
        let target = DirectTarget::StreamLocal { path: "/tmp/app.sock".into() };

        let (r, _) =
            tokio::join!(ch.open(&target, bridged, Some(&port)), confirm_open(&mut peer, 8));
        r.unwrap();
        let bind = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.bind().await })
        };

        port.stop();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), local.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(!bind.is_finished());
        assert!(ch.core().is_open());
    }

    #[tokio::test]
    async fn stalled_read_retried() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let ch = ChannelDirect::new(&peer.session);
        let target = DirectTarget::StreamLocal { path: "/run/app.sock".into() };
        let stream = StallingStream { stalled: false, data: b"after a stall" };

        let (r, _) = tokio::join!(ch.open(&target, stream, None), confirm_open(&mut peer, 71));
        r.unwrap();
        let bind = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.bind().await })
        };

        let m = peer.recv().await;
        let Packet::ChannelData(d) = m.packet() else { panic!() };
        assert_eq!(d.num, 71);
        assert_eq!(d.data.0, b"after a stall");

        assert!(matches!(peer.recv().await.packet(), Packet::ChannelEof(ChannelEof { num: 71 })));
        assert!(matches!(peer.recv().await.packet(), Packet::ChannelClose(ChannelClose { num: 71 })));
        peer.inject(ChannelClose { num: ch.core().num().0 }).await;
        bind.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_disposes() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let (mut client, accepted) = tcp_pair().await;
        let ch: Arc<ChannelDirect> = ChannelDirect::new(&peer.session);
        let target = DirectTarget::Tcp {
            host: "localhost".into(),
            port: 22,
            originator: "127.0.0.1".into(),
            originator_port: 1,
        };
        let (r, _) = tokio::join!(ch.open(&target, accepted, None), confirm_open(&mut peer, 1));
        r.unwrap();
        let bind = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.bind().await })
        };

        peer.session.disconnect().await;
        bind.await.unwrap().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(peer.try_recv().is_none());
    }
}
