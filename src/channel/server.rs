//! Channels the peer opens

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::*;
use channel::{locked, ChanDir, ChanState, ChannelCore, ChannelHandler};
use event::{IncomingOpen, OpenInfo};
use sshnames::ChanFail;

impl ChannelCore {
    /// A channel the peer has asked to open, already knowing the peer's
    /// channel number, window, and packet size.
    pub(crate) fn new_server(session: &Arc<Session>, remote: ChanDir) -> Self {
        Self::new(session, ChanState::Opening, Some(remote))
    }

    /// Sends `SSH_MSG_CHANNEL_OPEN_CONFIRMATION`, the channel is open
    /// from then on.
    pub(crate) async fn send_open_confirmation(&self) -> Result<()> {
        locked(&self.state).confirm()?;
        let p = packets::ChannelOpenConfirmation {
            num: self.remote_channel_number()?,
            sender_num: self.num.0,
            initial_window: self.initial_window,
            max_packet: self.local_packet,
        };
        debug!("channel {} accepted, remote {}", self.num, p.num);
        self.session.send_message(&p.into()).await
    }

    pub(crate) async fn send_open_failure(&self, reason: ChanFail, desc: &str) -> Result<()> {
        let num = self.remote_channel_number()?;
        if !matches!(locked(&self.state).finish(), None) {
            return Error::bug_msg("open failure for open channel");
        }
        self.session.send_open_failure(num, reason, desc).await
    }
}

/// A channel accepted from an [`IncomingOpen`]
pub struct ServerChannel {
    core: ChannelCore,
    info: OpenInfo,
}

impl ServerChannel {
    pub(crate) fn new(open: IncomingOpen) -> Arc<Self> {
        let (session, info, remote) = open.take();
        let ch = Arc::new(Self { core: ChannelCore::new_server(&session, remote), info });
        let w: Weak<dyn ChannelHandler> = Arc::downgrade(&ch) as _;
        session.register(ch.core.num(), w);
        ch
    }

    /// What the peer asked to open
    pub fn info(&self) -> &OpenInfo {
        &self.info
    }
}

#[async_trait]
impl ChannelHandler for ServerChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::*;
    use crate::config::ConnectionInfo;
    use crate::event::*;
    use crate::muxlog::init_test_log;
    use crate::packets::*;
    use crate::sshnames::ChanFail;
    use crate::test::Peer;

    #[tokio::test]
    async fn accept_incoming() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let mut opens = peer.session.incoming_opens();

        peer.inject(ChannelOpen {
            num: 40,
            initial_window: 5000,
            max_packet: 1000,
            ty: ChannelOpenType::Session,
        })
        .await;
        let o = opens.try_recv().unwrap();
        assert_eq!(o.info(), &OpenInfo::Session);
        assert_eq!(o.remote_num(), 40);

        let ch = o.accept().await.unwrap();
        let m = peer.recv().await;
        let Packet::ChannelOpenConfirmation(c) = m.packet() else { panic!() };
        assert_eq!(c.num, 40);
        assert_eq!(c.sender_num, ch.core().num().0);
        assert!(ch.core().is_open());
        assert_eq!(ch.core().remote_window_size().unwrap(), 5000);
        assert_eq!(ch.core().remote_packet_size().unwrap(), 1000);

        // requests from the peer become events
        let mut ev = ch.core().take_events().unwrap();
        peer.inject(ChannelRequest {
            num: c.sender_num,
            want_reply: true,
            req: ChannelReqType::Exec(Exec { command: "date".into() }),
        })
        .await;
        match ev.try_recv().unwrap() {
            ChannelEvent::Request { want_reply: true, details: ReqDetails::Exec(c) } => {
                assert_eq!(c, "date")
            }
            e => panic!("unexpected {e:?}"),
        }
        ch.core().send_request_reply(true).await.unwrap();
        let m = peer.recv().await;
        assert!(matches!(m.packet(), Packet::ChannelSuccess(ChannelSuccess { num: 40 })));
    }

    #[tokio::test]
    async fn unanswered_open_rejected() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let mut opens = peer.session.incoming_opens();
        peer.inject(ChannelOpen {
            num: 41,
            initial_window: 5000,
            max_packet: 1000,
            ty: ChannelOpenType::X11(X11 { origin: "10.0.0.1".into(), origin_port: 6010 }),
        })
        .await;
        drop(opens.try_recv().unwrap());
        let m = peer.recv().await;
        let Packet::ChannelOpenFailure(f) = m.packet() else { panic!() };
        assert_eq!(f.num, 41);
        assert_eq!(f.reason, ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED as u32);
    }

    #[tokio::test]
    async fn unknown_type_rejected() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let _opens = peer.session.incoming_opens();
        let mut b = vec![90];
        b.extend_from_slice(&(5u32).to_be_bytes());
        b.extend_from_slice(b"audio");
        b.extend_from_slice(&[0, 0, 0, 42, 0, 0, 0, 1, 0, 0, 0, 1]);
        peer.session.dispatch(&b).await.unwrap();
        let m = peer.recv().await;
        let Packet::ChannelOpenFailure(f) = m.packet() else { panic!() };
        assert_eq!(f.num, 42);
        assert_eq!(f.reason, ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE as u32);
    }
}
