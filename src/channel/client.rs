//! Open correlation for channels the local side opens.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::*;
use channel::{locked, ChannelCore};
use event::ChannelEvent;
use packets::{ChannelClose, ChannelOpenConfirmation, ChannelOpenType};

/// The peer's answer to a `SSH_MSG_CHANNEL_OPEN`
#[derive(Debug)]
pub(crate) enum OpenOutcome {
    Confirmed,
    Failed { reason: u32, desc: String },
}

/// Pairs `SSH_MSG_CHANNEL_OPEN_CONFIRMATION`/`FAILURE` with a pending open.
#[derive(Default)]
pub(crate) struct OpenWaiter {
    pending: Mutex<Option<oneshot::Sender<Result<OpenOutcome>>>>,
}

impl OpenWaiter {
    /// Sends `SSH_MSG_CHANNEL_OPEN` and waits for the answer.
    ///
    /// On failure the channel returns to unopened, so may be opened again.
    pub async fn open(&self, core: &ChannelCore, ty: ChannelOpenType<'_>) -> Result<OpenOutcome> {
        core.begin_open()?;
        let (tx, rx) = oneshot::channel();
        *locked(&self.pending) = Some(tx);

        let p = core.open_packet(ty);
        if let Err(e) = core.session().send_message(&p).await {
            self.cancel(core);
            return Err(e);
        }
        trace!("channel {} opening", core.num());

        match rx.await {
            Ok(o) => o,
            Err(_) => {
                self.cancel(core);
                if core.session().is_connected() {
                    error::ChannelClosed.fail()
                } else {
                    error::SessionDisconnected.fail()
                }
            }
        }
    }

    /// A confirmation that can't be used fails the open with
    /// [`Error::SSHProtoError`], and the peer's channel is closed.
    pub fn confirm(&self, core: &ChannelCore, p: &ChannelOpenConfirmation) -> Result<()> {
        let tx = locked(&self.pending).take().ok_or(Error::SSHProtoError)?;
        if let Err(e) = core.confirm(p) {
            warn!("channel {} bad open confirmation: {e}", core.num());
            core.open_failed();
            core.session().try_send_message(&ChannelClose { num: p.sender_num }.into());
            let _ = tx.send(error::SSHProto.fail());
            return Err(e);
        }
        core.raise(ChannelEvent::OpenConfirmed);
        // Receiver may have gone
        let _ = tx.send(Ok(OpenOutcome::Confirmed));
        Ok(())
    }

    /// `is_open` is left unchanged
    pub fn fail(&self, core: &ChannelCore, reason: u32, desc: String) -> Result<()> {
        let tx = locked(&self.pending).take().ok_or(Error::SSHProtoError)?;
        debug!("channel {} open failed, reason {reason} \"{desc}\"", core.num());
        core.open_failed();
        core.raise(ChannelEvent::OpenFailed { reason, desc: desc.clone() });
        let _ = tx.send(Ok(OpenOutcome::Failed { reason, desc }));
        Ok(())
    }

    /// Abandons a pending open, the waiter sees an error.
    pub fn cancel(&self, core: &ChannelCore) {
        if locked(&self.pending).take().is_some() {
            core.open_failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::client::*;
    use crate::config::ConnectionInfo;
    use crate::muxlog::init_test_log;
    use crate::packets::*;
    use crate::test::{Peer, TestChannel};

    #[tokio::test]
    async fn open_failure_leaves_unopened() {
        init_test_log();
        let mut peer = Peer::new(ConnectionInfo::default());
        let ch = TestChannel::new(&peer.session);
        let w = OpenWaiter::default();

        let (o, _) = tokio::join!(w.open(ch.core(), ChannelOpenType::Session), async {
            let m = peer.recv().await;
            let Packet::ChannelOpen(p) = m.packet() else { panic!() };
            assert!(matches!(p.ty, ChannelOpenType::Session));
            w.fail(ch.core(), 4, "busy".into()).unwrap();
        });
        assert!(matches!(o.unwrap(), OpenOutcome::Failed { reason: 4, .. }));
        assert!(!ch.core().is_open());

        let mut ev = ch.core().take_events().unwrap();
        assert!(matches!(ev.try_recv().unwrap(),
            ChannelEvent::OpenFailed { reason: 4, desc } if desc == "busy"));

        // stray answer
        assert!(w.fail(ch.core(), 4, "".into()).is_err());
    }
}
