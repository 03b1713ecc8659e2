//! `"session"` channels: exec, shell, pty and friends.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use heapless::Deque;
use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::*;
use channel::client::{OpenOutcome, OpenWaiter};
use channel::{locked, ChanState, ChannelCore, ChannelHandler};
use config::MAX_OUTSTANDING_REQS;
use event::{ExitSignal, Pty, ReqDetails};
use packets::{ChannelOpenConfirmation, ChannelOpenType, ChannelReqType, ChannelRequest, WinChange};

/// A `"session"` channel opened by the local side.
///
/// Opening holds one permit of the session's admission semaphore until
/// the channel closes.
pub struct ChannelSession {
    core: ChannelCore,
    open: OpenWaiter,
    /// Serialises `open()` campaigns
    open_lock: tokio::sync::Mutex<()>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    failed_attempts: AtomicU32,

    /// Held while a request is queued and sent, so replies
    /// pair with requests in order.
    request_lock: tokio::sync::Mutex<()>,
    // queue of requests sent with want_reply
    replies: Mutex<Deque<oneshot::Sender<bool>, MAX_OUTSTANDING_REQS>>,

    exit_status: Mutex<Option<u32>>,
    exit_signal: Mutex<Option<ExitSignal>>,
}

impl ChannelSession {
    pub fn new(session: &Arc<Session>) -> Arc<Self> {
        let ch = Arc::new(Self {
            core: ChannelCore::new_client(session),
            open: OpenWaiter::default(),
            open_lock: Default::default(),
            permit: Mutex::new(None),
            failed_attempts: AtomicU32::new(0),
            request_lock: Default::default(),
            replies: Mutex::new(Deque::new()),
            exit_status: Mutex::new(None),
            exit_signal: Mutex::new(None),
        });
        let w: Weak<dyn ChannelHandler> = Arc::downgrade(&ch) as _;
        session.register(ch.core.num(), w);
        ch
    }

    /// Opens the channel, retrying rejected opens up to
    /// [`ConnectionInfo::retry_attempts`](crate::config::ConnectionInfo::retry_attempts) times.
    ///
    /// Waits for an admission permit when the session has its maximum
    /// number of session channels.
    pub async fn open(&self) -> Result<()> {
        let _g = self.open_lock.lock().await;
        if !self.core.session().is_connected() {
            return error::NotConnected.fail();
        }
        let attempts = self.core.session().connection_info().retry_attempts;

        while !self.core.is_open() && self.failed_attempts.load(Ordering::SeqCst) < attempts {
            self.acquire_permit().await?;

            match self.open.open(&self.core, ChannelOpenType::Session).await {
                Ok(OpenOutcome::Confirmed) => (),
                Ok(OpenOutcome::Failed { .. }) => {
                    self.failed_attempts.fetch_add(1, Ordering::SeqCst);
                    self.release_permit();
                }
                Err(e) => {
                    self.release_permit();
                    return Err(e);
                }
            }
        }

        if self.core.is_open() {
            Ok(())
        } else {
            let attempts = self.failed_attempts.load(Ordering::SeqCst);
            error::ChannelOpenFailed { attempts }.fail()
        }
    }

    async fn acquire_permit(&self) -> Result<()> {
        if locked(&self.permit).is_some() {
            return Ok(());
        }
        let sem = self.core.session().semaphore();
        trace!("channel {} waiting for permit, {} available", self.core.num(), sem.available_permits());
        let p = sem.acquire_owned().await.map_err(|_| Error::SessionDisconnected)?;
        *locked(&self.permit) = Some(p);
        Ok(())
    }

    /// Releases the admission permit if held
    fn release_permit(&self) {
        if locked(&self.permit).take().is_some() {
            trace!("channel {} released permit", self.core.num());
        }
    }

    /// Number of rejected `SSH_MSG_CHANNEL_OPEN` attempts
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::SeqCst)
    }

    /// The remote command's exit status, once received
    pub fn exit_status(&self) -> Option<u32> {
        *locked(&self.exit_status)
    }

    pub fn exit_signal(&self) -> Option<ExitSignal> {
        locked(&self.exit_signal).clone()
    }

    /// Sends a request. Returns the peer's answer for want-reply requests,
    /// `true` otherwise.
    async fn request(&self, details: ReqDetails) -> Result<bool> {
        let want_reply = details.want_reply();

        let rx = {
            let _g = self.request_lock.lock().await;
            let num = self.core.remote_channel_number()?;
            if !matches!(self.core.state(), ChanState::Open(h) if !h.close_sent) {
                return Err(self.core.stopped_error());
            }
            let p = ChannelRequest { num, want_reply, req: details.req_type() };

            let rx = if want_reply {
                let (tx, rx) = oneshot::channel();
                locked(&self.replies).push_back(tx).map_err(|_| Error::TooManyRequests)?;
                Some(rx)
            } else {
                None
            };

            trace!("channel {} request {}", self.core.num(), details.name());
            if let Err(e) = self.core.send_request_packet(&p.into()).await {
                if want_reply {
                    locked(&self.replies).pop_back();
                }
                return Err(e);
            }
            rx
        };

        let Some(rx) = rx else {
            return Ok(true);
        };

        match rx.await {
            Ok(success) => Ok(success),
            // Dropped on close
            Err(_) if self.core.session().is_connected() => Ok(false),
            Err(_) => error::SessionDisconnected.fail(),
        }
    }

    pub async fn send_exec_request(&self, command: &str) -> Result<bool> {
        self.request(ReqDetails::Exec(command.into())).await
    }

    pub async fn send_shell_request(&self) -> Result<bool> {
        self.request(ReqDetails::Shell).await
    }

    pub async fn send_subsystem_request(&self, subsystem: &str) -> Result<bool> {
        self.request(ReqDetails::Subsystem(subsystem.into())).await
    }

    pub async fn send_pty_request(&self, pty: Pty) -> Result<bool> {
        self.request(ReqDetails::Pty(pty)).await
    }

    pub async fn send_env_request(&self, name: &str, value: &str) -> Result<bool> {
        self.request(ReqDetails::Env { name: name.into(), value: value.into() }).await
    }

    pub async fn send_x11_request(
        &self,
        single_connection: bool,
        protocol: &str,
        cookie: &str,
        screen: u32,
    ) -> Result<bool> {
        self.request(ReqDetails::X11 {
            single_connection,
            protocol: protocol.into(),
            cookie: cookie.into(),
            screen,
        })
        .await
    }

    /// RFC4335 break, `length_ms` in milliseconds
    pub async fn send_break_request(&self, length_ms: u32) -> Result<bool> {
        self.request(ReqDetails::Break(length_ms)).await
    }

    pub async fn send_eow_request(&self) -> Result<bool> {
        self.request(ReqDetails::Eow).await
    }

    pub async fn send_keepalive_request(&self) -> Result<bool> {
        self.request(ReqDetails::KeepAlive).await
    }

    pub async fn send_window_change_request(&self, win: WinChange) -> Result<bool> {
        self.request(ReqDetails::WinChange(win)).await
    }

    pub async fn send_signal_request(&self, sig: &str) -> Result<bool> {
        self.request(ReqDetails::Signal(sig.into())).await
    }

    pub async fn send_exit_status_request(&self, status: u32) -> Result<bool> {
        self.request(ReqDetails::ExitStatus(status)).await
    }

    pub async fn send_exit_signal_request(&self, sig: ExitSignal) -> Result<bool> {
        self.request(ReqDetails::ExitSignal(sig)).await
    }

    /// `xon-xoff`, whether the client may do flow control
    pub async fn send_local_flow_request(&self, client_can_do: bool) -> Result<bool> {
        self.request(ReqDetails::XonXoff(client_can_do)).await
    }

    pub async fn send_request_reply(&self, success: bool) -> Result<()> {
        self.core.send_request_reply(success).await
    }

    fn reply(&self, success: bool) {
        match locked(&self.replies).pop_front() {
            // Requester may have gone
            Some(tx) => {
                let _ = tx.send(success);
            }
            None => debug!("channel {} reply with no request outstanding", self.core.num()),
        }
    }

    /// Everything waiting on this channel sees it closed
    fn abandon(&self) {
        self.open.cancel(&self.core);
        locked(&self.replies).clear();
        self.release_permit();
    }
}

#[async_trait]
impl ChannelHandler for ChannelSession {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn on_open_confirmation(&self, p: &ChannelOpenConfirmation) -> Result<()> {
        self.open.confirm(&self.core, p)
    }

    async fn on_open_failure(&self, reason: u32, desc: String) -> Result<()> {
        self.open.fail(&self.core, reason, desc)
    }

    async fn on_request(&self, want_reply: bool, req: &ChannelReqType<'_>) -> Result<()> {
        match self.core.dispatch_request(want_reply, req).await? {
            Some(ReqDetails::ExitStatus(s)) => *locked(&self.exit_status) = Some(s),
            Some(ReqDetails::ExitSignal(s)) => *locked(&self.exit_signal) = Some(s),
            _ => (),
        }
        Ok(())
    }

    async fn on_success(&self) -> Result<()> {
        self.reply(true);
        Ok(())
    }

    async fn on_failure(&self) -> Result<()> {
        self.reply(false);
        Ok(())
    }

    async fn on_disconnected(&self) {
        self.core.on_disconnected();
        self.abandon();
    }

    async fn close(&self) -> Result<()> {
        let r = self.core.close().await;
        self.abandon();
        r
    }
}
