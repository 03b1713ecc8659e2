//! Channel state machine and flow control
//!
//! [`ChannelCore`] holds the state shared by every channel kind: identity,
//! windows, and the open/EOF/close sequence. Channel kinds implement
//! [`ChannelHandler`] so that the [`Session`] dispatcher can deliver
//! messages addressed to them.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::*;
use config::EVENT_QUEUE_LEN;
use event::{ChannelEvent, ReqDetails};
use packets::{ChannelOpenConfirmation, ChannelReqType, Packet};
use sshwire::BinString;

pub(crate) mod client;
pub(crate) mod server;
pub(crate) mod session;

pub use server::ServerChannel;
pub use session::ChannelSession;

/// A SSH protocol channel number
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ChanNum(pub u32);

impl core::fmt::Display for ChanNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-direction channel variables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChanDir {
    /// `u32` rather than `ChanNum` because it is in the peer's namespace
    pub num: u32,
    pub max_packet: u32,
    pub window: u32,
}

impl ChanDir {
    /// Nothing could ever be sent with a zero maximum packet.
    pub(crate) fn check(&self) -> Result<()> {
        if self.max_packet == 0 {
            debug!("peer channel {} has zero max packet", self.num);
            return error::SSHProto.fail();
        }
        Ok(())
    }
}

/// EOF and CLOSE progress of an open channel
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HalfClose {
    pub eof_sent: bool,
    pub eof_received: bool,
    pub close_sent: bool,
    pub close_received: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChanState {
    Unopened,
    /// Waiting on an open confirmation, or for a server channel,
    /// waiting to send one.
    Opening,
    Open(HalfClose),
    /// Terminal
    Closed { close_received: bool },
}

impl ChanState {
    fn begin_open(&mut self) -> Result<()> {
        match self {
            Self::Unopened => {
                *self = Self::Opening;
                Ok(())
            }
            Self::Closed { .. } => error::ChannelClosed.fail(),
            _ => error::AlreadyOpen.fail(),
        }
    }

    /// A rejected open may be retried
    fn open_failed(&mut self) {
        if matches!(self, Self::Opening) {
            *self = Self::Unopened
        }
    }

    fn confirm(&mut self) -> Result<()> {
        match self {
            Self::Opening => {
                *self = Self::Open(HalfClose::default());
                Ok(())
            }
            _ => {
                trace!("Bad channel state {self:?}");
                error::SSHProto.fail()
            }
        }
    }

    /// Moves to `Closed`. Returns whether the channel had been open, and
    /// if CLOSE was received from the peer.
    fn finish(&mut self) -> Option<bool> {
        match *self {
            Self::Open(h) => {
                *self = Self::Closed { close_received: h.close_received };
                Some(h.close_received)
            }
            Self::Unopened | Self::Opening => {
                *self = Self::Closed { close_received: false };
                None
            }
            Self::Closed { .. } => None,
        }
    }

    fn half(&mut self) -> Option<&mut HalfClose> {
        match self {
            Self::Open(h) => Some(h),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    /// Data may be sent
    fn can_send(&self) -> bool {
        matches!(self, Self::Open(h) if !h.eof_sent && !h.close_sent)
    }
}

/// Locks a std `Mutex`, carrying on past poisoning.
///
/// Guards are never held over an `.await`.
pub(crate) fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct Windows {
    /// Bytes the peer may still send us
    local: u32,
    /// Populated once the channel is open
    remote: Option<ChanDir>,
}

/// State and operations common to all channel kinds.
pub struct ChannelCore {
    session: Arc<Session>,
    num: ChanNum,
    state: Mutex<ChanState>,
    windows: Mutex<Windows>,
    /// Set when the remote window grows or the channel stops
    window_notify: Notify,
    /// Set when the peer's CLOSE arrives
    closed_notify: Notify,
    /// Serialises close sequences
    close_lock: tokio::sync::Mutex<()>,
    /// Held from a state check until its message is queued, so nothing
    /// is queued after EOF or CLOSE
    send_lock: tokio::sync::Mutex<()>,

    initial_window: u32,
    local_packet: u32,

    events: mpsc::Sender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
}

impl ChannelCore {
    fn new(session: &Arc<Session>, state: ChanState, remote: Option<ChanDir>) -> Self {
        let info = session.connection_info();
        let (events, rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let num = session.next_channel_number();
        trace!("new channel {num}");
        Self {
            session: session.clone(),
            num,
            state: Mutex::new(state),
            windows: Mutex::new(Windows { local: info.initial_window_size, remote }),
            window_notify: Notify::new(),
            closed_notify: Notify::new(),
            close_lock: tokio::sync::Mutex::new(()),
            send_lock: tokio::sync::Mutex::new(()),
            initial_window: info.initial_window_size,
            local_packet: info.local_packet_size(),
            events,
            events_rx: Mutex::new(Some(rx)),
        }
    }

    /// A channel the local side will open
    pub(crate) fn new_client(session: &Arc<Session>) -> Self {
        Self::new(session, ChanState::Unopened, None)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Local channel number
    pub fn num(&self) -> ChanNum {
        self.num
    }

    pub fn state(&self) -> ChanState {
        *locked(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Returns the event stream for this channel. Only the first call
    /// returns `Some`.
    ///
    /// Data received before this is called is discarded. Once taken,
    /// data events wait for room in the queue, holding up the session
    /// dispatcher, so the receiver must be read.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ChannelEvent>> {
        locked(&self.events_rx).take()
    }

    fn events_taken(&self) -> bool {
        locked(&self.events_rx).is_none()
    }

    /// Queues a control event. Dropped if the queue is full.
    pub(crate) fn raise(&self, ev: ChannelEvent) {
        if let Err(mpsc::error::TrySendError::Full(ev)) = self.events.try_send(ev) {
            debug!("channel {} event queue full, dropping {ev:?}", self.num);
        }
    }

    /// Queues a data event, waiting for the application to make room.
    pub(crate) async fn raise_data(&self, ev: ChannelEvent) {
        if !self.events_taken() {
            trace!("channel {} has no event reader, discarding data", self.num);
            return;
        }
        // Receiver may have gone
        let _ = self.events.send(ev).await;
    }

    fn remote(&self) -> Result<ChanDir> {
        locked(&self.windows).remote.ok_or(Error::NotOpen)
    }

    /// Remote channel number, fails if the channel isn't confirmed yet
    ///
    /// Returned as a plain `u32` since it is a different namespace than `ChanNum`.
    /// This is the channel number included in most sent packets.
    pub fn remote_channel_number(&self) -> Result<u32> {
        Ok(self.remote()?.num)
    }

    pub fn remote_packet_size(&self) -> Result<u32> {
        Ok(self.remote()?.max_packet)
    }

    pub fn remote_window_size(&self) -> Result<u32> {
        Ok(self.remote()?.window)
    }

    pub fn local_window_size(&self) -> u32 {
        locked(&self.windows).local
    }

    pub fn local_packet_size(&self) -> u32 {
        self.local_packet
    }

    pub fn initial_window_size(&self) -> u32 {
        self.initial_window
    }

    pub(crate) fn begin_open(&self) -> Result<()> {
        locked(&self.state).begin_open()
    }

    pub(crate) fn open_failed(&self) {
        locked(&self.state).open_failed()
    }

    /// Records the peer's parameters from an open confirmation
    pub(crate) fn confirm(&self, p: &ChannelOpenConfirmation) -> Result<()> {
        let remote = ChanDir {
            num: p.sender_num,
            max_packet: p.max_packet,
            window: p.initial_window,
        };
        remote.check()?;
        locked(&self.state).confirm()?;
        let mut w = locked(&self.windows);
        debug_assert!(w.remote.is_none());
        w.remote = Some(remote);
        debug!("channel {} open, remote {}", self.num, p.sender_num);
        Ok(())
    }

    pub(crate) fn open_packet<'a>(&self, ty: packets::ChannelOpenType<'a>) -> Packet<'a> {
        packets::ChannelOpen {
            num: self.num.0,
            initial_window: self.initial_window,
            max_packet: self.local_packet,
            ty,
        }
        .into()
    }

    /// Sends `data` as `SSH_MSG_CHANNEL_DATA`, waiting for window space
    /// as required.
    ///
    /// Does nothing if the channel isn't open, or EOF has been sent.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.send_inner(None, data).await
    }

    /// Sends `SSH_MSG_CHANNEL_EXTENDED_DATA`, for example
    /// [`SSH_EXTENDED_DATA_STDERR`](sshnames::SSH_EXTENDED_DATA_STDERR).
    pub async fn send_extended_data(&self, code: u32, data: &[u8]) -> Result<()> {
        self.send_inner(Some(code), data).await
    }

    async fn send_inner(&self, code: Option<u32>, data: &[u8]) -> Result<()> {
        if !locked(&self.state).can_send() {
            trace!("channel {} not open, dropping {} bytes", self.num, data.len());
            return Ok(());
        }

        let mut rest = data;
        while !rest.is_empty() {
            let (num, len) = self.reserve_window(rest.len()).await?;
            let (d, r) = rest.split_at(len);
            rest = r;
            let data = BinString(d);
            let p: Packet = match code {
                None => packets::ChannelData { num, data }.into(),
                Some(code) => packets::ChannelDataExt { num, code, data }.into(),
            };
            if !self.send_checked(&p, |h| !h.eof_sent && !h.close_sent).await? {
                // EOF or CLOSE was queued while waiting for window
                return Err(self.stopped_error());
            }
        }
        Ok(())
    }

    /// Queues `p` if the channel is open and `check` passes. `check` may
    /// also record the message in the channel's progress.
    ///
    /// Returns whether `p` was queued.
    async fn send_checked(
        &self,
        p: &Packet<'_>,
        check: impl FnOnce(&mut HalfClose) -> bool,
    ) -> Result<bool> {
        let _g = self.send_lock.lock().await;
        let ok = locked(&self.state).half().map(check).unwrap_or(false);
        if ok {
            self.session.send_message(p).await?;
        }
        Ok(ok)
    }

    /// Queues a request or request reply. Fails once CLOSE has been sent.
    pub(crate) async fn send_request_packet(&self, p: &Packet<'_>) -> Result<()> {
        if self.send_checked(p, |h| !h.close_sent).await? {
            Ok(())
        } else {
            Err(self.stopped_error())
        }
    }

    /// The error for an operation on a channel that has stopped
    pub(crate) fn stopped_error(&self) -> Error {
        if self.session.is_connected() {
            error::ChannelClosed.build()
        } else {
            error::SessionDisconnected.build()
        }
    }

    /// Waits until some of the remote window is available, and takes
    /// up to `want` bytes of it.
    ///
    /// Returns the remote channel number and the length taken.
    async fn reserve_window(&self, want: usize) -> Result<(u32, usize)> {
        loop {
            // Registered before the window is checked so a concurrent
            // adjustment isn't missed.
            let mut notified = pin!(self.window_notify.notified());
            notified.as_mut().enable();

            if !locked(&self.state).can_send() {
                return Err(self.stopped_error());
            }

            {
                let mut w = locked(&self.windows);
                let r = w.remote.as_mut().trap()?;
                let len = want.min(r.max_packet as usize).min(r.window as usize);
                if len > 0 {
                    // len is no larger than window, a u32
                    r.window -= len as u32;
                    return Ok((r.num, len));
                }
                trace!("channel {} waiting for window", self.num);
            }

            notified.await;
        }
    }

    /// Accounts for received data against the local window, sending a
    /// window adjustment when it runs low.
    ///
    /// Returns `false` if the data should be discarded.
    pub(crate) async fn take_input(&self, len: usize) -> Result<bool> {
        if !matches!(self.state(), ChanState::Open(h) if !h.close_sent) {
            debug!("Discarding {len} bytes for channel {}, not open", self.num);
            return Ok(false);
        }

        let adjust = {
            let mut w = locked(&self.windows);
            let len = u32::try_from(len).unwrap_or(u32::MAX);
            if len > w.local {
                warn!("Peer exceeded window for channel {}", self.num);
            }
            w.local = w.local.saturating_sub(len);
            if w.local < self.local_packet {
                let adjust = self.initial_window.saturating_sub(w.local);
                w.local = self.initial_window;
                let num = w.remote.as_ref().trap()?.num;
                Some(packets::ChannelWindowAdjust { num, adjust })
            } else {
                None
            }
        };

        if let Some(a) = adjust {
            trace!("channel {} window adjust {}", self.num, a.adjust);
            self.send_checked(&a.into(), |h| !h.close_sent).await?;
        }
        Ok(true)
    }

    pub(crate) fn on_window_adjust(&self, adjust: u32) -> Result<()> {
        {
            let mut w = locked(&self.windows);
            let r = w.remote.as_mut().ok_or(Error::PacketWrong)?;
            r.window = r.window.saturating_add(adjust);
        }
        self.window_notify.notify_waiters();
        Ok(())
    }

    /// Sends `SSH_MSG_CHANNEL_EOF`
    pub async fn send_eof(&self) -> Result<()> {
        if !self.is_open() {
            return error::NotOpen.fail();
        }
        let num = self.remote_channel_number()?;
        self.send_checked(&packets::ChannelEof { num }.into(), |h| {
            let send = !h.eof_sent && !h.close_sent;
            h.eof_sent = true;
            send
        })
        .await?;
        Ok(())
    }

    pub(crate) fn on_eof(&self) {
        if let Some(h) = locked(&self.state).half() {
            h.eof_received = true;
        } else {
            debug!("EOF for channel {} not open", self.num);
            return;
        }
        self.raise(ChannelEvent::Eof)
    }

    /// Records the peer's CLOSE, waking any close sequence waiting on it.
    pub(crate) fn on_close_received(&self) {
        if let Some(h) = locked(&self.state).half() {
            h.close_received = true;
        } else {
            trace!("late close for channel {}", self.num);
        }
        self.closed_notify.notify_waiters();
    }

    fn close_received(&self) -> bool {
        matches!(self.state(), ChanState::Open(h) if h.close_received)
    }

    /// Runs the close sequence: EOF if none was exchanged, CLOSE, then a
    /// bounded wait for the peer's CLOSE.
    ///
    /// Safe to call concurrently or repeatedly, later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        let _g = self.close_lock.lock().await;

        if self.session.is_connected() && self.is_open() {
            let num = self.remote_channel_number()?;

            let eof = packets::ChannelEof { num }.into();
            let r = self
                .send_checked(&eof, |h| {
                    let send = !h.eof_sent && !h.eof_received && !h.close_received && !h.close_sent;
                    h.eof_sent |= send;
                    send
                })
                .await;
            if let Err(e) = r {
                debug!("channel {} EOF not sent: {e}", self.num);
            }

            let close = packets::ChannelClose { num }.into();
            let r = self
                .send_checked(&close, |h| {
                    let send = !h.close_sent;
                    h.close_sent = true;
                    send
                })
                .await;
            match r {
                Ok(true) if !self.close_received() => self.wait_peer_close().await,
                Ok(_) => (),
                Err(e) => debug!("channel {} CLOSE not sent: {e}", self.num),
            }
        }

        let fin = locked(&self.state).finish();
        self.window_notify.notify_waiters();
        if let Some(close_received) = fin {
            debug!("channel {} closed", self.num);
            if close_received {
                self.raise(ChannelEvent::Closed);
            }
        }
        Ok(())
    }

    async fn wait_peer_close(&self) {
        let wait = async {
            loop {
                let mut notified = pin!(self.closed_notify.notified());
                notified.as_mut().enable();
                if self.close_received() || !self.is_open() {
                    break;
                }
                notified.await;
            }
        };

        let t = self.session.connection_info().channel_close_timeout;
        if tokio::time::timeout(t, wait).await.is_err() {
            warn!("Timed out waiting for channel {} close after {t:?}", self.num);
        }
    }

    /// The transport is gone. No further messages are sent.
    pub(crate) fn on_disconnected(&self) {
        let was_open = {
            let mut st = locked(&self.state);
            let was_open = st.is_open();
            *st = ChanState::Closed { close_received: false };
            was_open
        };
        trace!("channel {} disconnected, was open {was_open}", self.num);
        self.window_notify.notify_waiters();
        self.closed_notify.notify_waiters();
        self.raise(ChannelEvent::Disconnected);
    }

    /// Answers a want-reply request from the peer
    pub async fn send_request_reply(&self, success: bool) -> Result<()> {
        let num = self.remote_channel_number()?;
        let p: Packet = if success {
            packets::ChannelSuccess { num }.into()
        } else {
            packets::ChannelFailure { num }.into()
        };
        self.send_request_packet(&p).await
    }

    /// Default handling of a request from the peer: known requests become
    /// events, unknown ones are refused.
    pub(crate) async fn dispatch_request(
        &self,
        want_reply: bool,
        req: &ChannelReqType<'_>,
    ) -> Result<Option<ReqDetails>> {
        match ReqDetails::try_from(req) {
            Ok(details) => {
                trace!("channel {} request {}", self.num, details.name());
                self.raise(ChannelEvent::Request { want_reply, details: details.clone() });
                Ok(Some(details))
            }
            Err(e) => {
                warn!("channel {}: {e}", self.num);
                if want_reply {
                    self.send_request_reply(false).await?;
                }
                Err(e)
            }
        }
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        self.session.unregister(self.num);

        // Best effort, a dropped channel can't wait for the peer
        let st = *locked(&self.state);
        let remote = locked(&self.windows).remote;
        let Some(remote) = remote else {
            return;
        };
        match st {
            ChanState::Open(h) if !h.close_sent => {
                trace!("channel {} dropped while open", self.num);
                if !h.eof_sent && !h.eof_received && !h.close_received {
                    self.session.try_send_message(&packets::ChannelEof { num: remote.num }.into());
                }
                self.session.try_send_message(&packets::ChannelClose { num: remote.num }.into());
            }
            ChanState::Opening => {
                // A server channel never answered
                let p = packets::ChannelOpenFailure {
                    num: remote.num,
                    reason: sshnames::ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED as u32,
                    desc: "".into(),
                    lang: "",
                };
                self.session.try_send_message(&p.into());
            }
            _ => (),
        }
    }
}

/// Receives the messages a [`Session`] dispatches to a channel.
///
/// Errors returned by the `on_*` methods are caught by the dispatcher and
/// passed to [`on_exception()`](Self::on_exception).
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    fn core(&self) -> &ChannelCore;

    async fn on_open_confirmation(&self, _p: &ChannelOpenConfirmation) -> Result<()> {
        trace!("unexpected open confirmation for {}", self.core().num());
        error::SSHProto.fail()
    }

    async fn on_open_failure(&self, _reason: u32, _desc: String) -> Result<()> {
        trace!("unexpected open failure for {}", self.core().num());
        error::SSHProto.fail()
    }

    async fn on_window_adjust(&self, adjust: u32) -> Result<()> {
        self.core().on_window_adjust(adjust)
    }

    async fn on_data(&self, data: &[u8]) -> Result<()> {
        if self.core().take_input(data.len()).await? {
            self.core().raise_data(ChannelEvent::Data(data.to_vec())).await;
        }
        Ok(())
    }

    async fn on_extended_data(&self, code: u32, data: &[u8]) -> Result<()> {
        if self.core().take_input(data.len()).await? {
            self.core().raise_data(ChannelEvent::ExtendedData { code, data: data.to_vec() }).await;
        }
        Ok(())
    }

    async fn on_eof(&self) -> Result<()> {
        self.core().on_eof();
        Ok(())
    }

    /// The peer sent CLOSE. Completes the close sequence.
    async fn on_close(&self) -> Result<()> {
        self.core().on_close_received();
        self.close().await
    }

    async fn on_request(&self, want_reply: bool, req: &ChannelReqType<'_>) -> Result<()> {
        self.core().dispatch_request(want_reply, req).await.map(|_| ())
    }

    async fn on_success(&self) -> Result<()> {
        debug!("Ignoring channel success for {}", self.core().num());
        Ok(())
    }

    async fn on_failure(&self) -> Result<()> {
        debug!("Ignoring channel failure for {}", self.core().num());
        Ok(())
    }

    async fn on_disconnected(&self) {
        self.core().on_disconnected()
    }

    async fn on_exception(&self, e: Error) {
        debug!("channel {} error: {e}", self.core().num());
        self.core().raise(ChannelEvent::Exception(e))
    }

    /// Closes the channel, see [`ChannelCore::close()`]
    async fn close(&self) -> Result<()> {
        self.core().close().await
    }
}
