//! The connection shared by channels.
//!
//! A [`Session`] issues channel numbers, keeps the registry of channel
//! handlers, owns the admission semaphore for session channels, and
//! dispatches inbound channel-layer messages. Outbound messages are
//! written as encoded payloads to an `mpsc` sink, for the transport to
//! encrypt and send.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, Semaphore};

use crate::*;
use channel::{locked, ChanDir, ChanNum, ChannelHandler};
use config::ConnectionInfo;
use event::{IncomingOpen, OpenInfo};
use packets::{ChannelOpen, Packet, ParseContext};
use sshnames::ChanFail;

pub struct Session {
    info: ConnectionInfo,
    out: mpsc::Sender<Vec<u8>>,
    connected: AtomicBool,
    next_num: AtomicU32,
    channels: Mutex<HashMap<ChanNum, Weak<dyn ChannelHandler>>>,
    semaphore: Arc<Semaphore>,
    opens: Mutex<Option<mpsc::UnboundedSender<IncomingOpen>>>,
}

impl Session {
    /// `out` receives each outbound channel-layer payload, starting with
    /// the message number byte.
    pub fn new(info: ConnectionInfo, out: mpsc::Sender<Vec<u8>>) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(info.max_sessions));
        Arc::new(Self {
            info,
            out,
            connected: AtomicBool::new(true),
            next_num: AtomicU32::new(0),
            channels: Mutex::new(HashMap::new()),
            semaphore,
            opens: Mutex::new(None),
        })
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Admission semaphore for `"session"` channels
    pub fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }

    /// Local channel numbers are never reused within a session
    pub(crate) fn next_channel_number(&self) -> ChanNum {
        ChanNum(self.next_num.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn register(&self, num: ChanNum, ch: Weak<dyn ChannelHandler>) {
        trace!("register channel {num}");
        locked(&self.channels).insert(num, ch);
    }

    pub(crate) fn unregister(&self, num: ChanNum) {
        if locked(&self.channels).remove(&num).is_some() {
            trace!("unregister channel {num}");
        }
    }

    /// Number of live registered channels
    pub fn channel_count(&self) -> usize {
        locked(&self.channels).values().filter(|w| w.strong_count() > 0).count()
    }

    fn handler(&self, num: ChanNum) -> Result<Arc<dyn ChannelHandler>> {
        locked(&self.channels)
            .get(&num)
            .and_then(|w| w.upgrade())
            .ok_or(error::BadChannel { num }.build())
    }

    /// Returns a stream of channels the peer asks to open.
    ///
    /// Only the most recent receiver is used. Without one, opens are
    /// rejected.
    pub fn incoming_opens(&self) -> mpsc::UnboundedReceiver<IncomingOpen> {
        let (tx, rx) = mpsc::unbounded_channel();
        *locked(&self.opens) = Some(tx);
        rx
    }

    /// Encodes and queues a message, waiting for space in the outbound queue.
    pub async fn send_message(&self, p: &Packet<'_>) -> Result<()> {
        if !self.is_connected() {
            return error::NotConnected.fail();
        }
        let buf = sshwire::write_ssh_vec(p)?;
        trace!("send {:?}", p.message_num());
        self.out.send(buf).await.map_err(|_| Error::SessionDisconnected)
    }

    /// Queues a message without waiting. Returns `false` if it
    /// couldn't be queued.
    pub fn try_send_message(&self, p: &Packet<'_>) -> bool {
        if !self.is_connected() {
            return false;
        }
        match sshwire::write_ssh_vec(p) {
            Ok(buf) => self.out.try_send(buf).is_ok(),
            Err(e) => {
                debug!("Couldn't encode {:?}: {e}", p.message_num());
                false
            }
        }
    }

    pub(crate) async fn send_open_failure(
        &self,
        num: u32,
        reason: ChanFail,
        desc: &str,
    ) -> Result<()> {
        let p = packets::ChannelOpenFailure {
            // ChannelOpen.num is the sender's number
            num,
            reason: reason as u32,
            desc: desc.into(),
            lang: "",
        };
        self.send_message(&p.into()).await
    }

    async fn dispatch_open(self: &Arc<Self>, p: &ChannelOpen<'_>) -> Result<()> {
        let info = match OpenInfo::from_packet(&p.ty) {
            Ok(i) => i,
            Err(u) => {
                debug!("Rejecting unknown channel type '{u}'");
                return self
                    .send_open_failure(p.num, ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE, "")
                    .await;
            }
        };

        let remote =
            ChanDir { num: p.num, max_packet: p.max_packet, window: p.initial_window };
        if let Err(e) = remote.check() {
            debug!("Rejecting channel open: {e}");
            return self
                .send_open_failure(p.num, ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED, "")
                .await;
        }
        let open = IncomingOpen::new(self.clone(), info, remote);
        trace!("incoming {open:?}");

        let tx = locked(&self.opens).clone();
        let open = match tx {
            Some(tx) => match tx.send(open) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(open)) => open,
            },
            None => open,
        };
        debug!("No handler for incoming channel, rejecting");
        open.reject(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED, "").await
    }

    /// Handles one inbound channel-layer payload.
    ///
    /// Errors from a channel's handlers are delivered to that channel
    /// and don't fail the dispatch. Messages for unknown channel numbers
    /// are ignored. Returns an error for undecodable payloads.
    pub async fn dispatch(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let p = sshwire::packet_from_bytes(payload, &ParseContext::default())?;
        trace!("dispatch {:?}", p.message_num());

        let num = match (&p, p.recipient()) {
            (Packet::ChannelOpen(o), _) => return self.dispatch_open(o).await,
            (_, Some(num)) => ChanNum(num),
            // Every other message has a recipient
            (_, None) => return Error::bug_msg("no recipient"),
        };

        let h = match self.handler(num) {
            Ok(h) => h,
            Err(e) => {
                warn!("Ignoring {:?}: {e}", p.message_num());
                return Ok(());
            }
        };

        let r = match p {
            Packet::ChannelOpenConfirmation(p) => h.on_open_confirmation(&p).await,
            Packet::ChannelOpenFailure(p) => h.on_open_failure(p.reason, p.desc.to_lossy()).await,
            Packet::ChannelWindowAdjust(p) => h.on_window_adjust(p.adjust).await,
            Packet::ChannelData(p) => h.on_data(p.data.0).await,
            Packet::ChannelDataExt(p) => h.on_extended_data(p.code, p.data.0).await,
            Packet::ChannelEof(_) => h.on_eof().await,
            Packet::ChannelClose(_) => h.on_close().await,
            Packet::ChannelRequest(p) => h.on_request(p.want_reply, &p.req).await,
            Packet::ChannelSuccess(_) => h.on_success().await,
            Packet::ChannelFailure(_) => h.on_failure().await,
            Packet::ChannelOpen(_) => Error::bug_msg("open handled earlier"),
        };

        if let Err(e) = r {
            h.on_exception(e).await;
        }
        Ok(())
    }

    /// Dispatches inbound payloads until `inbound` ends or a payload
    /// can't be decoded, then disconnects.
    pub async fn run(self: &Arc<Self>, mut inbound: mpsc::Receiver<Vec<u8>>) -> Result<()> {
        let mut r = Ok(());
        while let Some(payload) = inbound.recv().await {
            if let Err(e) = self.dispatch(&payload).await {
                warn!("Bad inbound message: {e}");
                r = Err(e);
                break;
            }
        }
        self.disconnect().await;
        r
    }

    /// The transport has gone. Every live channel is closed without
    /// further messages, and blocked operations return errors.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("session disconnected");
        self.semaphore.close();
        locked(&self.opens).take();

        let handlers: Vec<_> =
            locked(&self.channels).values().filter_map(|w| w.upgrade()).collect();
        for h in handlers {
            h.on_disconnected().await;
        }
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("connected", &self.is_connected())
            .field("next_num", &self.next_num)
            .finish_non_exhaustive()
    }
}
