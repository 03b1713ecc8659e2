use tokio::sync::watch;

/// A listening forward that channels are bridged for.
///
/// [`stop()`](Self::stop) shuts the send direction of every bridged
/// socket, so their pumps wind down.
#[derive(Debug)]
pub struct ForwardedPort {
    closing: watch::Sender<bool>,
}

impl ForwardedPort {
    pub fn new() -> Self {
        let (closing, _) = watch::channel(false);
        Self { closing }
    }

    pub fn stop(&self) {
        self.closing.send_replace(true);
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    pub(crate) fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }
}

impl Default for ForwardedPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_notifies() {
        let port = ForwardedPort::new();
        let mut rx = port.closing();
        assert!(!port.is_closing());
        port.stop();
        assert!(port.is_closing());
        rx.wait_for(|c| *c).await.unwrap();
    }
}
