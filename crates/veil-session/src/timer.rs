//! Cancellable one-shot timers for the controller loop
//!
//! A timer fires by posting a message back into the controller's inbox.
//! Each schedule gets a fresh ticket; a message carrying an older ticket is
//! stale and must be ignored, which covers the race where the sleep already
//! completed but the message was not yet processed when the timer was
//! cancelled.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) struct OneShot {
    ticket: u64,
    handle: Option<JoinHandle<()>>,
}

impl OneShot {
    pub(crate) fn new() -> Self {
        Self { ticket: 0, handle: None }
    }

    /// (Re)arm the timer. Any previously scheduled fire is cancelled.
    pub(crate) fn schedule<M, F>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<M>, make: F)
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        self.cancel();
        let ticket = self.ticket;
        let tx = tx.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(make(ticket));
        }));
    }

    /// Disarm without firing
    pub(crate) fn cancel(&mut self) {
        self.ticket = self.ticket.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Consume a fire. False if `ticket` is stale.
    pub(crate) fn fire(&mut self, ticket: u64) -> bool {
        if ticket != self.ticket || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }

    #[cfg(test)]
    pub(crate) fn is_scheduled(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.cancel();
    }
}
