//! Typed event streams returned by ledger watches

use crate::LedgerError;
use tokio::sync::mpsc;
use trade_types::CallContext;

/// Stream of ledger events of one kind
///
/// Errors raised after the watch was set up (lagging, a dropped connection to
/// the ledger) are delivered in-band; a closed stream yields
/// `LedgerError::SubscriptionClosed`.
pub struct EventStream<T> {
    rx: mpsc::Receiver<Result<T, LedgerError>>,
}

impl<T> EventStream<T> {
    pub fn new(rx: mpsc::Receiver<Result<T, LedgerError>>) -> Self {
        Self { rx }
    }

    /// Create a stream together with the sender feeding it
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<T, LedgerError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }

    /// Wait for the next event
    pub async fn next(&mut self) -> Result<T, LedgerError> {
        self.rx
            .recv()
            .await
            .unwrap_or(Err(LedgerError::SubscriptionClosed))
    }

    /// Wait for the next event, bounded by `cx`
    pub async fn next_in(&mut self, cx: &CallContext) -> Result<T, LedgerError> {
        cx.run(self.next()).await?
    }

    /// Wait for the first event accepted by `pick`, skipping the others
    pub async fn next_matching<F>(&mut self, cx: &CallContext, mut pick: F) -> Result<T, LedgerError>
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            let event = self.next_in(cx).await?;
            if pick(&event) {
                return Ok(event);
            }
        }
    }
}
