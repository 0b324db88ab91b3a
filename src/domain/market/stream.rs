use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::MarketDataError;
use crate::domain::market::candle::Candle;

/// Lazy consumer end of a merged live candle stream.
///
/// Internally the producing provider runs one task per symbol plus a watcher;
/// the tasks feed the bounded data and error channels and the watcher closes
/// both once every task has exited. That makes the sequence finite even when
/// the consumer never cancels: once all sources are gone, `next` observes the
/// closed channels and returns `None`.
///
/// The sequence is not restartable. Dropping the stream cancels the
/// underlying subscriptions, so a consumer that stops iterating tears the
/// producers down.
pub struct CandleStream {
    data_rx: mpsc::Receiver<Candle>,
    err_rx: mpsc::Receiver<MarketDataError>,
    cancel: CancellationToken,
    data_done: bool,
    err_done: bool,
}

impl CandleStream {
    pub fn new(
        data_rx: mpsc::Receiver<Candle>,
        err_rx: mpsc::Receiver<MarketDataError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            data_rx,
            err_rx,
            cancel,
            data_done: false,
            err_done: false,
        }
    }

    /// A stream that yields exactly one error and then ends. Used for
    /// subscription-time rejections (empty symbol list, unsupported
    /// interval) so that every failure mode is observable through the same
    /// iterator.
    pub fn from_error(err: MarketDataError) -> Self {
        let (_data_tx, data_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        // Capacity one and a single send: cannot fail.
        let _ = err_tx.try_send(err);
        Self::new(data_rx, err_rx, CancellationToken::new())
    }

    /// Next event: `Ok(candle)` for data, `Err(e)` for a non-fatal stream
    /// error, `None` once cancelled or all sources have terminated.
    pub async fn next(&mut self) -> Option<Result<Candle, MarketDataError>> {
        loop {
            // Checked before the select so that a cancellation requested by
            // the consumer between two calls wins over buffered data.
            if self.cancel.is_cancelled() {
                return None;
            }
            if self.data_done && self.err_done {
                return None;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                err = self.err_rx.recv(), if !self.err_done => match err {
                    Some(e) => return Some(Err(e)),
                    None => self.err_done = true,
                },
                candle = self.data_rx.recv(), if !self.data_done => match candle {
                    Some(c) => return Some(Ok(c)),
                    None => self.data_done = true,
                },
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CandleStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
