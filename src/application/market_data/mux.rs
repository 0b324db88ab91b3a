//! Multiplexer for per-symbol live subscriptions.
//!
//! Providers spawn one subscription task per symbol; every task forwards
//! finalized candles and errors into a pair of shared bounded channels
//! through a [`SubscriptionSink`]. A watcher task joins all subscriptions
//! and then drops the original senders, closing both channels, which is what
//! lets the consuming [`CandleStream`] terminate even when nothing was ever
//! connected and the consumer never cancels.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::MarketDataError;
use crate::domain::market::{Candle, CandleStream};

/// Shared output-channel capacity for candles across all symbols.
const DATA_CHANNEL_CAPACITY: usize = 100;

pub struct StreamMux {
    data_tx: mpsc::Sender<Candle>,
    err_tx: mpsc::Sender<MarketDataError>,
    data_rx: mpsc::Receiver<Candle>,
    err_rx: mpsc::Receiver<MarketDataError>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl StreamMux {
    /// `symbol_count` sizes the error channel (two slots per symbol, so a
    /// failing subscription can report without blocking the others).
    pub fn new(ctx: &CancellationToken, symbol_count: usize) -> Self {
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel((2 * symbol_count).max(2));

        Self {
            data_tx,
            err_tx,
            data_rx,
            err_rx,
            cancel: ctx.child_token(),
            handles: Vec::new(),
        }
    }

    /// Producer handle for one subscription task.
    pub fn sink(&self) -> SubscriptionSink {
        SubscriptionSink {
            data_tx: self.data_tx.clone(),
            err_tx: self.err_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn spawn<F>(&mut self, subscription: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(subscription));
    }

    /// Hand the consumer end over and start the watcher. After this call the
    /// channels close exactly when every spawned subscription has exited.
    pub fn into_stream(self) -> CandleStream {
        let StreamMux {
            data_tx,
            err_tx,
            data_rx,
            err_rx,
            cancel,
            handles,
        } = self;

        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            // Dropping the original senders closes both channels once the
            // last subscription's clones are gone.
            drop(data_tx);
            drop(err_tx);
        });

        CandleStream::new(data_rx, err_rx, cancel)
    }
}

/// Producer-side handle held by one subscription task.
#[derive(Clone)]
pub struct SubscriptionSink {
    data_tx: mpsc::Sender<Candle>,
    err_tx: mpsc::Sender<MarketDataError>,
    cancel: CancellationToken,
}

impl SubscriptionSink {
    /// Forward a finalized candle. Returns `false` once the stream is being
    /// torn down (cancelled, or the consumer dropped the stream); the
    /// subscription should then exit.
    pub async fn send_candle(&self, candle: Candle) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.data_tx.send(candle) => sent.is_ok(),
        }
    }

    pub async fn send_error(&self, err: MarketDataError) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.err_tx.send(err) => sent.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
