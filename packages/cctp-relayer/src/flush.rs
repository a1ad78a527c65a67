//! Periodic re-scan of a bounded window behind the chain tip
//!
//! Recovers events the live listener missed (dropped websocket, RPC gaps,
//! indexer lag). `last_flushed` never decreases and only advances once the
//! whole window has been handed to the scan workers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::listener::{enqueue_range, BlockSource, ScanJob};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Tip unreadable or node catching up; nothing advanced
    Skipped,
    /// Nothing new behind the lookback window
    UpToDate,
    Flushed { start: u64, end: u64 },
    /// Shutdown or a closed queue stopped the enqueue; nothing advanced
    Interrupted,
}

pub struct FlushScanner<S: BlockSource> {
    source: Arc<S>,
    lookback_period: u64,
    max_block_range: u64,
    flush_only: bool,
    last_flushed: Option<u64>,
}

impl<S: BlockSource> FlushScanner<S> {
    pub fn new(source: Arc<S>, lookback_period: u64, max_block_range: u64, flush_only: bool) -> Self {
        Self {
            source,
            lookback_period,
            max_block_range,
            flush_only,
            last_flushed: None,
        }
    }

    pub fn last_flushed(&self) -> Option<u64> {
        self.last_flushed
    }

    /// End of the window to flush for a given tip
    pub fn finish_block(&self, latest: u64) -> u64 {
        let finish = latest.saturating_sub(self.lookback_period);
        if self.flush_only {
            finish.saturating_sub(self.lookback_period)
        } else {
            finish
        }
    }

    pub async fn tick(&mut self, block_tx: &mpsc::Sender<ScanJob>, shutdown: &Shutdown) -> FlushOutcome {
        let chain = self.source.name();

        let latest = match self.source.latest_height().await {
            Ok(h) => h,
            Err(e) => {
                warn!(chain, error = %e, "Flush skipped: failed to read latest height");
                return FlushOutcome::Skipped;
            }
        };

        match self.source.is_catching_up().await {
            Ok(false) => {}
            Ok(true) => {
                debug!(chain, "Flush skipped: node is catching up");
                return FlushOutcome::Skipped;
            }
            Err(e) => {
                warn!(chain, error = %e, "Flush skipped: failed to read sync status");
                return FlushOutcome::Skipped;
            }
        }

        let lookback = self.lookback_period;
        let last = *self
            .last_flushed
            .get_or_insert_with(|| latest.saturating_sub(lookback.saturating_mul(2)));
        let finish = self.finish_block(latest);

        if last >= finish {
            debug!(chain, last_flushed = last, finish, "Flush up to date");
            return FlushOutcome::UpToDate;
        }

        info!(chain, start = last, end = finish, "Flushing block window");
        if !enqueue_range(block_tx, last, finish, self.max_block_range, shutdown).await {
            return FlushOutcome::Interrupted;
        }

        self.last_flushed = Some(finish);
        FlushOutcome::Flushed {
            start: last,
            end: finish,
        }
    }

    pub async fn run(mut self, interval: Duration, block_tx: mpsc::Sender<ScanJob>, shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            if self.tick(&block_tx, &shutdown).await == FlushOutcome::Interrupted {
                return;
            }
        }
    }
}
