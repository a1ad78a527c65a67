//! Source-chain listener
//!
//! A listener turns a chain's `MessageSent` events into [`TxState`]s on the
//! processing queue. Block ranges are scanned by a pool of workers sharing one
//! bounded job queue; the historical backfill, the polling tail and the flush
//! scanner all feed that queue. A failed range is re-enqueued after a backoff
//! and never skipped.

use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::{FutureExt, Stream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ListenerSettings;
use crate::flush::FlushScanner;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::shutdown::Shutdown;
use crate::types::{MessageState, TxState};

/// Inclusive block range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Split `[start, end]` into ranges of at most `max` blocks
    pub fn chunks(start: u64, end: u64, max: u64) -> Vec<BlockRange> {
        let max = max.max(1);
        let mut ranges = Vec::new();
        let mut from = start;
        while from <= end {
            let to = from.saturating_add(max - 1).min(end);
            ranges.push(BlockRange::new(from, to));
            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        ranges
    }
}

/// A scan job, with the number of failed attempts so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanJob {
    pub range: BlockRange,
    pub attempt: u32,
}

/// Read access to a chain's CCTP events
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn latest_height(&self) -> Result<u64>;

    /// Whether the node is still syncing; flush ticks are skipped while it is
    async fn is_catching_up(&self) -> Result<bool> {
        Ok(false)
    }

    /// Every well-formed MessageSent event in `range`, in emission order.
    /// Malformed messages are logged and left out.
    async fn fetch_messages(&self, range: BlockRange) -> Result<Vec<MessageState>>;
}

/// Latest known chain height, written by the height tracker
#[derive(Clone, Debug, Default)]
pub struct SharedHeight(Arc<Mutex<u64>>);

impl SharedHeight {
    pub fn get(&self) -> u64 {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, height: u64) {
        let mut current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *current = height;
    }
}

/// Groups consecutive messages by source transaction
#[derive(Debug, Default)]
pub struct TxBatcher {
    current: Option<TxState>,
}

impl TxBatcher {
    /// Add a message. Returns the previous transaction once a message from a
    /// different transaction arrives.
    pub fn push(&mut self, msg: MessageState) -> Option<TxState> {
        match self.current.as_mut() {
            Some(tx) if tx.tx_hash == msg.source_tx_hash => {
                tx.msgs.push(msg);
                None
            }
            _ => {
                let hash = msg.source_tx_hash.clone();
                self.current.replace(TxState::new(hash, vec![msg]))
            }
        }
    }

    pub fn flush(&mut self) -> Option<TxState> {
        self.current.take()
    }
}

/// Group an ordered message list into transactions
pub fn group_by_tx(msgs: Vec<MessageState>) -> Vec<TxState> {
    let mut batcher = TxBatcher::default();
    let mut txs: Vec<TxState> = msgs.into_iter().filter_map(|m| batcher.push(m)).collect();
    txs.extend(batcher.flush());
    txs
}

/// First block of the historical backfill
pub fn starting_block(configured: u64, lookback_period: u64, tip: u64) -> u64 {
    if configured == 0 {
        tip
    } else {
        configured.saturating_sub(lookback_period)
    }
}

/// Enqueue `[start, end]` as chunked scan jobs. Returns false if shutdown or a
/// closed queue interrupted the enqueue.
pub async fn enqueue_range(
    block_tx: &mpsc::Sender<ScanJob>,
    start: u64,
    end: u64,
    max_block_range: u64,
    shutdown: &Shutdown,
) -> bool {
    for range in BlockRange::chunks(start, end, max_block_range) {
        let job = ScanJob { range, attempt: 0 };
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            sent = block_tx.send(job) => {
                if sent.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

/// Push a transaction onto the processing queue without blocking past shutdown
pub async fn deliver(
    chain: &str,
    queue: &mpsc::Sender<TxState>,
    tx: TxState,
    shutdown: &Shutdown,
) -> bool {
    let count = tx.msgs.len();
    let tx_hash = tx.tx_hash.clone();
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = queue.send(tx) => match sent {
            Ok(()) => {
                for _ in 0..count {
                    metrics::record_message_observed(chain);
                }
                metrics::set_queue_depth(queue.max_capacity() - queue.capacity());
                debug!(chain, tx_hash = %tx_hash, messages = count, "Enqueued source transaction");
                true
            }
            Err(_) => false,
        },
    }
}

/// Scan worker: drains block jobs and forwards grouped messages
async fn run_scan_worker<S: BlockSource>(
    id: usize,
    source: Arc<S>,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<ScanJob>>>,
    requeue: mpsc::Sender<ScanJob>,
    queue: mpsc::Sender<TxState>,
    retry: RetryConfig,
    shutdown: Shutdown,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            debug!(chain = source.name(), worker = id, "Scan worker stopping");
            return;
        };

        match source.fetch_messages(job.range).await {
            Ok(msgs) => {
                for tx in group_by_tx(msgs) {
                    if !deliver(source.name(), &queue, tx, &shutdown).await {
                        return;
                    }
                }
            }
            Err(e) => {
                let backoff = retry.backoff_for_attempt(job.attempt);
                warn!(
                    chain = source.name(),
                    start = job.range.start,
                    end = job.range.end,
                    attempt = job.attempt + 1,
                    ?backoff,
                    error = %e,
                    "Failed to fetch block range, re-enqueueing"
                );
                let retry_job = ScanJob {
                    range: job.range,
                    attempt: job.attempt.saturating_add(1),
                };
                let requeue = requeue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = async {
                            tokio::time::sleep(backoff).await;
                            let _ = requeue.send(retry_job).await;
                        } => {}
                    }
                });
            }
        }
    }
}

/// Drive a live event stream onto the processing queue.
///
/// Items that are already ready are drained together so a transaction's
/// events stay grouped; the pending group is flushed when nothing more is
/// ready. The stream ending or yielding an error is fatal.
pub async fn consume_stream<St>(
    chain: &str,
    stream: St,
    queue: mpsc::Sender<TxState>,
    shutdown: Shutdown,
) -> Result<()>
where
    St: Stream<Item = Result<MessageState>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut batcher = TxBatcher::default();

    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            item = stream.next() => item,
        };

        let mut next = Some(first);
        while let Some(item) = next.take() {
            match item {
                Some(Ok(msg)) => {
                    if let Some(done) = batcher.push(msg) {
                        if !deliver(chain, &queue, done, &shutdown).await {
                            return Ok(());
                        }
                    }
                }
                Some(Err(e)) => {
                    if let Some(done) = batcher.flush() {
                        deliver(chain, &queue, done, &shutdown).await;
                    }
                    return Err(e.wrap_err(format!("{} event subscription failed", chain)));
                }
                None => {
                    if let Some(done) = batcher.flush() {
                        deliver(chain, &queue, done, &shutdown).await;
                    }
                    return Err(eyre!("{} event subscription ended", chain));
                }
            }
            next = stream.next().now_or_never();
        }

        if let Some(done) = batcher.flush() {
            if !deliver(chain, &queue, done, &shutdown).await {
                return Ok(());
            }
        }
    }
}

/// Periodically refresh the chain tip and export it
pub async fn track_height<S: BlockSource>(
    source: Arc<S>,
    domain: u32,
    height: SharedHeight,
    interval: Duration,
    shutdown: Shutdown,
) {
    loop {
        match source.latest_height().await {
            Ok(h) => {
                height.set(h);
                metrics::set_latest_height(source.name(), domain, h);
            }
            Err(e) => {
                warn!(chain = source.name(), error = %e, "Failed to refresh latest height");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Generic listener over any [`BlockSource`]
pub struct Listener<S: BlockSource> {
    source: Arc<S>,
    settings: ListenerSettings,
    height: SharedHeight,
    flush_interval: Duration,
    flush_only: bool,
    retry: RetryConfig,
}

impl<S: BlockSource> Listener<S> {
    pub fn new(
        source: Arc<S>,
        settings: ListenerSettings,
        height: SharedHeight,
        flush_interval_secs: u64,
        flush_only: bool,
    ) -> Self {
        Self {
            source,
            settings,
            height,
            flush_interval: Duration::from_secs(flush_interval_secs),
            flush_only,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Tracked tip, or a direct query while the tracker has not reported yet
    async fn tip(&self) -> Result<u64> {
        let tracked = self.height.get();
        if tracked > 0 {
            return Ok(tracked);
        }
        self.source.latest_height().await
    }

    /// Run until shutdown. Returns an error if the tail cannot make progress.
    pub async fn run(self, queue: mpsc::Sender<TxState>, shutdown: Shutdown) -> Result<()> {
        let chain = self.source.name().to_string();
        let (block_tx, block_rx) = mpsc::channel::<ScanJob>(self.settings.block_queue_size);
        let block_rx = Arc::new(tokio::sync::Mutex::new(block_rx));

        let mut tasks = JoinSet::new();
        for id in 0..self.settings.workers {
            tasks.spawn(run_scan_worker(
                id,
                self.source.clone(),
                block_rx.clone(),
                block_tx.clone(),
                queue.clone(),
                self.retry.clone(),
                shutdown.clone(),
            ));
        }

        if !self.flush_interval.is_zero() {
            let scanner = FlushScanner::new(
                self.source.clone(),
                self.settings.lookback_period,
                self.settings.max_block_range,
                self.flush_only,
            );
            tasks.spawn(scanner.run(self.flush_interval, block_tx.clone(), shutdown.clone()));
        }

        info!(
            chain = %chain,
            workers = self.settings.workers,
            flush_only = self.flush_only,
            "Listener started"
        );

        let result = if self.flush_only {
            shutdown.cancelled().await;
            Ok(())
        } else {
            self.tail(&block_tx, &shutdown).await
        };

        if result.is_err() {
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}
        info!(chain = %chain, "Listener stopped");
        result
    }

    async fn tail(&self, block_tx: &mpsc::Sender<ScanJob>, shutdown: &Shutdown) -> Result<()> {
        let chain = self.source.name();
        let tip = self.tip().await?;
        let start = starting_block(self.settings.start_block, self.settings.lookback_period, tip);

        info!(chain, start, tip, "Enqueueing historical backfill");
        if !enqueue_range(block_tx, start, tip, self.settings.max_block_range, shutdown).await {
            return Ok(());
        }

        let mut next_block = tip + 1;
        let poll_interval = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let tip = match self.tip().await {
                Ok(t) => {
                    consecutive_failures = 0;
                    t
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(chain, error = %e, consecutive_failures, "Failed to read chain tip");
                    if consecutive_failures >= MAX_TIP_FAILURES {
                        error!(chain, "Chain tip unavailable, stopping listener");
                        return Err(e.wrap_err(format!("{} tip unavailable", chain)));
                    }
                    continue;
                }
            };

            if tip < next_block {
                continue;
            }

            if !enqueue_range(block_tx, next_block, tip, self.settings.max_block_range, shutdown)
                .await
            {
                return Ok(());
            }
            next_block = tip + 1;
        }
    }
}

/// Consecutive tip read failures before the tail gives up
const MAX_TIP_FAILURES: u32 = 30;

#[cfg(test)]
pub(crate) mod test_source {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory chain: messages keyed by height
    #[derive(Default)]
    pub struct MemorySource {
        pub height: Mutex<u64>,
        pub catching_up: Mutex<bool>,
        pub blocks: Mutex<BTreeMap<u64, Vec<MessageState>>>,
        pub fetched: Mutex<Vec<BlockRange>>,
        /// Number of fetches to fail before succeeding
        pub failures: AtomicU32,
        pub fail_height: Mutex<bool>,
    }

    #[async_trait]
    impl BlockSource for MemorySource {
        fn name(&self) -> &str {
            "memory"
        }

        async fn latest_height(&self) -> Result<u64> {
            if *self.fail_height.lock().unwrap() {
                return Err(eyre!("rpc unavailable"));
            }
            Ok(*self.height.lock().unwrap())
        }

        async fn is_catching_up(&self) -> Result<bool> {
            Ok(*self.catching_up.lock().unwrap())
        }

        async fn fetch_messages(&self, range: BlockRange) -> Result<Vec<MessageState>> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(eyre!("connection reset"));
            }
            self.fetched.lock().unwrap().push(range);
            let blocks = self.blocks.lock().unwrap();
            Ok(blocks
                .range(range.start..=range.end)
                .flat_map(|(_, msgs)| msgs.clone())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_source::MemorySource;
    use super::*;
    use crate::types::test_utils::burn_message_bytes;
    use std::sync::atomic::Ordering;

    fn msg(tx: &str, nonce: u64) -> MessageState {
        MessageState::from_message_bytes(tx, &burn_message_bytes(0, 4, nonce)).unwrap()
    }

    fn settings() -> ListenerSettings {
        ListenerSettings {
            start_block: 0,
            lookback_period: 2,
            workers: 2,
            max_block_range: 10,
            block_queue_size: 100,
            poll_interval_secs: 1,
        }
    }

    #[test]
    fn test_chunks() {
        assert_eq!(
            BlockRange::chunks(0, 25, 10),
            vec![
                BlockRange::new(0, 9),
                BlockRange::new(10, 19),
                BlockRange::new(20, 25)
            ]
        );
        assert_eq!(BlockRange::chunks(5, 5, 10), vec![BlockRange::new(5, 5)]);
        assert!(BlockRange::chunks(6, 5, 10).is_empty());
    }

    #[test]
    fn test_starting_block() {
        assert_eq!(starting_block(0, 5, 100), 100);
        assert_eq!(starting_block(50, 5, 100), 45);
        assert_eq!(starting_block(3, 5, 100), 0);
    }

    #[test]
    fn test_batcher_groups_consecutive_messages() {
        let mut batcher = TxBatcher::default();
        assert!(batcher.push(msg("abc", 1)).is_none());
        assert!(batcher.push(msg("abc", 2)).is_none());
        let done = batcher.push(msg("def", 3)).unwrap();
        assert_eq!(done.tx_hash, "abc");
        assert_eq!(
            done.msgs.iter().map(|m| m.nonce).collect::<Vec<_>>(),
            vec![1, 2]
        );
        let rest = batcher.flush().unwrap();
        assert_eq!(rest.tx_hash, "def");
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn test_group_by_tx_preserves_order() {
        let txs = group_by_tx(vec![msg("a", 1), msg("a", 2), msg("b", 3), msg("a", 4)]);
        let shape: Vec<(String, usize)> =
            txs.iter().map(|t| (t.tx_hash.clone(), t.msgs.len())).collect();
        assert_eq!(
            shape,
            vec![("a".to_string(), 2), ("b".to_string(), 1), ("a".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_enqueue_range_stops_on_shutdown() {
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = Shutdown::new();
        shutdown.cancel();
        assert!(!enqueue_range(&tx, 0, 100, 10, &shutdown).await);
    }

    #[tokio::test]
    async fn test_listener_backfills_and_tails() {
        let source = Arc::new(MemorySource::default());
        *source.height.lock().unwrap() = 20;
        source
            .blocks
            .lock()
            .unwrap()
            .insert(15, vec![msg("abc", 1), msg("abc", 2)]);

        let mut cfg = settings();
        cfg.start_block = 12;
        let listener = Listener::new(source.clone(), cfg, SharedHeight::default(), 0, false);

        let (queue_tx, mut queue_rx) = mpsc::channel(10);
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(listener.run(queue_tx, shutdown.clone()));

        let tx = tokio::time::timeout(Duration::from_secs(5), queue_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.tx_hash, "abc");
        assert_eq!(tx.msgs.len(), 2);

        // A later block shows up through the polling tail
        source
            .blocks
            .lock()
            .unwrap()
            .insert(25, vec![msg("def", 3)]);
        *source.height.lock().unwrap() = 26;
        let tx = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let tx = queue_rx.recv().await.unwrap();
                if tx.tx_hash == "def" {
                    return tx;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(tx.msgs[0].nonce, 3);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_range_is_retried() {
        let source = Arc::new(MemorySource::default());
        *source.height.lock().unwrap() = 5;
        source.failures.store(2, Ordering::SeqCst);
        source.blocks.lock().unwrap().insert(3, vec![msg("abc", 1)]);

        let mut cfg = settings();
        cfg.start_block = 1;
        cfg.lookback_period = 0;
        let listener = Listener::new(source.clone(), cfg, SharedHeight::default(), 0, false)
            .with_retry(RetryConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                backoff_multiplier: 2.0,
            });

        let (queue_tx, mut queue_rx) = mpsc::channel(10);
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(listener.run(queue_tx, shutdown.clone()));

        let tx = tokio::time::timeout(Duration::from_secs(5), queue_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.tx_hash, "abc");

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    #[tokio::test]
    async fn test_consume_stream_groups_ready_items() {
        let items = vec![Ok(msg("abc", 1)), Ok(msg("abc", 2)), Ok(msg("def", 3))];
        let stream = futures::stream::iter(items);
        let (queue_tx, mut queue_rx) = mpsc::channel(10);

        let result = consume_stream("test", stream, queue_tx, Shutdown::new()).await;
        assert!(result.is_err(), "stream end must be fatal");

        let first = queue_rx.recv().await.unwrap();
        assert_eq!(first.tx_hash, "abc");
        assert_eq!(first.msgs.len(), 2);
        let second = queue_rx.recv().await.unwrap();
        assert_eq!(second.tx_hash, "def");
    }

    #[tokio::test]
    async fn test_consume_stream_error_is_fatal() {
        let items = vec![Ok(msg("abc", 1)), Err(eyre!("ws closed"))];
        let (queue_tx, mut queue_rx) = mpsc::channel(10);
        let err = consume_stream("test", futures::stream::iter(items), queue_tx, Shutdown::new())
            .await
            .unwrap_err();
        assert!(format!("{:?}", err).contains("ws closed"));
        assert_eq!(queue_rx.recv().await.unwrap().tx_hash, "abc");
    }

    #[tokio::test]
    async fn test_consume_stream_exits_on_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let (queue_tx, _rx) = mpsc::channel(1);
        let result = consume_stream(
            "test",
            futures::stream::pending::<Result<MessageState>>(),
            queue_tx,
            shutdown,
        )
        .await;
        assert!(result.is_ok());
    }
}
