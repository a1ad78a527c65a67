//! Message processor
//!
//! A fixed pool of workers drains the processing queue. Each transaction is
//! merged with its stored snapshot, then every non-terminal message is
//! filtered, checked against the attestation service and, once attested,
//! handed to its destination chain's broadcaster. Transactions that still
//! need work are re-enqueued by a delay task so workers never sleep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::attestation::AttestationChecker;
use crate::chain::ChainRegistry;
use crate::metrics;
use crate::sequence::SequenceMap;
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crate::types::{MessageState, MessageStatus, TxState};

pub mod filters;

pub use filters::MessageFilter;

pub struct Processor {
    chains: ChainRegistry,
    attestation: Arc<dyn AttestationChecker>,
    store: StateStore,
    sequences: SequenceMap,
    filter: MessageFilter,
    fetch_retries: u32,
    fetch_retry_interval: Duration,
}

impl Processor {
    pub fn new(
        chains: ChainRegistry,
        attestation: Arc<dyn AttestationChecker>,
        store: StateStore,
        sequences: SequenceMap,
        filter: MessageFilter,
    ) -> Self {
        Self {
            chains,
            attestation,
            store,
            sequences,
            filter,
            fetch_retries: 10,
            fetch_retry_interval: Duration::from_secs(10),
        }
    }

    pub fn with_retries(mut self, fetch_retries: u32, fetch_retry_interval: Duration) -> Self {
        self.fetch_retries = fetch_retries;
        self.fetch_retry_interval = fetch_retry_interval;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn write(&self, msg: &MessageState) {
        self.store.update(msg);
        metrics::record_status(msg.status);
        if msg.status.is_terminal() {
            let elapsed = (msg.updated - msg.created).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::record_relay_latency(msg.status, elapsed);
        }
    }

    /// Advance every message of `tx` as far as possible.
    /// Returns the transaction when it needs another pass later.
    pub async fn process(&self, tx: TxState) -> Option<TxState> {
        let mut tx = self.store.observe(&tx);
        let mut needs_requeue = false;
        let mut by_destination: BTreeMap<u32, Vec<usize>> = BTreeMap::new();

        for (idx, msg) in tx.msgs.iter_mut().enumerate() {
            if msg.status.is_terminal() {
                continue;
            }

            if let Some(reason) = self.filter.check(msg, &self.chains) {
                info!(
                    source_domain = msg.source_domain,
                    dest_domain = msg.dest_domain,
                    nonce = msg.nonce,
                    source_tx_hash = %msg.source_tx_hash,
                    reason,
                    "Message filtered"
                );
                msg.set_status(MessageStatus::Filtered);
                self.write(msg);
                continue;
            }

            if matches!(msg.status, MessageStatus::Created | MessageStatus::Pending) {
                match self.attestation.check(msg).await {
                    None => {
                        debug!(
                            iris_lookup_id = %msg.iris_lookup_id,
                            "No attestation response yet"
                        );
                        needs_requeue = true;
                        continue;
                    }
                    Some(response) if response.is_complete() => {
                        info!(
                            source_domain = msg.source_domain,
                            nonce = msg.nonce,
                            source_tx_hash = %msg.source_tx_hash,
                            "Attestation complete"
                        );
                        msg.attestation = response.attestation;
                        msg.set_status(MessageStatus::Attested);
                        self.write(msg);
                    }
                    Some(response) => {
                        debug!(
                            iris_lookup_id = %msg.iris_lookup_id,
                            status = %response.status,
                            "Attestation pending"
                        );
                        if msg.status != MessageStatus::Pending {
                            msg.set_status(MessageStatus::Pending);
                            self.write(msg);
                        }
                        needs_requeue = true;
                        continue;
                    }
                }
            }

            if msg.status == MessageStatus::Attested {
                by_destination.entry(msg.dest_domain).or_default().push(idx);
            }
        }

        for (domain, indices) in by_destination {
            let Some(chain) = self.chains.get(domain) else {
                warn!(dest_domain = domain, "No chain configured for destination");
                needs_requeue = true;
                continue;
            };

            let mut batch: Vec<MessageState> =
                indices.iter().map(|i| tx.msgs[*i].clone()).collect();
            if let Err(e) = chain
                .broadcast(&mut batch, &self.sequences, &self.store)
                .await
            {
                error!(
                    chain = chain.name(),
                    source_tx_hash = %tx.tx_hash,
                    error = %e,
                    "Broadcast failed"
                );
            }

            for (idx, msg) in indices.into_iter().zip(batch) {
                if msg.status == MessageStatus::Attested {
                    needs_requeue = true;
                }
                self.write(&msg);
                tx.msgs[idx] = msg;
            }
        }

        needs_requeue.then_some(tx)
    }

    /// Re-send `tx` after the retry interval, or drop it once out of retries
    fn schedule_retry(&self, mut tx: TxState, queue: &mpsc::Sender<TxState>, shutdown: &Shutdown) {
        if tx.retry_attempt >= self.fetch_retries {
            error!(
                source_tx_hash = %tx.tx_hash,
                attempts = tx.retry_attempt,
                "Giving up on transaction after max retries"
            );
            return;
        }

        tx.retry_attempt += 1;
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        let delay = self.fetch_retry_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = async {
                    tokio::time::sleep(delay).await;
                    let _ = queue.send(tx).await;
                } => {}
            }
        });
    }

    /// Run `worker_count` workers until shutdown
    pub async fn run(
        self: Arc<Self>,
        worker_count: usize,
        queue_tx: mpsc::Sender<TxState>,
        queue_rx: mpsc::Receiver<TxState>,
        shutdown: Shutdown,
    ) {
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let mut workers = tokio::task::JoinSet::new();

        for id in 0..worker_count {
            let processor = self.clone();
            let queue_rx = queue_rx.clone();
            let queue_tx = queue_tx.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let tx = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => None,
                            tx = rx.recv() => tx,
                        }
                    };
                    let Some(tx) = tx else {
                        debug!(worker = id, "Processor worker stopping");
                        return;
                    };
                    metrics::set_queue_depth(queue_tx.max_capacity() - queue_tx.capacity());

                    if let Some(tx) = processor.process(tx).await {
                        processor.schedule_retry(tx, &queue_tx, &shutdown);
                    }
                }
            });
        }

        info!(workers = worker_count, "Processor started");
        while workers.join_next().await.is_some() {}
        info!("Processor stopped");
    }
}
