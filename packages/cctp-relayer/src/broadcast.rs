//! Destination-chain broadcaster
//!
//! Submits `receiveMessage` for attested messages with idempotent retries.
//! Before every attempt the destination is asked whether the message nonce is
//! already consumed, so a message is never minted twice by this relayer even
//! when several workers or relayer instances race on it. After any failed
//! submit the sequence is repaired, from the error text when it names the
//! expected value and from a live account query otherwise.

use async_trait::async_trait;
use eyre::{eyre, Result};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::retry::{classify_error, parse_expected_sequence, ErrorClass};
use crate::sequence::SequenceMap;
use crate::state::StateStore;
use crate::types::{MessageState, MessageStatus};

/// Chain-specific half of a broadcaster
#[async_trait]
pub trait Submitter: Send + Sync {
    fn chain_name(&self) -> &str;

    /// Whether `(source_domain, nonce)` is already consumed on this chain
    async fn nonce_used(&self, source_domain: u32, nonce: u64) -> Result<bool>;

    /// Build, sign and submit `receiveMessage`, returning the destination tx hash
    async fn submit(&self, msg: &MessageState, sequence: u64) -> Result<String>;

    /// Live next account sequence (EVM pending nonce, Cosmos account sequence)
    async fn account_sequence(&self) -> Result<u64>;
}

pub struct Broadcaster<S: Submitter> {
    submitter: S,
    domain: u32,
    /// Held across "assign sequence -> submit"
    submit_lock: tokio::sync::Mutex<()>,
    max_retries: u32,
    retry_interval: Duration,
}

impl<S: Submitter> Broadcaster<S> {
    pub fn new(submitter: S, domain: u32, max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            submitter,
            domain,
            submit_lock: tokio::sync::Mutex::new(()),
            max_retries: max_retries.max(1),
            retry_interval,
        }
    }

    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    /// Seed the sequence map from the live account sequence
    pub async fn initialize(&self, sequences: &SequenceMap) -> Result<()> {
        let sequence = self.submitter.account_sequence().await?;
        sequences.put(self.domain, sequence);
        info!(
            chain = self.submitter.chain_name(),
            domain = self.domain,
            sequence,
            "Broadcaster initialized"
        );
        Ok(())
    }

    /// Broadcast every Attested message in `msgs`. Each message ends Complete
    /// or Failed; failures are joined into one error after all siblings ran.
    pub async fn broadcast(
        &self,
        msgs: &mut [MessageState],
        sequences: &SequenceMap,
        store: &StateStore,
    ) -> Result<()> {
        let mut errors = Vec::new();

        for msg in msgs.iter_mut() {
            if msg.status != MessageStatus::Attested {
                continue;
            }
            if let Err(e) = self.broadcast_one(msg, sequences, store).await {
                errors.push(format!("{:#}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(eyre!(
                "{} broadcast failed for {} message(s): {}",
                self.submitter.chain_name(),
                errors.len(),
                errors.join("; ")
            ))
        }
    }

    async fn broadcast_one(
        &self,
        msg: &mut MessageState,
        sequences: &SequenceMap,
        store: &StateStore,
    ) -> Result<()> {
        let chain = self.submitter.chain_name();
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            if let Some(done) = completed_record(store, msg) {
                debug!(
                    chain,
                    source_domain = msg.source_domain,
                    nonce = msg.nonce,
                    "Message already completed by another worker"
                );
                *msg = done;
                return Ok(());
            }

            match self
                .submitter
                .nonce_used(msg.source_domain, msg.nonce)
                .await
            {
                Ok(true) => {
                    info!(
                        chain,
                        source_domain = msg.source_domain,
                        nonce = msg.nonce,
                        "Nonce already used on destination, marking complete"
                    );
                    msg.set_status(MessageStatus::Complete);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        chain,
                        source_domain = msg.source_domain,
                        nonce = msg.nonce,
                        error = %e,
                        "Failed to query used nonce, submitting anyway"
                    );
                }
            }

            let (class, text) = {
                let _guard = self.submit_lock.lock().await;

                // A concurrent duplicate may have minted while we waited
                if let Some(done) = completed_record(store, msg) {
                    debug!(
                        chain,
                        source_domain = msg.source_domain,
                        nonce = msg.nonce,
                        "Message completed while waiting for the submit lock"
                    );
                    *msg = done;
                    return Ok(());
                }

                let sequence = sequences.next(self.domain);
                debug!(
                    chain,
                    source_domain = msg.source_domain,
                    nonce = msg.nonce,
                    sequence,
                    attempt,
                    "Submitting receiveMessage"
                );

                match self.submitter.submit(msg, sequence).await {
                    Ok(tx_hash) => {
                        info!(
                            chain,
                            source_domain = msg.source_domain,
                            nonce = msg.nonce,
                            source_tx_hash = %msg.source_tx_hash,
                            dest_tx_hash = %tx_hash,
                            "Message minted"
                        );
                        msg.dest_tx_hash = tx_hash;
                        msg.last_error = None;
                        msg.set_status(MessageStatus::Complete);
                        store.update(msg);
                        return Ok(());
                    }
                    Err(e) => {
                        metrics::record_broadcast_error(chain, self.domain);
                        let text = format!("{:#}", e);
                        let class = classify_error(&text);
                        // The failed attempt may not have used its sequence
                        let hint = match class {
                            ErrorClass::SequenceMismatch => parse_expected_sequence(&text),
                            _ => None,
                        };
                        self.resync(sequences, hint).await;
                        (class, text)
                    }
                }
            };

            match class {
                ErrorClass::AlreadyConsumed => {
                    info!(
                        chain,
                        source_domain = msg.source_domain,
                        nonce = msg.nonce,
                        "Destination reports nonce already used, marking complete"
                    );
                    msg.set_status(MessageStatus::Complete);
                    store.update(msg);
                    return Ok(());
                }
                ErrorClass::SequenceMismatch => {
                    warn!(chain, attempt, error = %text, "Account sequence mismatch");
                }
                ErrorClass::Permanent => {
                    error!(
                        chain,
                        source_domain = msg.source_domain,
                        nonce = msg.nonce,
                        attempt,
                        max_retries = self.max_retries,
                        error = %text,
                        "Broadcast attempt failed with non-retryable error"
                    );
                }
                class => {
                    warn!(
                        chain,
                        source_domain = msg.source_domain,
                        nonce = msg.nonce,
                        attempt,
                        max_retries = self.max_retries,
                        ?class,
                        error = %text,
                        "Broadcast attempt failed"
                    );
                }
            }
            last_error = text;

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_interval).await;
            }
        }

        error!(
            chain,
            source_domain = msg.source_domain,
            nonce = msg.nonce,
            source_tx_hash = %msg.source_tx_hash,
            error = %last_error,
            "Broadcast retries exhausted"
        );
        msg.last_error = Some(last_error.clone());
        msg.set_status(MessageStatus::Failed);
        Err(eyre!(
            "source_domain={} nonce={}: {}",
            msg.source_domain,
            msg.nonce,
            last_error
        ))
    }

    /// Repair the sequence after a failed submit: parsed hint first, live
    /// query second. Caller holds the submit lock.
    async fn resync(&self, sequences: &SequenceMap, hint: Option<u64>) {
        let chain = self.submitter.chain_name();

        if let Some(expected) = hint {
            debug!(chain, sequence = expected, "Resynced sequence from error text");
            sequences.put(self.domain, expected);
            return;
        }

        match self.submitter.account_sequence().await {
            Ok(sequence) => {
                debug!(chain, sequence, "Resynced sequence from account query");
                sequences.put(self.domain, sequence);
            }
            Err(e) => {
                warn!(chain, error = %e, "Failed to query account sequence for resync");
            }
        }
    }
}

/// Stored record of `msg` if it already reached Complete
fn completed_record(store: &StateStore, msg: &MessageState) -> Option<MessageState> {
    store
        .message(&msg.iris_lookup_id)
        .filter(|stored| stored.status == MessageStatus::Complete)
}
