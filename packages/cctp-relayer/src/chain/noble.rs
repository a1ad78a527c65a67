//! Noble chain adapter
//!
//! Scans blocks through the LCD tx search endpoint and mints with
//! `MsgReceiveMessage` signed by the minter account.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tendermint_rpc::{Client, HttpClient};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::noble_client::{decode_message_attribute, NobleClient, TxResponse};
use super::Chain;
use crate::broadcast::{Broadcaster, Submitter};
use crate::config::{FlushConfig, ListenerSettings, NobleChainConfig};
use crate::hash::left_pad_32;
use crate::listener::{track_height, BlockRange, BlockSource, Listener, SharedHeight};
use crate::metrics;
use crate::sequence::SequenceMap;
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crate::types::{MessageState, TxState};

pub const MESSAGE_SENT_EVENT: &str = "circle.cctp.v1.MessageSent";
const MESSAGE_ATTRIBUTE: &str = "message";

/// Block scanning over Tendermint RPC (tip) and LCD (transactions)
pub struct NobleSource {
    name: String,
    rpc_client: HttpClient,
    client: Arc<NobleClient>,
}

#[async_trait]
impl BlockSource for NobleSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn latest_height(&self) -> Result<u64> {
        let status = self
            .rpc_client
            .status()
            .await
            .wrap_err("Failed to get node status")?;

        Ok(status.sync_info.latest_block_height.value())
    }

    async fn is_catching_up(&self) -> Result<bool> {
        let status = self
            .rpc_client
            .status()
            .await
            .wrap_err("Failed to get node status")?;

        Ok(status.sync_info.catching_up)
    }

    async fn fetch_messages(&self, range: BlockRange) -> Result<Vec<MessageState>> {
        let mut msgs = Vec::new();
        for height in range.start..=range.end {
            let txs = self.client.txs_at_height(height).await?;
            for tx in &txs {
                msgs.extend(messages_from_tx(&self.name, tx));
            }
        }
        Ok(msgs)
    }
}

/// CCTP messages emitted by a successful transaction, in event order
pub fn messages_from_tx(chain: &str, tx: &TxResponse) -> Vec<MessageState> {
    if tx.code != 0 {
        return Vec::new();
    }

    tx.events
        .iter()
        .filter(|e| e.type_str == MESSAGE_SENT_EVENT)
        .flat_map(|e| e.attributes.iter().filter(|a| a.key == MESSAGE_ATTRIBUTE))
        .filter_map(|attr| {
            let parsed = decode_message_attribute(&attr.value)
                .and_then(|bytes| Ok(MessageState::from_message_bytes(&tx.txhash, &bytes)?));
            match parsed {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(
                        chain,
                        tx_hash = %tx.txhash,
                        error = %e,
                        "Dropping malformed MessageSent event"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Minting half of the Noble adapter
pub struct NobleSubmitter {
    name: String,
    client: Arc<NobleClient>,
}

#[async_trait]
impl Submitter for NobleSubmitter {
    fn chain_name(&self) -> &str {
        &self.name
    }

    async fn nonce_used(&self, source_domain: u32, nonce: u64) -> Result<bool> {
        self.client.nonce_used(source_domain, nonce).await
    }

    async fn submit(&self, msg: &MessageState, sequence: u64) -> Result<String> {
        let attestation = msg
            .attestation_bytes()
            .wrap_err("Invalid attestation hex")?;
        self.client
            .receive_message(&msg.msg_sent_bytes, &attestation, sequence)
            .await
    }

    async fn account_sequence(&self) -> Result<u64> {
        Ok(self.client.get_account_info().await?.sequence)
    }
}

pub struct NobleChain {
    name: String,
    domain: u32,
    minter: [u8; 32],
    client: Arc<NobleClient>,
    source: Arc<NobleSource>,
    broadcaster: Broadcaster<NobleSubmitter>,
    settings: ListenerSettings,
    height: SharedHeight,
    flush: FlushConfig,
    balance_interval: Duration,
}

impl NobleChain {
    pub fn new(config: &NobleChainConfig, flush: &FlushConfig) -> Result<Self> {
        let client = Arc::new(NobleClient::new(config)?);
        let rpc_client = HttpClient::new(config.rpc_url.as_str())
            .wrap_err("Failed to create RPC client")?;

        let minter = left_pad_32(&client.address.to_bytes());

        let source = Arc::new(NobleSource {
            name: config.name.clone(),
            rpc_client,
            client: client.clone(),
        });

        let broadcaster = Broadcaster::new(
            NobleSubmitter {
                name: config.name.clone(),
                client: client.clone(),
            },
            config.domain,
            config.broadcast_retries,
            Duration::from_secs(config.broadcast_retry_interval_secs),
        );

        Ok(Self {
            name: config.name.clone(),
            domain: config.domain,
            minter,
            client,
            source,
            broadcaster,
            settings: config.listener(),
            height: SharedHeight::default(),
            flush: flush.clone(),
            balance_interval: Duration::from_secs(config.balance_poll_interval_secs.max(1)),
        })
    }
}

#[async_trait]
impl Chain for NobleChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn domain(&self) -> u32 {
        self.domain
    }

    fn is_destination_caller(&self, caller: &[u8]) -> bool {
        caller == self.minter.as_slice()
    }

    async fn initialize_broadcaster(&self, sequences: &SequenceMap) -> Result<()> {
        self.broadcaster.initialize(sequences).await
    }

    async fn start_listener(
        self: Arc<Self>,
        queue: mpsc::Sender<TxState>,
        shutdown: Shutdown,
    ) -> Result<()> {
        let listener = Listener::new(
            self.source.clone(),
            self.settings.clone(),
            self.height.clone(),
            self.flush.interval_secs,
            self.flush.flush_only_mode,
        );
        listener.run(queue, shutdown).await
    }

    async fn broadcast(
        &self,
        msgs: &mut [MessageState],
        sequences: &SequenceMap,
        store: &StateStore,
    ) -> Result<()> {
        self.broadcaster.broadcast(msgs, sequences, store).await
    }

    async fn track_latest_block_height(self: Arc<Self>, shutdown: Shutdown) {
        track_height(
            self.source.clone(),
            self.domain,
            self.height.clone(),
            Duration::from_secs(self.settings.poll_interval_secs.max(1)),
            shutdown,
        )
        .await
    }

    async fn wallet_balance_metric(self: Arc<Self>, shutdown: Shutdown) {
        let address = self.client.address.to_string();
        loop {
            match self.client.balance().await {
                Ok(amount) => {
                    // Micro-denominated
                    let balance = amount as f64 / 1_000_000.0;
                    debug!(chain = %self.name, address = %address, balance, "Wallet balance");
                    metrics::set_wallet_balance(&self.name, &address, self.client.gas_denom(), balance);
                }
                Err(e) => {
                    warn!(chain = %self.name, error = %e, "Failed to query wallet balance");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(chain = %self.name, "Balance monitor stopped");
                    return;
                }
                _ = tokio::time::sleep(self.balance_interval) => {}
            }
        }
    }
}
