//! EVM chain adapter
//!
//! Reads `MessageSent` logs from the MessageTransmitter over HTTP (and
//! optionally a websocket subscription) and mints with `receiveMessage`.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Chain;
use crate::broadcast::{Broadcaster, Submitter};
use crate::config::{EvmChainConfig, FlushConfig, ListenerSettings};
use crate::hash::{bytes32_to_hex, left_pad_32, used_nonce_key};
use crate::listener::{
    consume_stream, track_height, BlockRange, BlockSource, Listener, SharedHeight,
};
use crate::metrics;
use crate::sequence::SequenceMap;
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crate::types::{MessageState, TxState};

sol! {
    /// CCTP MessageTransmitter interface
    #[sol(rpc)]
    contract MessageTransmitter {
        event MessageSent(bytes message);

        /// Mint on this chain with a Circle attestation
        function receiveMessage(bytes message, bytes attestation) external returns (bool success);

        /// Non-zero once keccak256(sourceDomain, nonce) has been received
        function usedNonces(bytes32 sourceAndNonce) external view returns (uint256);
    }
}

fn message_sent_filter(transmitter: Address) -> Filter {
    Filter::new()
        .address(transmitter)
        .event_signature(MessageTransmitter::MessageSent::SIGNATURE_HASH)
}

/// Decode a `MessageSent` log into a `Created` message
pub fn message_from_log(log: &Log) -> Result<MessageState> {
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| eyre!("MessageSent log without transaction hash"))?;
    let decoded = log
        .log_decode::<MessageTransmitter::MessageSent>()
        .map_err(|e| eyre!("Failed to decode MessageSent: {}", e))?;

    Ok(MessageState::from_message_bytes(
        format!("{:?}", tx_hash),
        &decoded.inner.data.message,
    )?)
}

/// Log scanning over an HTTP provider
pub struct EvmSource {
    name: String,
    provider: RootProvider<Http<Client>>,
    transmitter: Address,
}

#[async_trait]
impl BlockSource for EvmSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn latest_height(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")
    }

    async fn fetch_messages(&self, range: BlockRange) -> Result<Vec<MessageState>> {
        let filter = message_sent_filter(self.transmitter)
            .from_block(range.start)
            .to_block(range.end);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err("Failed to get logs")?;

        let mut msgs = Vec::with_capacity(logs.len());
        for log in &logs {
            match message_from_log(log) {
                Ok(msg) => msgs.push(msg),
                Err(e) => warn!(
                    chain = %self.name,
                    tx_hash = ?log.transaction_hash,
                    error = %e,
                    "Dropping malformed MessageSent log"
                ),
            }
        }
        Ok(msgs)
    }
}

/// Minting half of the EVM adapter
pub struct EvmSubmitter {
    name: String,
    rpc_url: String,
    transmitter: Address,
    signer: PrivateKeySigner,
    provider: RootProvider<Http<Client>>,
}

#[async_trait]
impl Submitter for EvmSubmitter {
    fn chain_name(&self) -> &str {
        &self.name
    }

    async fn nonce_used(&self, source_domain: u32, nonce: u64) -> Result<bool> {
        let contract = MessageTransmitter::new(self.transmitter, &self.provider);
        let key = FixedBytes::from(used_nonce_key(source_domain, nonce));

        let used = contract
            .usedNonces(key)
            .call()
            .await
            .map_err(|e| eyre!("Failed to query usedNonces: {}", e))?;

        Ok(used._0 != U256::ZERO)
    }

    async fn submit(&self, msg: &MessageState, sequence: u64) -> Result<String> {
        let attestation = msg
            .attestation_bytes()
            .wrap_err("Invalid attestation hex")?;

        // Nonce is set explicitly; the fillers complete gas and fees
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);

        let contract = MessageTransmitter::new(self.transmitter, &provider);

        debug!(
            chain = %self.name,
            source_domain = msg.source_domain,
            nonce = msg.nonce,
            sequence,
            "Submitting receiveMessage"
        );

        let pending_tx = contract
            .receiveMessage(
                Bytes::from(msg.msg_sent_bytes.clone()),
                Bytes::from(attestation),
            )
            .nonce(sequence)
            .send()
            .await
            .map_err(|e| eyre!("Failed to send receiveMessage: {}", e))?;

        Ok(format!("{:?}", pending_tx.tx_hash()))
    }

    async fn account_sequence(&self) -> Result<u64> {
        self.provider
            .get_transaction_count(self.signer.address())
            .pending()
            .await
            .wrap_err("Failed to get pending nonce")
    }
}

pub struct EvmChain {
    name: String,
    domain: u32,
    minter: [u8; 32],
    minter_address: Address,
    ws_url: Option<String>,
    transmitter: Address,
    source: Arc<EvmSource>,
    broadcaster: Broadcaster<EvmSubmitter>,
    settings: ListenerSettings,
    height: SharedHeight,
    flush: FlushConfig,
    balance_interval: Duration,
}

impl EvmChain {
    pub fn new(config: &EvmChainConfig, flush: &FlushConfig) -> Result<Self> {
        let transmitter = Address::from_str(&config.message_transmitter)
            .wrap_err("Invalid message transmitter address")?;
        let signer: PrivateKeySigner = config
            .minter_private_key
            .parse()
            .wrap_err("Invalid private key")?;
        let minter_address = signer.address();

        let provider = ProviderBuilder::new()
            .on_http(config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?);

        info!(
            chain = %config.name,
            chain_id = config.chain_id,
            minter = %minter_address,
            transmitter = %transmitter,
            "EVM chain initialized"
        );

        let source = Arc::new(EvmSource {
            name: config.name.clone(),
            provider: provider.clone(),
            transmitter,
        });

        let broadcaster = Broadcaster::new(
            EvmSubmitter {
                name: config.name.clone(),
                rpc_url: config.rpc_url.clone(),
                transmitter,
                signer,
                provider,
            },
            config.domain,
            config.broadcast_retries,
            Duration::from_secs(config.broadcast_retry_interval_secs),
        );

        Ok(Self {
            name: config.name.clone(),
            domain: config.domain,
            minter: left_pad_32(minter_address.as_slice()),
            minter_address,
            ws_url: config.ws_url.clone(),
            transmitter,
            source,
            broadcaster,
            settings: config.listener(),
            height: SharedHeight::default(),
            flush: flush.clone(),
            balance_interval: Duration::from_secs(config.balance_poll_interval_secs.max(1)),
        })
    }

    /// Live `MessageSent` logs over a websocket subscription
    async fn subscribe(
        &self,
        ws_url: &str,
        queue: mpsc::Sender<TxState>,
        shutdown: Shutdown,
    ) -> Result<()> {
        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(ws_url))
            .await
            .wrap_err("Failed to connect websocket")?;

        let subscription = provider
            .subscribe_logs(&message_sent_filter(self.transmitter))
            .await
            .wrap_err("Failed to subscribe to MessageSent logs")?;

        info!(chain = %self.name, "Subscribed to MessageSent logs");

        let chain = self.name.clone();
        let stream = subscription.into_stream().filter_map(move |log| {
            let item = match message_from_log(&log) {
                Ok(msg) => Some(Ok(msg)),
                Err(e) => {
                    warn!(chain = %chain, error = %e, "Dropping malformed MessageSent log");
                    None
                }
            };
            futures::future::ready(item)
        });

        consume_stream(&self.name, stream, queue, shutdown).await
    }
}

#[async_trait]
impl Chain for EvmChain {
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

        let ws_url = match (&self.ws_url, self.flush.flush_only_mode) {
            (Some(url), false) => url.clone(),
            _ => return listener.run(queue, shutdown).await,
        };

        // Either half stopping is fatal for this chain
        tokio::select! {
            result = listener.run(queue.clone(), shutdown.clone()) => result,
            result = self.subscribe(&ws_url, queue, shutdown.clone()) => result,
        }
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
        let address = format!("{}", self.minter_address);
        loop {
            match self.source.provider.get_balance(self.minter_address).await {
                Ok(wei) => {
                    let balance = wei_to_eth(wei);
                    debug!(chain = %self.name, address = %address, balance, "Wallet balance");
                    metrics::set_wallet_balance(&self.name, &address, "eth", balance);
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

/// Lossy conversion for the balance gauge
fn wei_to_eth(wei: U256) -> f64 {
    wei.to_string().parse::<f64>().unwrap_or(0.0) / 1e18
}

impl std::fmt::Debug for EvmChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChain")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("minter", &bytes32_to_hex(&self.minter))
            .field("transmitter", &self.transmitter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_utils::burn_message_bytes;
    use alloy::primitives::{LogData, B256};

    fn message_sent_log(message: Vec<u8>, tx_hash: Option<B256>) -> Log {
        let event = MessageTransmitter::MessageSent {
            message: Bytes::from(message),
        };
        let data: LogData = event.encode_log_data();
        Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data,
            },
            transaction_hash: tx_hash,
            ..Default::default()
        }
    }

    #[test]
    fn test_message_from_log() {
        let hash = B256::repeat_byte(0xab);
        let log = message_sent_log(burn_message_bytes(0, 4, 42), Some(hash));
        let msg = message_from_log(&log).unwrap();

        assert_eq!(msg.source_domain, 0);
        assert_eq!(msg.dest_domain, 4);
        assert_eq!(msg.nonce, 42);
        assert_eq!(msg.source_tx_hash, format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn test_message_from_log_rejects_bad_input() {
        let missing_hash = message_sent_log(burn_message_bytes(0, 4, 1), None);
        assert!(message_from_log(&missing_hash).is_err());

        let truncated = message_sent_log(vec![0u8; 10], Some(B256::ZERO));
        assert!(message_from_log(&truncated).is_err());
    }

    #[test]
    fn test_destination_caller_padding() {
        let address = Address::repeat_byte(0x11);
        let caller = left_pad_32(address.as_slice());
        assert_eq!(&caller[..12], &[0u8; 12]);
        assert_eq!(&caller[12..], address.as_slice());
    }

    #[test]
    fn test_wei_to_eth() {
        let one_eth = U256::from(1_000_000_000_000_000_000u128);
        assert!((wei_to_eth(one_eth) - 1.0).abs() < 1e-9);
        assert_eq!(wei_to_eth(U256::ZERO), 0.0);
    }

    #[test]
    fn test_chain_construction() {
        let config = EvmChainConfig {
            name: "ethereum".to_string(),
            domain: 0,
            chain_id: 1,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            ws_url: None,
            message_transmitter: format!("0x{}", "0a".repeat(20)),
            start_block: 0,
            lookback_period: 5,
            workers: 1,
            max_block_range: 100,
            block_queue_size: 10,
            poll_interval_secs: 1,
            broadcast_retries: 1,
            broadcast_retry_interval_secs: 1,
            balance_poll_interval_secs: 60,
            // Anvil account #0
            minter_private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .to_string(),
        };
        let chain = EvmChain::new(&config, &FlushConfig::default()).unwrap();
        assert_eq!(chain.domain(), 0);

        let minter: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        assert!(chain.is_destination_caller(&left_pad_32(minter.as_slice())));
        assert!(!chain.is_destination_caller(&[0u8; 32]));
    }
}
