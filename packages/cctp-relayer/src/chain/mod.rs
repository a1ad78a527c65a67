//! Chain adapters
//!
//! Every supported network implements [`Chain`]. The relayer only talks to
//! chains through this trait, dispatched as `Arc<dyn Chain>`.

use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{ChainConfig, FlushConfig};
use crate::sequence::SequenceMap;
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crate::types::{MessageState, TxState};

pub mod evm;
pub mod noble;
pub mod noble_client;

pub use evm::EvmChain;
pub use noble::NobleChain;

#[async_trait]
pub trait Chain: Send + Sync {
    fn name(&self) -> &str;

    /// CCTP domain id
    fn domain(&self) -> u32;

    /// Whether `caller` (a bytes32 destination caller) is this relayer's minter
    fn is_destination_caller(&self, caller: &[u8]) -> bool;

    /// Seed `sequences` with the minter's live account sequence
    async fn initialize_broadcaster(&self, sequences: &SequenceMap) -> Result<()>;

    /// Discover MessageSent events and enqueue them until shutdown.
    /// Returning at all before shutdown is fatal for the relayer.
    async fn start_listener(
        self: Arc<Self>,
        queue: mpsc::Sender<TxState>,
        shutdown: Shutdown,
    ) -> Result<()>;

    /// Mint every Attested message in `msgs` on this chain
    async fn broadcast(
        &self,
        msgs: &mut [MessageState],
        sequences: &SequenceMap,
        store: &StateStore,
    ) -> Result<()>;

    /// Keep the chain's latest height fresh until shutdown
    async fn track_latest_block_height(self: Arc<Self>, shutdown: Shutdown);

    /// Export the minter's native balance until shutdown
    async fn wallet_balance_metric(self: Arc<Self>, shutdown: Shutdown);
}

/// Configured chains keyed by CCTP domain
#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<u32, Arc<dyn Chain>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain: Arc<dyn Chain>) -> Result<()> {
        let domain = chain.domain();
        if self.chains.contains_key(&domain) {
            return Err(eyre!("chain for domain {} registered twice", domain));
        }
        self.chains.insert(domain, chain);
        Ok(())
    }

    pub fn get(&self, domain: u32) -> Option<&Arc<dyn Chain>> {
        self.chains.get(&domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Chain>> {
        self.chains.values()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Build adapters for every configured chain
    pub fn from_config(chains: &[ChainConfig], flush: &FlushConfig) -> Result<Self> {
        let mut registry = Self::new();
        for chain in chains {
            let adapter: Arc<dyn Chain> = match chain {
                ChainConfig::Evm(c) => Arc::new(EvmChain::new(c, flush)?),
                ChainConfig::Noble(c) => Arc::new(NobleChain::new(c, flush)?),
            };
            tracing::info!(
                chain = adapter.name(),
                domain = adapter.domain(),
                "Chain adapter created"
            );
            registry.insert(adapter)?;
        }
        Ok(registry)
    }
}
