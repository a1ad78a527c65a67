//! Relayer orchestration
//!
//! Wires chains, the processing queue, the processor pool and the API
//! together and supervises them until shutdown.

use eyre::{eyre, Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::api;
use crate::attestation::{AttestationChecker, IrisClient};
use crate::chain::ChainRegistry;
use crate::config::Config;
use crate::processor::{MessageFilter, Processor};
use crate::sequence::SequenceMap;
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crate::types::TxState;

pub struct Relayer {
    config: Config,
    chains: ChainRegistry,
    attestation: Arc<dyn AttestationChecker>,
    store: StateStore,
    sequences: SequenceMap,
}

impl Relayer {
    /// Build chain adapters and the Iris client from configuration
    pub fn new(config: Config) -> Result<Self> {
        let chains = ChainRegistry::from_config(&config.chains, &config.flush)?;
        let attestation = Arc::new(IrisClient::new(&config.circle)?);
        Ok(Self::with_parts(config, chains, attestation))
    }

    pub fn with_parts(
        config: Config,
        chains: ChainRegistry,
        attestation: Arc<dyn AttestationChecker>,
    ) -> Self {
        let store = StateStore::new(
            config.terminal_store.max_entries,
            config.terminal_store.ttl_secs,
        );
        Self {
            config,
            chains,
            attestation,
            store,
            sequences: SequenceMap::new(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run until `shutdown` fires or a listener dies
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        for chain in self.chains.iter() {
            chain
                .initialize_broadcaster(&self.sequences)
                .await
                .wrap_err_with(|| format!("Failed to initialize {} broadcaster", chain.name()))?;
        }

        let (queue_tx, queue_rx) = mpsc::channel::<TxState>(self.config.processor.queue_size);

        let processor = Arc::new(
            Processor::new(
                self.chains.clone(),
                self.attestation.clone(),
                self.store.clone(),
                self.sequences.clone(),
                MessageFilter::from_config(&self.config),
            )
            .with_retries(
                self.config.circle.fetch_retries,
                Duration::from_secs(self.config.circle.fetch_retry_interval_secs),
            ),
        );

        let mut background = JoinSet::new();
        background.spawn(processor.run(
            self.config.processor.worker_count,
            queue_tx.clone(),
            queue_rx,
            shutdown.clone(),
        ));

        for chain in self.chains.iter() {
            background.spawn(chain.clone().track_latest_block_height(shutdown.clone()));
            background.spawn(chain.clone().wallet_balance_metric(shutdown.clone()));
        }

        {
            let store = self.store.clone();
            let addr = self.config.api.listen_addr.clone();
            let shutdown = shutdown.clone();
            background.spawn(async move {
                if let Err(e) = api::serve(&addr, store, shutdown).await {
                    error!(error = %e, "API server error");
                }
            });
        }

        let mut listeners = JoinSet::new();
        for chain in self.chains.iter() {
            let chain = chain.clone();
            let queue = queue_tx.clone();
            let shutdown = shutdown.clone();
            listeners.spawn(async move {
                let name = chain.name().to_string();
                (name, chain.start_listener(queue, shutdown).await)
            });
        }
        drop(queue_tx);

        info!(chains = self.chains.len(), "Relayer started");

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping relayer");
                Ok(())
            }
            maybe_done = listeners.join_next() => {
                match maybe_done {
                    Some(Ok((_, Ok(())))) if shutdown.is_cancelled() => Ok(()),
                    Some(Ok((name, Ok(())))) => {
                        error!(chain = %name, "A listener exited unexpectedly without error");
                        Err(eyre!("{} listener exited unexpectedly", name))
                    }
                    Some(Ok((name, Err(e)))) => {
                        error!(chain = %name, "A listener stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A listener task panicked: {:?}", e);
                        Err(eyre!("listener task panicked: {}", e))
                    }
                    None => {
                        error!("No listeners running");
                        Err(eyre!("no listeners running"))
                    }
                }
            }
        };

        shutdown.cancel();
        while listeners.join_next().await.is_some() {}
        while background.join_next().await.is_some() {}

        info!("Relayer stopped");
        result
    }
}
