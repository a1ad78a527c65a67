//! Message filters applied before attestation polling

use std::collections::{HashMap, HashSet};

use crate::chain::ChainRegistry;
use crate::config::Config;
use crate::types::{MessageState, MessageType};

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// source domain -> enabled destination domains
    routes: HashMap<u32, HashSet<u32>>,
    filter_forwards_by_ibc_channel: bool,
    channel_whitelist: HashSet<String>,
}

impl MessageFilter {
    pub fn new(
        routes: impl IntoIterator<Item = (u32, Vec<u32>)>,
        filter_forwards_by_ibc_channel: bool,
        channel_whitelist: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut route_map: HashMap<u32, HashSet<u32>> = HashMap::new();
        for (source, dests) in routes {
            route_map.entry(source).or_default().extend(dests);
        }
        Self {
            routes: route_map,
            filter_forwards_by_ibc_channel,
            channel_whitelist: channel_whitelist.into_iter().collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .enabled_routes
                .iter()
                .map(|r| (r.source, r.destinations.clone())),
            config.processor.filter_forwards_by_ibc_channel,
            config.processor.forwarding_channel_whitelist.iter().cloned(),
        )
    }

    /// The route source -> destination is not enabled
    pub fn filter_disabled_cctp_routes(&self, msg: &MessageState) -> bool {
        !self
            .routes
            .get(&msg.source_domain)
            .is_some_and(|dests| dests.contains(&msg.dest_domain))
    }

    /// The destination chain is not configured, or the message restricts its
    /// caller to an account that is not our minter
    pub fn filter_invalid_destination_callers(
        &self,
        msg: &MessageState,
        chains: &ChainRegistry,
    ) -> bool {
        let Some(chain) = chains.get(msg.dest_domain) else {
            return true;
        };
        !msg.has_open_destination_caller() && !chain.is_destination_caller(&msg.destination_caller)
    }

    /// Forward messages over channels outside the whitelist, when enabled
    pub fn filter_non_whitelisted_channels(&self, msg: &MessageState) -> bool {
        if !self.filter_forwards_by_ibc_channel || msg.msg_type != MessageType::Forward {
            return false;
        }
        !self.channel_whitelist.contains(&msg.channel)
    }

    /// Name of the first filter that rejects `msg`
    pub fn check(&self, msg: &MessageState, chains: &ChainRegistry) -> Option<&'static str> {
        if self.filter_disabled_cctp_routes(msg) {
            return Some("disabled_cctp_route");
        }
        if self.filter_invalid_destination_callers(msg, chains) {
            return Some("invalid_destination_caller");
        }
        if self.filter_non_whitelisted_channels(msg) {
            return Some("non_whitelisted_channel");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::message::CctpMessage;
    use crate::sequence::SequenceMap;
    use crate::shutdown::Shutdown;
    use crate::state::StateStore;
    use crate::types::TxState;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct StubChain {
        domain: u32,
        minter: [u8; 32],
    }

    #[async_trait]
    impl Chain for StubChain {
        fn name(&self) -> &str {
            "stub"
        }

        fn domain(&self) -> u32 {
            self.domain
        }

        fn is_destination_caller(&self, caller: &[u8]) -> bool {
            caller == self.minter.as_slice()
        }

        async fn initialize_broadcaster(&self, _sequences: &SequenceMap) -> eyre::Result<()> {
            Ok(())
        }

        async fn start_listener(
            self: Arc<Self>,
            _queue: mpsc::Sender<TxState>,
            shutdown: Shutdown,
        ) -> eyre::Result<()> {
            shutdown.cancelled().await;
            Ok(())
        }

        async fn broadcast(
            &self,
            _msgs: &mut [MessageState],
            _sequences: &SequenceMap,
            _store: &StateStore,
        ) -> eyre::Result<()> {
            Ok(())
        }

        async fn track_latest_block_height(self: Arc<Self>, _shutdown: Shutdown) {}

        async fn wallet_balance_metric(self: Arc<Self>, _shutdown: Shutdown) {}
    }

    fn registry() -> ChainRegistry {
        let mut chains = ChainRegistry::new();
        chains
            .insert(Arc::new(StubChain {
                domain: 4,
                minter: [7u8; 32],
            }))
            .unwrap();
        chains
    }

    fn message(dest_domain: u32, caller: [u8; 32], body: Vec<u8>) -> MessageState {
        let bytes = CctpMessage {
            version: 0,
            source_domain: 0,
            dest_domain,
            nonce: 1,
            sender: [1; 32],
            recipient: [2; 32],
            destination_caller: caller,
            body,
        }
        .to_bytes();
        MessageState::from_message_bytes("abc", &bytes).unwrap()
    }

    fn mint(dest_domain: u32, caller: [u8; 32]) -> MessageState {
        message(dest_domain, caller, vec![0u8; crate::message::BURN_MESSAGE_LEN])
    }

    fn forward(channel: u64) -> MessageState {
        let mut body = vec![0u8; 64];
        body[40..48].copy_from_slice(&channel.to_be_bytes());
        message(4, [0u8; 32], body)
    }

    #[test]
    fn test_disabled_route() {
        let filter = MessageFilter::new(vec![(0, vec![4])], false, Vec::new());
        assert!(!filter.filter_disabled_cctp_routes(&mint(4, [0; 32])));
        assert!(filter.filter_disabled_cctp_routes(&mint(3, [0; 32])));

        let empty = MessageFilter::default();
        assert!(empty.filter_disabled_cctp_routes(&mint(4, [0; 32])));
    }

    #[test]
    fn test_destination_caller() {
        let filter = MessageFilter::new(vec![(0, vec![4, 5])], false, Vec::new());
        let chains = registry();

        // Open caller
        assert!(!filter.filter_invalid_destination_callers(&mint(4, [0; 32]), &chains));
        // Our minter
        assert!(!filter.filter_invalid_destination_callers(&mint(4, [7; 32]), &chains));
        // Someone else
        assert!(filter.filter_invalid_destination_callers(&mint(4, [9; 32]), &chains));
        // Unknown destination chain
        assert!(filter.filter_invalid_destination_callers(&mint(5, [0; 32]), &chains));
    }

    #[test]
    fn test_channel_whitelist() {
        let off = MessageFilter::new(vec![(0, vec![4])], false, Vec::new());
        assert!(!off.filter_non_whitelisted_channels(&forward(3)));

        let on = MessageFilter::new(vec![(0, vec![4])], true, vec!["channel-1".to_string()]);
        assert!(!on.filter_non_whitelisted_channels(&forward(1)));
        assert!(on.filter_non_whitelisted_channels(&forward(3)));
        // Mints carry no channel
        assert!(!on.filter_non_whitelisted_channels(&mint(4, [0; 32])));
    }

    #[test]
    fn test_check_is_deterministic() {
        let filter = MessageFilter::new(vec![(0, vec![4])], true, vec!["channel-1".to_string()]);
        let chains = registry();
        let msgs = [mint(4, [0; 32]), mint(4, [9; 32]), mint(3, [0; 32]), forward(2)];
        let first: Vec<_> = msgs.iter().map(|m| filter.check(m, &chains)).collect();
        let second: Vec<_> = msgs.iter().map(|m| filter.check(m, &chains)).collect();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                None,
                Some("invalid_destination_caller"),
                Some("disabled_cctp_route"),
                Some("non_whitelisted_channel")
            ]
        );
    }
}
