use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::Path;

use crate::bounded_cache::{DEFAULT_TERMINAL_CACHE_SIZE, DEFAULT_TERMINAL_CACHE_TTL_SECS};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "RELAYER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Main configuration for the relayer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    /// Source domain -> allowed destination domains
    #[serde(default)]
    pub enabled_routes: Vec<RouteConfig>,
    pub circle: CircleConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub terminal_store: TerminalStoreConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChainConfig {
    Evm(EvmChainConfig),
    Noble(NobleChainConfig),
}

/// Scan and broadcast settings common to every chain kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub start_block: u64,
    pub lookback_period: u64,
    pub workers: usize,
    pub max_block_range: u64,
    pub block_queue_size: usize,
    pub poll_interval_secs: u64,
}

impl ChainConfig {
    pub fn name(&self) -> &str {
        match self {
            ChainConfig::Evm(c) => &c.name,
            ChainConfig::Noble(c) => &c.name,
        }
    }

    pub fn domain(&self) -> u32 {
        match self {
            ChainConfig::Evm(c) => c.domain,
            ChainConfig::Noble(c) => c.domain,
        }
    }

    pub fn listener(&self) -> ListenerSettings {
        match self {
            ChainConfig::Evm(c) => c.listener(),
            ChainConfig::Noble(c) => c.listener(),
        }
    }

    fn validate(&self) -> Result<()> {
        let name = self.name();
        if name.is_empty() {
            return Err(eyre!("chain name cannot be empty"));
        }
        let listener = self.listener();
        if listener.workers == 0 {
            return Err(eyre!("{}: workers must be greater than 0", name));
        }
        if listener.max_block_range == 0 {
            return Err(eyre!("{}: max_block_range must be greater than 0", name));
        }
        if listener.block_queue_size == 0 {
            return Err(eyre!("{}: block_queue_size must be greater than 0", name));
        }

        match self {
            ChainConfig::Evm(c) => {
                if c.broadcast_retries == 0 {
                    return Err(eyre!("{}: broadcast_retries must be greater than 0", name));
                }
                if c.rpc_url.is_empty() {
                    return Err(eyre!("{}: rpc_url cannot be empty", name));
                }
                if matches!(&c.ws_url, Some(url) if url.is_empty()) {
                    return Err(eyre!("{}: ws_url cannot be empty when set", name));
                }
                if c.message_transmitter.len() != 42 || !c.message_transmitter.starts_with("0x") {
                    return Err(eyre!(
                        "{}: message_transmitter must be a valid hex address (42 chars with 0x prefix)",
                        name
                    ));
                }
                if c.minter_private_key.len() != 66 || !c.minter_private_key.starts_with("0x") {
                    return Err(eyre!(
                        "{}: minter_private_key must be 66 chars (0x + 64 hex chars)",
                        name
                    ));
                }
            }
            ChainConfig::Noble(c) => {
                if c.broadcast_retries == 0 {
                    return Err(eyre!("{}: broadcast_retries must be greater than 0", name));
                }
                if c.rpc_url.is_empty() {
                    return Err(eyre!("{}: rpc_url cannot be empty", name));
                }
                if c.lcd_url.is_empty() {
                    return Err(eyre!("{}: lcd_url cannot be empty", name));
                }
                if c.chain_id.is_empty() {
                    return Err(eyre!("{}: chain_id cannot be empty", name));
                }
                let mnemonic_words: Vec<&str> = c.minter_mnemonic.split_whitespace().collect();
                if mnemonic_words.len() < 12 {
                    return Err(eyre!("{}: minter_mnemonic must have at least 12 words", name));
                }
                if c.gas_price < 0.0 {
                    return Err(eyre!("{}: gas_price cannot be negative", name));
                }
            }
        }
        Ok(())
    }
}

/// EVM chain configuration
#[derive(Clone, Deserialize)]
pub struct EvmChainConfig {
    pub name: String,
    pub domain: u32,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Enables the MessageSent log subscription
    #[serde(default)]
    pub ws_url: Option<String>,
    pub message_transmitter: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_evm_lookback")]
    pub lookback_period: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_evm_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_block_queue_size")]
    pub block_queue_size: usize,
    #[serde(default = "default_evm_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_broadcast_retries")]
    pub broadcast_retries: u32,
    #[serde(default = "default_broadcast_retry_interval")]
    pub broadcast_retry_interval_secs: u64,
    #[serde(default = "default_balance_interval")]
    pub balance_poll_interval_secs: u64,
    pub minter_private_key: String,
}

impl EvmChainConfig {
    pub fn listener(&self) -> ListenerSettings {
        ListenerSettings {
            start_block: self.start_block,
            lookback_period: self.lookback_period,
            workers: self.workers,
            max_block_range: self.max_block_range,
            block_queue_size: self.block_queue_size,
            poll_interval_secs: self.poll_interval_secs,
        }
    }
}

/// Custom Debug that redacts minter_private_key to prevent accidental log leakage.
impl fmt::Debug for EvmChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmChainConfig")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("message_transmitter", &self.message_transmitter)
            .field("start_block", &self.start_block)
            .field("lookback_period", &self.lookback_period)
            .field("workers", &self.workers)
            .field("max_block_range", &self.max_block_range)
            .field("broadcast_retries", &self.broadcast_retries)
            .field("minter_private_key", &"<redacted>")
            .finish()
    }
}

/// Noble (Cosmos SDK) chain configuration
#[derive(Clone, Deserialize)]
pub struct NobleChainConfig {
    pub name: String,
    #[serde(default = "default_noble_domain")]
    pub domain: u32,
    pub chain_id: String,
    /// Tendermint RPC
    pub rpc_url: String,
    /// REST (LCD) endpoint used for tx queries, account lookups and broadcast
    pub lcd_url: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_noble_lookback")]
    pub lookback_period: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_noble_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_block_queue_size")]
    pub block_queue_size: usize,
    #[serde(default = "default_noble_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_broadcast_retries")]
    pub broadcast_retries: u32,
    #[serde(default = "default_broadcast_retry_interval")]
    pub broadcast_retry_interval_secs: u64,
    #[serde(default = "default_balance_interval")]
    pub balance_poll_interval_secs: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_gas_price")]
    pub gas_price: f64,
    #[serde(default = "default_gas_denom")]
    pub gas_denom: String,
    #[serde(default = "default_bech32_prefix")]
    pub bech32_prefix: String,
    pub minter_mnemonic: String,
}

impl NobleChainConfig {
    pub fn listener(&self) -> ListenerSettings {
        ListenerSettings {
            start_block: self.start_block,
            lookback_period: self.lookback_period,
            workers: self.workers,
            max_block_range: self.max_block_range,
            block_queue_size: self.block_queue_size,
            poll_interval_secs: self.poll_interval_secs,
        }
    }
}

/// Custom Debug that redacts minter_mnemonic to prevent accidental log leakage.
impl fmt::Debug for NobleChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NobleChainConfig")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("lcd_url", &self.lcd_url)
            .field("start_block", &self.start_block)
            .field("lookback_period", &self.lookback_period)
            .field("workers", &self.workers)
            .field("max_block_range", &self.max_block_range)
            .field("broadcast_retries", &self.broadcast_retries)
            .field("gas_limit", &self.gas_limit)
            .field("gas_price", &self.gas_price)
            .field("gas_denom", &self.gas_denom)
            .field("minter_mnemonic", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub source: u32,
    pub destinations: Vec<u32>,
}

/// Circle attestation service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CircleConfig {
    pub attestation_base_url: String,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_fetch_retry_interval")]
    pub fetch_retry_interval_secs: u64,
    #[serde(default = "default_attestation_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_processor_workers")]
    pub worker_count: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub filter_forwards_by_ibc_channel: bool,
    #[serde(default)]
    pub forwarding_channel_whitelist: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: default_processor_workers(),
            queue_size: default_queue_size(),
            filter_forwards_by_ibc_channel: false,
            forwarding_channel_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// 0 disables the flush scanner
    #[serde(default = "default_flush_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub flush_only_mode: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_flush_interval(),
            flush_only_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalStoreConfig {
    #[serde(default = "default_terminal_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_terminal_ttl")]
    pub ttl_secs: u64,
}

impl Default for TerminalStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: default_terminal_max_entries(),
            ttl_secs: default_terminal_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Default functions
fn default_evm_lookback() -> u64 {
    5
}

fn default_noble_lookback() -> u64 {
    3
}

fn default_noble_domain() -> u32 {
    4
}

fn default_workers() -> usize {
    4
}

fn default_evm_max_block_range() -> u64 {
    1000
}

fn default_noble_max_block_range() -> u64 {
    50
}

fn default_block_queue_size() -> usize {
    10_000
}

fn default_evm_poll_interval() -> u64 {
    12
}

fn default_noble_poll_interval() -> u64 {
    2
}

fn default_broadcast_retries() -> u32 {
    5
}

fn default_broadcast_retry_interval() -> u64 {
    5
}

fn default_balance_interval() -> u64 {
    60
}

fn default_gas_limit() -> u64 {
    200_000
}

fn default_gas_price() -> f64 {
    0.1
}

fn default_gas_denom() -> String {
    "uusdc".to_string()
}

fn default_bech32_prefix() -> String {
    "noble".to_string()
}

fn default_fetch_retries() -> u32 {
    10
}

fn default_fetch_retry_interval() -> u64 {
    10
}

fn default_attestation_timeout() -> u64 {
    10
}

fn default_processor_workers() -> usize {
    16
}

fn default_queue_size() -> usize {
    10_000
}

fn default_flush_interval() -> u64 {
    600
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_terminal_max_entries() -> usize {
    DEFAULT_TERMINAL_CACHE_SIZE
}

fn default_terminal_ttl() -> u64 {
    DEFAULT_TERMINAL_CACHE_TTL_SECS
}

impl Config {
    /// Load configuration. Loads .env if present, then reads the file named by
    /// `RELAYER_CONFIG` (default `config.yaml`) with `RELAYER__*` overrides.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("Failed to load .env file")?;
        }
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_file(&path)
    }

    /// Load from a specific config file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(eyre!("config file {} not found", path));
        }

        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("RELAYER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .wrap_err_with(|| format!("Failed to read config from {}", path))?
            .try_deserialize()
            .wrap_err("Failed to parse relayer configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .wrap_err("Failed to read YAML configuration")?
            .try_deserialize()
            .wrap_err("Failed to parse relayer configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Whether messages from `source` to `dest` should be relayed
    pub fn route_enabled(&self, source: u32, dest: u32) -> bool {
        self.enabled_routes
            .iter()
            .any(|r| r.source == source && r.destinations.contains(&dest))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(eyre!("at least one chain must be configured"));
        }

        let mut names = HashSet::new();
        let mut domains = HashSet::new();
        for chain in &self.chains {
            chain.validate()?;
            if !names.insert(chain.name().to_string()) {
                return Err(eyre!("duplicate chain name: {}", chain.name()));
            }
            if !domains.insert(chain.domain()) {
                return Err(eyre!("duplicate chain domain: {}", chain.domain()));
            }
        }

        for route in &self.enabled_routes {
            if !domains.contains(&route.source) {
                return Err(eyre!(
                    "enabled route source domain {} is not a configured chain",
                    route.source
                ));
            }
            for dest in &route.destinations {
                if !domains.contains(dest) {
                    return Err(eyre!(
                        "enabled route {} -> {} refers to an unconfigured destination domain",
                        route.source,
                        dest
                    ));
                }
            }
        }

        if self.circle.attestation_base_url.is_empty() {
            return Err(eyre!("circle.attestation_base_url cannot be empty"));
        }

        if self.processor.worker_count == 0 {
            return Err(eyre!("processor.worker_count must be greater than 0"));
        }

        if self.processor.queue_size == 0 {
            return Err(eyre!("processor.queue_size must be greater than 0"));
        }

        if self.api.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(eyre!(
                "api.listen_addr must be a socket address, got {}",
                self.api.listen_addr
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn evm_chain(name: &str, domain: u32) -> ChainConfig {
        ChainConfig::Evm(EvmChainConfig {
            name: name.to_string(),
            domain,
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            ws_url: None,
            message_transmitter: "0x0a992d191deec32afe36203ad87d7d289a738f81".to_string(),
            start_block: 0,
            lookback_period: default_evm_lookback(),
            workers: default_workers(),
            max_block_range: default_evm_max_block_range(),
            block_queue_size: default_block_queue_size(),
            poll_interval_secs: default_evm_poll_interval(),
            broadcast_retries: default_broadcast_retries(),
            broadcast_retry_interval_secs: default_broadcast_retry_interval(),
            balance_poll_interval_secs: default_balance_interval(),
            minter_private_key:
                "0x0000000000000000000000000000000000000000000000000000000000000001".to_string(),
        })
    }

    fn noble_chain() -> ChainConfig {
        ChainConfig::Noble(NobleChainConfig {
            name: "noble".to_string(),
            domain: 4,
            chain_id: "noble-1".to_string(),
            rpc_url: "http://localhost:26657".to_string(),
            lcd_url: "http://localhost:1317".to_string(),
            start_block: 0,
            lookback_period: default_noble_lookback(),
            workers: default_workers(),
            max_block_range: default_noble_max_block_range(),
            block_queue_size: default_block_queue_size(),
            poll_interval_secs: default_noble_poll_interval(),
            broadcast_retries: default_broadcast_retries(),
            broadcast_retry_interval_secs: default_broadcast_retry_interval(),
            balance_poll_interval_secs: default_balance_interval(),
            gas_limit: default_gas_limit(),
            gas_price: default_gas_price(),
            gas_denom: default_gas_denom(),
            bech32_prefix: default_bech32_prefix(),
            minter_mnemonic: TEST_MNEMONIC.to_string(),
        })
    }

    fn valid_config() -> Config {
        Config {
            chains: vec![evm_chain("ethereum", 0), noble_chain()],
            enabled_routes: vec![
                RouteConfig {
                    source: 0,
                    destinations: vec![4],
                },
                RouteConfig {
                    source: 4,
                    destinations: vec![0],
                },
            ],
            circle: CircleConfig {
                attestation_base_url: "https://iris-api.circle.com/attestations".to_string(),
                fetch_retries: default_fetch_retries(),
                fetch_retry_interval_secs: default_fetch_retry_interval(),
                request_timeout_secs: default_attestation_timeout(),
            },
            processor: ProcessorConfig::default(),
            flush: FlushConfig::default(),
            api: ApiConfig::default(),
            terminal_store: TerminalStoreConfig::default(),
            log_format: LogFormat::Text,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_route_to_unknown_domain_rejected() {
        let mut config = valid_config();
        config.enabled_routes.push(RouteConfig {
            source: 0,
            destinations: vec![7],
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains('7'), "{}", err);

        let mut config = valid_config();
        config.enabled_routes.push(RouteConfig {
            source: 9,
            destinations: vec![0],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_rpc_url_rejected() {
        let mut config = valid_config();
        if let ChainConfig::Evm(evm) = &mut config.chains[0] {
            evm.rpc_url = String::new();
        }
        assert!(config.validate().is_err());

        let mut config = valid_config();
        if let ChainConfig::Noble(noble) = &mut config.chains[1] {
            noble.lcd_url = String::new();
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let mut config = valid_config();
        config.chains.push(evm_chain("avalanche", 0));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("domain"), "{}", err);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut config = valid_config();
        config.chains.push(evm_chain("ethereum", 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = valid_config();
        config.processor.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        if let ChainConfig::Evm(evm) = &mut config.chains[0] {
            evm.broadcast_retries = 0;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_mnemonic_rejected() {
        let mut config = valid_config();
        if let ChainConfig::Noble(noble) = &mut config.chains[1] {
            noble.minter_mnemonic = "abandon about".to_string();
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_chains_rejected() {
        let mut config = valid_config();
        config.chains.clear();
        config.enabled_routes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_route_enabled() {
        let config = valid_config();
        assert!(config.route_enabled(0, 4));
        assert!(config.route_enabled(4, 0));
        assert!(!config.route_enabled(0, 0));
        assert!(!config.route_enabled(1, 4));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = valid_config();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("0x0000000000000000000000000000000000000000000000000000000000000001"));
        assert!(!debug.contains("abandon"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
chains:
  - kind: evm
    name: ethereum
    domain: 0
    chain_id: 1
    rpc_url: "http://localhost:8545"
    message_transmitter: "0x0a992d191deec32afe36203ad87d7d289a738f81"
    lookback_period: 10
    minter_private_key: "0x0000000000000000000000000000000000000000000000000000000000000001"
  - kind: noble
    name: noble
    chain_id: noble-1
    rpc_url: "http://localhost:26657"
    lcd_url: "http://localhost:1317"
    minter_mnemonic: "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
enabled_routes:
  - source: 0
    destinations: [4]
circle:
  attestation_base_url: "https://iris-api.circle.com/attestations"
flush:
  interval_secs: 60
  flush_only_mode: true
log_format: json
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chains[0].listener().lookback_period, 10);
        assert_eq!(config.chains[1].domain(), 4);
        assert_eq!(config.chains[1].listener().max_block_range, 50);
        assert!(config.route_enabled(0, 4));
        assert!(config.flush.flush_only_mode);
        assert_eq!(config.flush.interval_secs, 60);
        assert_eq!(config.processor.worker_count, 16);
        assert_eq!(config.circle.fetch_retries, 10);
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
