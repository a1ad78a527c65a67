//! Noble LCD client for queries, transaction signing and broadcasting
//!
//! Signs `MsgReceiveMessage` with cosmrs and broadcasts via the LCD REST API.

use std::time::Duration;

use bip39::Mnemonic;
use cosmrs::{
    bip32::DerivationPath,
    crypto::secp256k1::SigningKey,
    tx::{self, Fee, SignDoc, SignerInfo},
    AccountId, Any, Coin,
};
use eyre::{eyre, Result, WrapErr};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::NobleChainConfig;

/// Cosmos derivation path (coin type 118)
const NOBLE_DERIVATION_PATH: &str = "m/44'/118'/0'/0/0";

/// Page size for LCD tx search
const TX_PAGE_LIMIT: u64 = 100;

pub const MSG_RECEIVE_MESSAGE_TYPE_URL: &str = "/circle.cctp.v1.MsgReceiveMessage";

/// `circle.cctp.v1.MsgReceiveMessage`
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgReceiveMessage {
    #[prost(string, tag = "1")]
    pub from: String,
    #[prost(bytes = "vec", tag = "2")]
    pub message: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub attestation: Vec<u8>,
}

impl MsgReceiveMessage {
    pub fn to_any(&self) -> Any {
        Any {
            type_url: MSG_RECEIVE_MESSAGE_TYPE_URL.to_string(),
            value: prost::Message::encode_to_vec(self),
        }
    }
}

/// Account info from LCD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub sequence: u64,
    pub account_number: u64,
}

/// Response types for LCD tx search
#[derive(Debug, Deserialize)]
pub struct TxSearchResponse {
    #[serde(default)]
    pub tx_responses: Vec<TxResponse>,
    /// Total matches across all pages (SDK 0.47+)
    #[serde(default)]
    pub total: Option<String>,
    #[serde(default)]
    pub pagination: Option<PageResponse>,
}

#[derive(Debug, Deserialize)]
pub struct PageResponse {
    #[serde(default)]
    pub total: Option<String>,
}

impl TxSearchResponse {
    /// Total match count, from the top level or the legacy pagination block
    pub fn total(&self) -> Option<u64> {
        self.total
            .as_deref()
            .or_else(|| self.pagination.as_ref().and_then(|p| p.total.as_deref()))
            .and_then(|t| t.parse().ok())
            .filter(|t| *t > 0)
    }
}

#[derive(Debug, Deserialize)]
pub struct TxResponse {
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub type_str: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Deserialize)]
pub struct Attribute {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Option<BalanceCoin>,
}

#[derive(Debug, Deserialize)]
struct BalanceCoin {
    amount: String,
}

/// Noble client for signing and broadcasting transactions
pub struct NobleClient {
    lcd_url: String,
    chain_id: String,
    signing_key: SigningKey,
    /// Minter account address
    pub address: AccountId,
    gas_limit: u64,
    gas_price: f64,
    gas_denom: String,
    client: Client,
}

impl NobleClient {
    /// Create a new Noble client from the minter mnemonic
    pub fn new(config: &NobleChainConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to create HTTP client")?;

        let mnemonic = Mnemonic::parse(&config.minter_mnemonic)
            .map_err(|e| eyre!("Invalid mnemonic: {}", e))?;

        let seed = mnemonic.to_seed("");
        let path: DerivationPath = NOBLE_DERIVATION_PATH
            .parse()
            .map_err(|e| eyre!("Invalid derivation path: {:?}", e))?;

        let signing_key = SigningKey::derive_from_path(seed, &path)
            .map_err(|e| eyre!("Failed to derive signing key: {}", e))?;

        let address = signing_key
            .public_key()
            .account_id(&config.bech32_prefix)
            .map_err(|e| eyre!("Failed to get account ID: {}", e))?;

        info!(
            address = %address,
            chain_id = %config.chain_id,
            "Noble client initialized"
        );

        Ok(Self {
            lcd_url: config.lcd_url.trim_end_matches('/').to_string(),
            chain_id: config.chain_id.clone(),
            signing_key,
            address,
            gas_limit: config.gas_limit,
            gas_price: config.gas_price,
            gas_denom: config.gas_denom.clone(),
            client,
        })
    }

    pub fn gas_denom(&self) -> &str {
        &self.gas_denom
    }

    /// Get account info (sequence and account number)
    pub async fn get_account_info(&self) -> Result<AccountInfo> {
        let url = format!(
            "{}/cosmos/auth/v1beta1/accounts/{}",
            self.lcd_url, self.address
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("Failed to query account info")?;

        if !response.status().is_success() {
            return Err(eyre!(
                "Account query failed: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }

        let data: serde_json::Value = response.json().await?;
        parse_account_info(&data)
    }

    /// Whether `(source_domain, nonce)` has been received on Noble
    pub async fn nonce_used(&self, source_domain: u32, nonce: u64) -> Result<bool> {
        let url = format!(
            "{}/circle/cctp/v1/used_nonces/{}/{}",
            self.lcd_url, source_domain, nonce
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("Failed to query used nonce")?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(eyre!(
                "Used nonce query failed: {} - {}",
                s,
                response.text().await.unwrap_or_default()
            )),
        }
    }

    /// Minter balance in the gas denom
    pub async fn balance(&self) -> Result<u128> {
        let url = format!(
            "{}/cosmos/bank/v1beta1/balances/{}/by_denom?denom={}",
            self.lcd_url, self.address, self.gas_denom
        );

        let response: BalanceResponse = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("Failed to query balance")?
            .error_for_status()
            .wrap_err("Balance query failed")?
            .json()
            .await
            .wrap_err("Failed to parse balance response")?;

        match response.balance {
            Some(coin) => coin
                .amount
                .parse()
                .wrap_err_with(|| format!("Invalid balance amount {}", coin.amount)),
            None => Ok(0),
        }
    }

    /// Every transaction included at `height`, across all result pages
    pub async fn txs_at_height(&self, height: u64) -> Result<Vec<TxResponse>> {
        let mut txs = Vec::new();
        let mut page = 1u64;

        loop {
            let response = self.tx_search_page(height, page).await?;
            let fetched = response.tx_responses.len() as u64;
            let total = response.total();
            txs.extend(response.tx_responses);

            if !has_more_pages(txs.len() as u64, fetched, total) {
                break;
            }
            page += 1;
        }

        if page > 1 {
            debug!(height, pages = page, txs = txs.len(), "Fetched paged transactions");
        }
        Ok(txs)
    }

    async fn tx_search_page(&self, height: u64, page: u64) -> Result<TxSearchResponse> {
        let url = format!(
            "{}/cosmos/tx/v1beta1/txs?events=tx.height={}&page={}&limit={}",
            self.lcd_url, height, page, TX_PAGE_LIMIT
        );

        self.client
            .get(&url)
            .send()
            .await
            .wrap_err("Failed to query transactions")?
            .error_for_status()
            .wrap_err_with(|| format!("Transaction query failed at height {}", height))?
            .json()
            .await
            .wrap_err("Failed to parse transaction response")
    }

    /// Sign and broadcast `MsgReceiveMessage` with the given account sequence
    pub async fn receive_message(
        &self,
        message: &[u8],
        attestation: &[u8],
        sequence: u64,
    ) -> Result<String> {
        let account_info = self.get_account_info().await?;

        let msg = MsgReceiveMessage {
            from: self.address.to_string(),
            message: message.to_vec(),
            attestation: attestation.to_vec(),
        };

        let body = tx::Body::new(vec![msg.to_any()], "", 0u32);

        let public_key = self.signing_key.public_key();
        let signer_info = SignerInfo::single_direct(Some(public_key), sequence);

        let fee_amount = ((self.gas_limit as f64) * self.gas_price).ceil() as u128;
        let fee = Fee::from_amount_and_gas(
            Coin {
                denom: self
                    .gas_denom
                    .parse()
                    .map_err(|e| eyre!("Invalid gas denom: {}", e))?,
                amount: fee_amount,
            },
            self.gas_limit,
        );

        let auth_info = signer_info.auth_info(fee);

        let chain_id = self
            .chain_id
            .parse()
            .map_err(|_| eyre!("Invalid chain ID"))?;

        let sign_doc = SignDoc::new(&body, &auth_info, &chain_id, account_info.account_number)
            .map_err(|e| eyre!("Failed to create sign doc: {}", e))?;

        let tx_raw = sign_doc
            .sign(&self.signing_key)
            .map_err(|e| eyre!("Failed to sign transaction: {}", e))?;

        let tx_bytes = tx_raw
            .to_bytes()
            .map_err(|e| eyre!("Failed to serialize transaction: {}", e))?;

        self.broadcast_tx(&tx_bytes).await
    }

    /// Broadcast a signed transaction
    async fn broadcast_tx(&self, tx_bytes: &[u8]) -> Result<String> {
        let tx_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, tx_bytes);

        let broadcast_request = serde_json::json!({
            "tx_bytes": tx_b64,
            "mode": "BROADCAST_MODE_SYNC"
        });

        let broadcast_url = format!("{}/cosmos/tx/v1beta1/txs", self.lcd_url);
        debug!(url = %broadcast_url, "Broadcasting transaction");

        let response = self
            .client
            .post(&broadcast_url)
            .json(&broadcast_request)
            .send()
            .await
            .map_err(|e| eyre!("Network error: {}", e))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({"error": "Failed to parse response"}));

        if !status.is_success() {
            return Err(eyre!("Broadcast failed ({}): {}", status, body));
        }

        let tx_response = body
            .get("tx_response")
            .ok_or_else(|| eyre!("Broadcast failed: {}", body))?;

        let code = tx_response
            .get("code")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        if code != 0 {
            let raw_log = tx_response
                .get("raw_log")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            return Err(eyre!("Transaction failed (code {}): {}", code, raw_log));
        }

        let txhash = tx_response
            .get("txhash")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        info!(txhash = %txhash, "Transaction broadcast successful");
        Ok(txhash)
    }
}

/// Extract sequence and account number from an auth account response.
/// Handles plain and vesting/module account layouts.
pub fn parse_account_info(data: &serde_json::Value) -> Result<AccountInfo> {
    let account = data
        .get("account")
        .ok_or_else(|| eyre!("Missing 'account' field in response"))?;

    let field = |name: &str| -> Result<u64> {
        let value = account
            .get(name)
            .or_else(|| account.get("base_account").and_then(|b| b.get(name)))
            .ok_or_else(|| eyre!("Missing '{}' in account response", name))?;
        let text = value
            .as_str()
            .ok_or_else(|| eyre!("Expected string '{}' in account response, got {}", name, value))?;
        text.parse::<u64>()
            .wrap_err_with(|| format!("Invalid '{}' in account response: {}", name, text))
    };

    Ok(AccountInfo {
        sequence: field("sequence")?,
        account_number: field("account_number")?,
    })
}

/// Whether another tx search page is needed. Without a reported total, a
/// full page means more may follow.
fn has_more_pages(collected: u64, fetched: u64, total: Option<u64>) -> bool {
    if fetched == 0 {
        return false;
    }
    match total {
        Some(total) => collected < total,
        None => fetched >= TX_PAGE_LIMIT,
    }
}

/// Raw CCTP message bytes from a `circle.cctp.v1.MessageSent` event attribute.
/// The attribute value is a JSON string holding base64.
pub fn decode_message_attribute(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim().trim_matches('"');
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, trimmed)
        .wrap_err("Invalid base64 in MessageSent attribute")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_path() {
        let path: std::result::Result<DerivationPath, _> = NOBLE_DERIVATION_PATH.parse();
        assert!(path.is_ok());
    }

    #[test]
    fn test_msg_receive_message_any() {
        let msg = MsgReceiveMessage {
            from: "noble1xyz".to_string(),
            message: vec![1, 2, 3],
            attestation: vec![4, 5],
        };
        let any = msg.to_any();
        assert_eq!(any.type_url, "/circle.cctp.v1.MsgReceiveMessage");
        let decoded: MsgReceiveMessage = prost::Message::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_parse_account_info_layouts() {
        let plain = serde_json::json!({
            "account": {"sequence": "12", "account_number": "34"}
        });
        assert_eq!(
            parse_account_info(&plain).unwrap(),
            AccountInfo { sequence: 12, account_number: 34 }
        );

        let vesting = serde_json::json!({
            "account": {"base_account": {"sequence": "5", "account_number": "6"}}
        });
        assert_eq!(
            parse_account_info(&vesting).unwrap(),
            AccountInfo { sequence: 5, account_number: 6 }
        );

        assert!(parse_account_info(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_account_info_rejects_missing_fields() {
        let no_sequence = serde_json::json!({
            "account": {"account_number": "34"}
        });
        assert!(parse_account_info(&no_sequence).is_err());

        let malformed = serde_json::json!({
            "account": {"sequence": "twelve", "account_number": "34"}
        });
        assert!(parse_account_info(&malformed).is_err());

        let numeric = serde_json::json!({
            "account": {"sequence": 12, "account_number": "34"}
        });
        assert!(parse_account_info(&numeric).is_err());
    }

    #[test]
    fn test_has_more_pages() {
        assert!(has_more_pages(100, 100, Some(250)));
        assert!(has_more_pages(200, 100, Some(250)));
        assert!(!has_more_pages(250, 50, Some(250)));
        assert!(!has_more_pages(100, 0, Some(250)));

        assert!(has_more_pages(100, TX_PAGE_LIMIT, None));
        assert!(!has_more_pages(40, 40, None));
    }

    #[test]
    fn test_tx_search_total() {
        let top_level: TxSearchResponse =
            serde_json::from_str(r#"{"tx_responses": [], "total": "250"}"#).unwrap();
        assert_eq!(top_level.total(), Some(250));

        let legacy: TxSearchResponse = serde_json::from_str(
            r#"{"tx_responses": [], "pagination": {"next_key": null, "total": "7"}}"#,
        )
        .unwrap();
        assert_eq!(legacy.total(), Some(7));

        let missing: TxSearchResponse = serde_json::from_str(r#"{"tx_responses": []}"#).unwrap();
        assert_eq!(missing.total(), None);
    }

    #[test]
    fn test_decode_message_attribute() {
        assert_eq!(decode_message_attribute("\"AQID\"").unwrap(), vec![1, 2, 3]);
        assert_eq!(decode_message_attribute("AQID").unwrap(), vec![1, 2, 3]);
        assert!(decode_message_attribute("\"***\"").is_err());
    }

    #[test]
    fn test_tx_search_response_parsing() {
        let json = r#"{
            "tx_responses": [{
                "txhash": "ABC",
                "height": "10",
                "code": 0,
                "events": [{"type": "circle.cctp.v1.MessageSent", "attributes": [{"key": "message", "value": "\"AQID\"", "index": true}]}]
            }]
        }"#;
        let parsed: TxSearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.tx_responses[0].txhash, "ABC");
        assert_eq!(parsed.tx_responses[0].events[0].attributes[0].key, "message");
    }
}
