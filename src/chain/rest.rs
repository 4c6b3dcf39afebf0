use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::convert::TryFrom;
use std::str::FromStr;
use std::time::Duration;
use wavesexchange_log::debug;

use super::{
    coins_from_satoshis, ChainQuery, ChainTransaction, Config, TokenMetadata, TokenTransfer,
    TransferKind, TxInput, TxOutput, UnspentOutput,
};
use crate::error::Error;
use crate::models::{Outpoint, TokenIdentity, TOKEN_OVERLAY_ADDRESS_PREFIX};
use crate::utils::retry::with_backoff;

#[derive(Deserialize)]
struct BlockchainInfoDto {
    blocks: i32,
}

#[derive(Deserialize)]
struct BlockDetailsDto {
    #[serde(default)]
    tx: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxDetailsDto {
    txid: String,
    #[serde(default)]
    vin: Vec<VinDto>,
    #[serde(default)]
    vout: Vec<VoutDto>,
    blockheight: Option<i64>,
    fees: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VinDto {
    txid: Option<String>,
    vout: Option<i32>,
    // satoshis
    value: Option<i64>,
    cash_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoutDto {
    value: Value,
    n: i32,
    script_pub_key: Option<ScriptPubKeyDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptPubKeyDto {
    #[serde(default)]
    cash_addrs: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlpTxDetailsDto {
    token_info: Option<SlpTokenInfoDto>,
    #[serde(default)]
    token_is_valid: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlpTokenInfoDto {
    transaction_type: String,
    token_id_hex: String,
    #[serde(default)]
    send_outputs: Vec<String>,
    decimals: Option<u32>,
    genesis_or_mint_quantity: Option<String>,
}

#[derive(Deserialize)]
struct UtxoListDto {
    #[serde(default)]
    utxos: Vec<UtxoDto>,
}

#[derive(Deserialize)]
struct UtxoDto {
    txid: String,
    vout: i32,
    amount: Value,
    height: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlpUtxoDto {
    txid: String,
    vout: i32,
    token_id: String,
    token_qty: Value,
    height: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenStatsDto {
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: String,
    decimals: Option<i32>,
    version_type: Option<i32>,
    parent_id: Option<String>,
    image_url: Option<String>,
}

pub struct RestChainQuery {
    base_url: String,
    http_client: Client,
    max_attempts: u32,
    retry_delay: Duration,
}

impl RestChainQuery {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            base_url: config.rest_url.trim_end_matches('/').to_owned(),
            http_client: ClientBuilder::new()
                .timeout(config.request_timeout)
                .connect_timeout(config.request_timeout)
                .build()?,
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
        })
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(Url::parse(&format!("{}/{}", self.base_url, path))?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.get_optional_json(path)
            .await?
            .ok_or_else(|| Error::InvalidChainData(format!("{} not found", path)))
    }

    /// `Ok(None)` on 404; 5xx and 429 are retried.
    async fn get_optional_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        let url = self.url(path)?;
        with_backoff(path, self.max_attempts, self.retry_delay, || {
            self.fetch(url.clone())
        })
        .await
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, Error> {
        let res = self.http_client.get(url.clone()).send().await?;
        let status = res.status();
        debug!("url = {}, status = {}", url, status);
        if status.is_success() {
            Ok(Some(res.json::<T>().await?))
        } else if status == StatusCode::NOT_FOUND {
            Ok(None)
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(Error::ChainQueryError(format!("{} responded {}", url, status)))
        } else {
            Err(Error::InvalidChainData(format!("{} responded {}", url, status)))
        }
    }
}

#[async_trait]
impl ChainQuery for RestChainQuery {
    async fn list_block_transaction_ids(&self, block_number: i32) -> Result<Vec<String>, Error> {
        let details: BlockDetailsDto = self
            .get_json(&format!("block/detailsByHeight/{}", block_number))
            .await?;
        Ok(details.tx)
    }

    async fn get_transaction(
        &self,
        txid: &str,
        decode_overlay: bool,
    ) -> Result<ChainTransaction, Error> {
        let details: TxDetailsDto = self
            .get_json(&format!("transaction/details/{}", txid))
            .await?;
        let slp = if decode_overlay {
            self.get_optional_json::<SlpTxDetailsDto>(&format!("slp/txDetails/{}", txid))
                .await?
        } else {
            None
        };
        to_chain_transaction(details, slp)
    }

    async fn get_unspent_outputs(&self, address: &str) -> Result<Vec<UnspentOutput>, Error> {
        if address.starts_with(TOKEN_OVERLAY_ADDRESS_PREFIX) {
            let utxos: Vec<SlpUtxoDto> = self
                .get_optional_json(&format!("slp/utxos/{}", address))
                .await?
                .unwrap_or_default();
            utxos
                .into_iter()
                .map(|u| {
                    Ok(UnspentOutput {
                        token: TokenIdentity::try_from(u.token_id.as_str())?,
                        amount: decimal_from_json(&u.token_qty)?,
                        txid: u.txid,
                        index: u.vout,
                        block_height: confirmed_height(u.height),
                    })
                })
                .collect()
        } else {
            let list: UtxoListDto = self
                .get_optional_json(&format!("address/utxo/{}", address))
                .await?
                .unwrap_or(UtxoListDto { utxos: vec![] });
            list.utxos
                .into_iter()
                .map(|u| {
                    Ok(UnspentOutput {
                        token: TokenIdentity::BaseCurrency,
                        amount: decimal_from_json(&u.amount)?,
                        txid: u.txid,
                        index: u.vout,
                        block_height: confirmed_height(u.height),
                    })
                })
                .collect()
        }
    }

    async fn get_latest_block_number(&self) -> Result<i32, Error> {
        let info: BlockchainInfoDto = self.get_json("blockchain/getBlockchainInfo").await?;
        Ok(info.blocks)
    }

    async fn get_token_metadata(&self, tokenid: &str) -> Result<TokenMetadata, Error> {
        let stats: TokenStatsDto = self.get_json(&format!("slp/list/{}", tokenid)).await?;
        Ok(TokenMetadata {
            name: stats.name,
            ticker: stats.symbol,
            decimals: stats.decimals,
            token_type: stats.version_type,
            nft_group_id: stats.parent_id.filter(|id| !id.is_empty()),
            image_url: stats.image_url.filter(|url| !url.is_empty()),
        })
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<String, Error> {
        let url = self.url(&format!("rawtransactions/sendRawTransaction/{}", raw_tx))?;
        let res = self.http_client.post(url).send().await?;
        let status = res.status();
        if status.is_success() {
            Ok(res.json::<String>().await?)
        } else {
            let reason = res.text().await.unwrap_or_default();
            Err(Error::InvalidChainData(format!(
                "broadcast rejected with {}: {}",
                status, reason
            )))
        }
    }
}

fn confirmed_height(height: Option<i64>) -> Option<i32> {
    height.filter(|h| *h > 0).and_then(|h| i32::try_from(h).ok())
}

fn decimal_from_json(value: &Value) -> Result<BigDecimal, Error> {
    let repr = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(Error::InvalidAmount(other.to_string())),
    };
    BigDecimal::from_str(&repr).map_err(|_| Error::InvalidAmount(repr))
}

fn scaled(raw: &str, decimals: Option<u32>) -> Result<BigDecimal, Error> {
    let amount = BigDecimal::from_str(raw).map_err(|_| Error::InvalidAmount(raw.to_owned()))?;
    Ok(match decimals {
        Some(d) if d > 0 => amount / BigDecimal::from(10i64.pow(d.min(18))),
        _ => amount,
    })
}

fn to_chain_transaction(
    details: TxDetailsDto,
    slp: Option<SlpTxDetailsDto>,
) -> Result<ChainTransaction, Error> {
    let inputs = details
        .vin
        .into_iter()
        .filter_map(|vin| match (vin.txid, vin.vout) {
            (Some(txid), Some(index)) => Some(TxInput {
                address: vin.cash_address,
                value: coins_from_satoshis(vin.value.unwrap_or(0)),
                prevout: Outpoint::new(txid, index),
            }),
            // coinbase
            _ => None,
        })
        .collect();

    let mut outputs = details
        .vout
        .iter()
        .map(|vout| {
            Ok(TxOutput {
                address: vout
                    .script_pub_key
                    .as_ref()
                    .and_then(|spk| spk.cash_addrs.first().cloned()),
                value: decimal_from_json(&vout.value)?,
                index: vout.n,
                token_amount: None,
            })
        })
        .collect::<Result<Vec<TxOutput>, Error>>()?;

    let mut valid = true;
    let token = match slp.and_then(|s| s.token_info.map(|info| (info, s.token_is_valid))) {
        Some((info, token_is_valid)) => {
            let kind = match info.transaction_type.to_ascii_uppercase().as_str() {
                "GENESIS" => TransferKind::Genesis,
                "MINT" => TransferKind::Mint,
                _ => TransferKind::Send,
            };
            match kind {
                TransferKind::Send => {
                    for (index, raw) in info.send_outputs.iter().enumerate().skip(1) {
                        if let Some(out) = outputs.iter_mut().find(|o| o.index as usize == index) {
                            out.token_amount = Some(scaled(raw, info.decimals)?);
                        }
                    }
                }
                TransferKind::Genesis | TransferKind::Mint => {
                    if let (Some(qty), Some(out)) = (
                        info.genesis_or_mint_quantity.as_deref(),
                        outputs.iter_mut().find(|o| o.index == 1),
                    ) {
                        out.token_amount = Some(scaled(qty, info.decimals)?);
                    }
                }
            }
            valid = token_is_valid;
            Some(TokenTransfer {
                token: TokenIdentity::try_from(info.token_id_hex.as_str())?,
                kind,
                valid: token_is_valid,
            })
        }
        None => None,
    };

    Ok(ChainTransaction {
        txid: details.txid,
        block_height: confirmed_height(details.blockheight),
        inputs,
        outputs,
        tx_fee: details.fees.as_ref().map(decimal_from_json).transpose()?,
        valid,
        token,
    })
}
