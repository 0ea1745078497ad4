use std::str::FromStr;
use std::time::Duration;
use async_trait::async_trait;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Txid};
use serde::Deserialize;

use crate::{error::AppError, types::SpendableOutput};

pub const DEFAULT_EXPLORER_URL: &str = "https://blockstream.info/testnet/api";

/// アドレスの未使用出力を返す外部ソース
#[async_trait]
pub trait OutputSource {
    async fn fetch_outputs(&self, address: &Address) -> Result<Vec<SpendableOutput>, AppError>;
}

/// シリアライズ済みトランザクションをネットワークへ送る
#[async_trait]
pub trait BroadcastSink {
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, AppError>;
}

/// `GET /address/:addr/utxo` の1要素
#[derive(Deserialize, Debug)]
pub struct UtxoRecord {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub scriptpubkey: Option<String>,
    #[serde(default)]
    pub status: Option<UtxoStatus>,
}

#[derive(Deserialize, Debug)]
pub struct UtxoStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u32>,
}

impl UtxoRecord {
    /// スクリプトが無い場合は問い合わせたアドレスのものを使う
    pub fn into_spendable(self, queried: &Address) -> Result<SpendableOutput, AppError> {
        let txid = Txid::from_str(&self.txid)
            .map_err(|e| AppError::network("不正なtxid", format!("{} ({})", self.txid, e)))?;
        let script_pubkey = match self.scriptpubkey {
            Some(hex_script) => ScriptBuf::from_bytes(
                hex::decode(&hex_script).map_err(|e| AppError::network("不正なscriptpubkey", e))?,
            ),
            None => queried.script_pubkey(),
        };
        let value = Amount::from_sat(self.value);
        if value == Amount::ZERO || value > Amount::MAX_MONEY {
            return Err(AppError::network(
                "不正なUTXO",
                format!("{}:{} の金額 {} sats は範囲外です", self.txid, self.vout, self.value),
            ));
        }
        match &self.status {
            Some(UtxoStatus { confirmed: false, .. }) => {
                log::info!("未承認のUTXOを含めます: {}:{} ({} sats)", self.txid, self.vout, self.value);
            }
            Some(UtxoStatus { block_height: Some(height), .. }) => {
                log::debug!("UTXO {}:{} はブロック {} で承認済み", self.txid, self.vout, height);
            }
            _ => {}
        }
        SpendableOutput::new(OutPoint::new(txid, self.vout), value, script_pubkey)
    }
}

pub fn parse_utxo_response(body: &str, queried: &Address) -> Result<Vec<SpendableOutput>, AppError> {
    let records: Vec<UtxoRecord> =
        serde_json::from_str(body).map_err(|e| AppError::network("UTXO応答のパース失敗", e))?;
    records.into_iter().map(|record| record.into_spendable(queried)).collect()
}

/// POST /tx の応答本文は txid のみ
pub fn parse_broadcast_response(body: &str) -> Result<Txid, AppError> {
    let trimmed = body.trim();
    Txid::from_str(trimmed).map_err(|_| AppError::network("ブロードキャスト応答が不正です", trimmed))
}

/// Esplora REST API クライアント
#[derive(Debug, Clone)]
pub struct EsploraClient {
    http: reqwest::Client,
    base_url: String,
}

impl EsploraClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(EsploraClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl OutputSource for EsploraClient {
    async fn fetch_outputs(&self, address: &Address) -> Result<Vec<SpendableOutput>, AppError> {
        let url = format!("{}/address/{}/utxo", self.base_url, address);
        log::debug!("UTXO取得: {}", url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::network(&format!("UTXO取得失敗 (HTTP {})", status.as_u16()), body));
        }
        let outputs = parse_utxo_response(&body, address)?;
        log::info!("{} のUTXO {} 件を取得しました。", address, outputs.len());
        Ok(outputs)
    }
}

#[async_trait]
impl BroadcastSink for EsploraClient {
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, AppError> {
        let url = format!("{}/tx", self.base_url);
        log::info!("トランザクションをブロードキャストします: {}", url);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "text/plain")
            .body(raw_tx_hex.to_string())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            log::error!("ブロードキャスト失敗: {}", body);
            return Err(AppError::network(&format!("ブロードキャスト失敗 (HTTP {})", status.as_u16()), body.trim()));
        }
        parse_broadcast_response(&body)
    }
}
