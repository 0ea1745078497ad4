use std::collections::HashSet;
use std::fmt;
use bitcoin::{Address, Amount, Network, Txid};

use crate::{
    error::AppError,
    explorer::{BroadcastSink, OutputSource},
    keys::{KeyDeriver, KeyRing},
    transaction::{self, SendRequest},
    types::{Branch, KeyCandidate, SpendableOutput},
};

/// 受取・おつりの現在インデックス。ブロードキャスト成功後にだけ進める
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletSession {
    pub receive_index: u32,
    pub change_index: u32,
}

/// 送金1回の進行段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    Idle,
    Building,
    Selecting,
    Signing,
    Finalized,
    Broadcast,
}

impl fmt::Display for SendStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub outputs: Vec<SpendableOutput>,
    pub total: Amount,
}

#[derive(Debug, Clone)]
pub struct SendReport {
    pub txid: Txid,
    pub amount: Amount,
    pub fee: Amount,
    pub change: Option<Amount>,
}

pub struct Wallet<E> {
    keys: KeyRing,
    session: WalletSession,
    explorer: E,
    stage: SendStage,
}

impl<E> Wallet<E>
where
    E: OutputSource + BroadcastSink,
{
    pub fn new(deriver: KeyDeriver, session: WalletSession, lookahead: u32, explorer: E) -> Self {
        let mut keys = KeyRing::new(deriver, lookahead);
        keys.set_window(session.receive_index, session.change_index);
        Wallet { keys, session, explorer, stage: SendStage::Idle }
    }

    pub fn network(&self) -> Network {
        self.keys.deriver().network()
    }

    pub fn session(&self) -> WalletSession {
        self.session
    }

    pub fn stage(&self) -> SendStage {
        self.stage
    }

    pub fn receive_address(&mut self) -> Result<KeyCandidate, AppError> {
        self.keys.issue(Branch::Receiving, self.session.receive_index)
    }

    pub fn change_address(&mut self) -> Result<KeyCandidate, AppError> {
        self.keys.issue(Branch::Change, self.session.change_index)
    }

    pub fn new_receive_address(&mut self) -> Result<KeyCandidate, AppError> {
        self.session.receive_index += 1;
        self.keys.set_window(self.session.receive_index, self.session.change_index);
        self.receive_address()
    }

    /// 発行済みの全アドレスについて UTXO を集める (outpoint で重複排除)
    pub async fn refresh(&mut self) -> Result<Balance, AppError> {
        let mut addresses: Vec<Address> = Vec::new();
        for index in 0..=self.session.receive_index {
            addresses.push(self.keys.issue(Branch::Receiving, index)?.address);
        }
        for index in 0..=self.session.change_index {
            addresses.push(self.keys.issue(Branch::Change, index)?.address);
        }

        let mut seen = HashSet::new();
        let mut outputs = Vec::new();
        for address in &addresses {
            for output in self.explorer.fetch_outputs(address).await? {
                if seen.insert(output.out_point) {
                    outputs.push(output);
                }
            }
        }
        let total = outputs
            .iter()
            .try_fold(Amount::ZERO, |acc, output| acc.checked_add(output.value))
            .ok_or_else(|| AppError::network("UTXO合計額が範囲外です", format!("{} 件", outputs.len())))?;
        log::info!("残高: {} sats (UTXO {} 件)", total.to_sat(), outputs.len());
        Ok(Balance { outputs, total })
    }

    fn enter(&mut self, stage: SendStage) {
        log::debug!("送金ステージ: {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    /// 残高取得 → 構築 → 署名 → ブロードキャスト。失敗時は Idle に戻り状態を残さない
    pub async fn send(&mut self, to: &str, amount_btc: &str, fee_rate: f64) -> Result<SendReport, AppError> {
        self.enter(SendStage::Building);
        let result = self.try_send(to, amount_btc, fee_rate).await;
        if let Err(e) = &result {
            log::warn!("送金を中断しました ({}): {}", self.stage, e);
        }
        self.enter(SendStage::Idle);
        result
    }

    async fn try_send(&mut self, to: &str, amount_btc: &str, fee_rate: f64) -> Result<SendReport, AppError> {
        let network = self.network();
        let request = SendRequest {
            destination: transaction::parse_destination(to, network)?,
            amount: transaction::parse_amount_btc(amount_btc)?,
            fee_rate_sat_per_vb: transaction::normalize_fee_rate(fee_rate),
        };
        let balance = self.refresh().await?;

        self.enter(SendStage::Selecting);
        let plan = transaction::plan_fee(&balance.outputs, request.amount, request.fee_rate_sat_per_vb)?;
        let change_script = self.change_address()?.script_pubkey;
        let draft = transaction::assemble_draft(&plan, &request, change_script)?;

        self.enter(SendStage::Signing);
        let secp = self.keys.deriver().secp().clone();
        let finalized = transaction::sign_draft(draft, &mut self.keys, &secp)?;

        self.enter(SendStage::Finalized);
        log::debug!("Raw transaction hex: {}", finalized.raw_hex);
        let txid = self.explorer.broadcast(&finalized.raw_hex).await?;

        self.enter(SendStage::Broadcast);
        if txid != finalized.txid {
            log::warn!("エクスプローラの txid {} がローカル計算 {} と一致しません。", txid, finalized.txid);
        }
        self.session.receive_index += 1;
        self.session.change_index += 1;
        self.keys.set_window(self.session.receive_index, self.session.change_index);
        log::info!("送金完了: {}", txid);

        Ok(SendReport {
            txid,
            amount: request.amount,
            fee: finalized.fee,
            change: finalized.change,
        })
    }
}
