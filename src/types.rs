use std::fmt;
use bitcoin::{
    psbt::Psbt, secp256k1::SecretKey, Address, Amount, CompressedPublicKey, OutPoint, ScriptBuf,
    Transaction, TxOut, Txid,
};
use crate::error::AppError;

/// 導出ツリーの枝。受取用 (0) とおつり用 (1)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Branch {
    Receiving = 0,
    Change = 1,
}

impl Branch {
    pub const ALL: [Branch; 2] = [Branch::Receiving, Branch::Change];

    pub fn index(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Receiving => write!(f, "receiving"),
            Branch::Change => write!(f, "change"),
        }
    }
}

/// エクスプローラから取得した未使用出力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableOutput {
    pub out_point: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

impl SpendableOutput {
    /// value は 1 sat 以上 MAX_MONEY 以下でなければならない
    pub fn new(out_point: OutPoint, value: Amount, script_pubkey: ScriptBuf) -> Result<Self, AppError> {
        if value == Amount::ZERO {
            return Err(AppError::InputValidation(format!(
                "金額0のUTXOは扱えません: {}",
                out_point
            )));
        }
        if value > Amount::MAX_MONEY {
            return Err(AppError::InputValidation(format!(
                "UTXOの金額が上限を超えています: {} ({} sats)",
                out_point,
                value.to_sat()
            )));
        }
        Ok(SpendableOutput { out_point, value, script_pubkey })
    }

    /// 署名に必要な参照先出力 (witness_utxo)
    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// (branch, index) から導出した鍵とそのロックスクリプト
#[derive(Debug, Clone)]
pub struct KeyCandidate {
    pub branch: Branch,
    pub index: u32,
    pub derivation_path: String,
    pub secret_key: SecretKey,
    pub public_key: CompressedPublicKey,
    pub script_pubkey: ScriptBuf,
    pub address: Address,
}

/// 送金1回分の未署名ドラフト。永続化はしない
#[derive(Debug, Clone)]
pub struct DraftTransaction {
    pub psbt: Psbt,
    pub fee_rate_sat_per_vb: u64,
    pub estimated_vsize: u64,
    pub fee: Amount,
    pub change: Option<Amount>,
}

impl DraftTransaction {
    pub fn input_count(&self) -> usize {
        self.psbt.unsigned_tx.input.len()
    }

    pub fn output_count(&self) -> usize {
        self.psbt.unsigned_tx.output.len()
    }
}

/// 署名・ファイナライズ済みでブロードキャスト可能なトランザクション
#[derive(Debug, Clone)]
pub struct FinalizedTransaction {
    pub transaction: Transaction,
    pub txid: Txid,
    pub raw_hex: String,
    pub fee: Amount,
    pub change: Option<Amount>,
}
