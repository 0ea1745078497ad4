use std::path::PathBuf;
use bitcoin::address::ParseError as BitcoinAddressError;
use bitcoin::amount::ParseAmountError;
use bitcoin::bip32::Error as Bip32Error;
use bitcoin::psbt::Error as PsbtError;
use bitcoin::sighash::P2wpkhError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bitcoinアドレスエラー: {0}")]
    BitcoinAddress(#[from] BitcoinAddressError),

    #[error("金額の解析に失敗しました: {0}")]
    Amount(#[from] ParseAmountError),

    #[error("BIP32鍵導出エラー: {0}")]
    Bip32(#[from] Bip32Error),

    #[error("リカバリーフレーズエラー: {0}")]
    Mnemonic(#[from] bip39::Error),

    #[error("PSBTエラー: {0}")]
    Psbt(#[from] PsbtError),

    #[error("Sighash計算エラー (入力インデックス {input_index}): {source}")]
    SighashError {
        input_index: usize,
        #[source]
        source: P2wpkhError,
    },

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("資金不足: 利用可能な総額 {available} sats, 要求額 {required} sats")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("手数料分の資金不足: 選択済み {selected} sats, 送金額 {amount} sats, 手数料 {fee} sats")]
    InsufficientForFee { selected: u64, amount: u64, fee: u64 },

    #[error("署名鍵が見つかりません (入力インデックス {input_index}, script {script_hex})")]
    KeyNotFound {
        input_index: usize,
        script_hex: String,
    },

    #[error("ネットワークエラー: {0}")]
    NetworkFailure(String),

    #[error("トランザクション構築エラー: {0}")]
    TransactionBuild(String),

    #[error("ストアエラー: {0}")]
    Store(String),

    #[error("内部エラー: {0}")]
    Internal(String),
}

impl AppError {
    /// エクスプローラとの通信失敗を NetworkFailure にまとめる
    pub fn network(context: &str, err: impl std::fmt::Display) -> Self {
        AppError::NetworkFailure(format!("{}: {}", context, err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::network("HTTPリクエスト失敗", err)
    }
}
