use clap::{Parser, Subcommand};
use std::path::PathBuf;
use bitcoin::Network as BitcoinNetwork;
use crate::{config::WalletConfig, error::AppError};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 設定ファイル(JSON)へのパス
    #[clap(short, long, value_parser, env = "WALLET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// 使用するネットワーク ("bitcoin", "testnet", "signet", "regtest")
    #[clap(short, long, value_parser, env = "WALLET_NETWORK", global = true)]
    pub network: Option<String>,

    /// リカバリーフレーズとインデックスを保存するファイル
    #[clap(long, value_parser, env = "WALLET_STORE", global = true)]
    pub store: Option<PathBuf>,

    /// Esplora API のベースURL
    #[clap(long, value_parser, env = "WALLET_EXPLORER_URL", global = true)]
    pub explorer_url: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// リカバリーフレーズの表示・再生成
    Seed {
        #[clap(subcommand)]
        action: SeedAction,
    },
    /// 受取アドレスを表示する
    Address {
        /// 次のインデックスのアドレスを発行する
        #[clap(long)]
        new: bool,
    },
    /// 残高とUTXOを表示する
    Balance,
    /// 送金する
    Send {
        /// 送金先アドレス
        #[clap(long)]
        to: String,
        /// 送金額 (BTC)
        #[clap(long)]
        amount: String,
        /// 手数料率 (sat/vB)
        #[clap(long, default_value_t = 5.0)]
        fee_rate: f64,
    },
    /// 法定通貨サンドボックス
    Fiat {
        #[clap(subcommand)]
        action: FiatAction,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum SeedAction {
    Show,
    New,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum FiatAction {
    /// モックAPIサーバを起動する
    Serve {
        #[clap(long)]
        bind: Option<String>,
    },
}

impl CliArgs {
    /// CLI指定 > 設定ファイル > 既定値
    pub fn merge_into(&self, mut config: WalletConfig) -> WalletConfig {
        if let Some(network) = &self.network {
            config.network = network.clone();
        }
        if let Some(store) = &self.store {
            config.store_path = store.clone();
        }
        if let Some(url) = &self.explorer_url {
            config.explorer_url = url.clone();
        }
        config
    }
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "signet" => Ok(BitcoinNetwork::Signet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}
