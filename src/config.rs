use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;

use crate::{
    error::AppError,
    explorer::DEFAULT_EXPLORER_URL,
    fiat_server::DEFAULT_FIAT_BIND,
    keys::DEFAULT_LOOKAHEAD,
};

/// 設定ファイル (JSON)。省略したキーは既定値になる
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletConfig {
    pub network: String, // "bitcoin", "testnet", "signet", "regtest"
    pub explorer_url: String,
    pub store_path: PathBuf,
    pub lookahead: u32,
    pub fiat_bind: String,
    pub request_timeout_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            network: "testnet".to_string(),
            explorer_url: DEFAULT_EXPLORER_URL.to_string(),
            store_path: PathBuf::from("wallet-store.json"),
            lookahead: DEFAULT_LOOKAHEAD,
            fiat_bind: DEFAULT_FIAT_BIND.to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl WalletConfig {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            log::error!("設定ファイルの読み込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })?;
        serde_json::from_str(&content).map_err(|e| AppError::JsonParse {
            file_path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
