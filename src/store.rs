use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use bip39::Mnemonic;
use bitcoin::secp256k1::rand::{thread_rng, RngCore};

use crate::{error::AppError, wallet::WalletSession};

const MNEMONIC_KEY: &str = "mnemonic";
const RECEIVE_INDEX_KEY: &str = "receiveIndex";
const CHANGE_INDEX_KEY: &str = "changeIndex";

// 256ビットのエントロピー = 24語
const ENTROPY_BYTES: usize = 32;

/// 文字列キーと文字列値だけを持つ JSON ファイル。暗号化はしない
#[derive(Debug)]
pub struct SeedStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl SeedStore {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| AppError::JsonParse {
                file_path: path.to_path_buf(),
                source: e,
            })?
        } else {
            log::debug!("ストアファイルが無いため新規作成します: {:?}", path);
            BTreeMap::new()
        };
        Ok(SeedStore { path: path.to_path_buf(), entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: String) -> Result<(), AppError> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }

    fn flush(&self) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    /// 保存済みのフレーズを返す。無ければ生成して保存する
    pub fn load_or_create_mnemonic(&mut self) -> Result<Mnemonic, AppError> {
        if let Some(saved) = self.get(MNEMONIC_KEY) {
            return Ok(Mnemonic::parse_normalized(saved)?);
        }
        log::info!("リカバリーフレーズが無いため新規生成します。");
        let mnemonic = generate_mnemonic()?;
        self.set(MNEMONIC_KEY, mnemonic.to_string())?;
        Ok(mnemonic)
    }

    /// 新しいフレーズに置き換え、インデックスを0に戻す
    pub fn replace_mnemonic(&mut self) -> Result<Mnemonic, AppError> {
        let mnemonic = generate_mnemonic()?;
        self.entries.insert(MNEMONIC_KEY.to_string(), mnemonic.to_string());
        self.save_session(&WalletSession::default())?;
        log::info!("リカバリーフレーズを置き換えました。");
        Ok(mnemonic)
    }

    pub fn load_session(&self) -> Result<WalletSession, AppError> {
        Ok(WalletSession {
            receive_index: self.read_index(RECEIVE_INDEX_KEY)?,
            change_index: self.read_index(CHANGE_INDEX_KEY)?,
        })
    }

    pub fn save_session(&mut self, session: &WalletSession) -> Result<(), AppError> {
        self.entries.insert(RECEIVE_INDEX_KEY.to_string(), session.receive_index.to_string());
        self.entries.insert(CHANGE_INDEX_KEY.to_string(), session.change_index.to_string());
        self.flush()
    }

    fn read_index(&self, key: &str) -> Result<u32, AppError> {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| AppError::Store(format!("{} の値が不正です: {}", key, raw))),
            None => Ok(0),
        }
    }
}

fn generate_mnemonic() -> Result<Mnemonic, AppError> {
    let mut entropy = [0u8; ENTROPY_BYTES];
    thread_rng().fill_bytes(&mut entropy);
    Ok(Mnemonic::from_entropy(&entropy)?)
}
