use std::collections::HashMap;
use std::str::FromStr;
use bip39::Mnemonic;
use bitcoin::{
    bip32::{ChildNumber, DerivationPath, Xpriv},
    secp256k1::{All, PublicKey as SecpPublicKey, Secp256k1},
    Address, CompressedPublicKey, Network, Script, ScriptBuf,
};

use crate::{
    error::AppError,
    types::{Branch, KeyCandidate},
};

/// 現在のインデックスより先に走査する鍵の数
pub const DEFAULT_LOOKAHEAD: u32 = 3;

/// BIP84 アカウントパス。メインネット以外はコインタイプ 1
pub fn account_path(network: Network) -> String {
    let coin_type = if network == Network::Bitcoin { 0 } else { 1 };
    format!("m/84'/{}'/0'", coin_type)
}

/// リカバリーフレーズから P2WPKH 鍵を決定的に導出する
pub struct KeyDeriver {
    account: Xpriv,
    account_path: String,
    network: Network,
    secp: Secp256k1<All>,
}

impl KeyDeriver {
    pub fn from_mnemonic(mnemonic: &Mnemonic, network: Network) -> Result<Self, AppError> {
        let secp = Secp256k1::new();
        let seed = mnemonic.to_seed("");
        let master = Xpriv::new_master(network, &seed)?;
        let account_path = account_path(network);
        let path = DerivationPath::from_str(&account_path)?;
        let account = master.derive_priv(&secp, &path)?;
        log::debug!("アカウント鍵を導出しました: {}", account_path);
        Ok(KeyDeriver { account, account_path, network, secp })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    pub fn derive(&self, branch: Branch, index: u32) -> Result<KeyCandidate, AppError> {
        let path = [
            ChildNumber::from_normal_idx(branch.index())?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = self.account.derive_priv(&self.secp, &path)?;
        let public_key = CompressedPublicKey(SecpPublicKey::from_secret_key(&self.secp, &child.private_key));
        let script_pubkey = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
        let address = Address::p2wpkh(&public_key, self.network);

        Ok(KeyCandidate {
            branch,
            index,
            derivation_path: format!("{}/{}/{}", self.account_path, branch.index(), index),
            secret_key: child.private_key,
            public_key,
            script_pubkey,
            address,
        })
    }
}

/// ロックスクリプトから署名鍵を引く
pub trait KeyResolver {
    fn resolve_key(&mut self, script_pubkey: &Script) -> Result<Option<KeyCandidate>, AppError>;
}

/// 発行済みアドレスのスクリプトをキャッシュし、見つからなければ先読み範囲を走査する
pub struct KeyRing {
    deriver: KeyDeriver,
    by_script: HashMap<ScriptBuf, KeyCandidate>,
    lookahead: u32,
    scan_limit: u32,
    scanned_through: Option<u32>,
}

impl KeyRing {
    pub fn new(deriver: KeyDeriver, lookahead: u32) -> Self {
        KeyRing {
            deriver,
            by_script: HashMap::new(),
            lookahead,
            scan_limit: lookahead,
            scanned_through: None,
        }
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// アドレスを発行し、そのスクリプトを登録する
    pub fn issue(&mut self, branch: Branch, index: u32) -> Result<KeyCandidate, AppError> {
        let candidate = self.deriver.derive(branch, index)?;
        self.by_script
            .entry(candidate.script_pubkey.clone())
            .or_insert_with(|| candidate.clone());
        Ok(candidate)
    }

    /// 走査範囲は 0..=max(receive, change) + lookahead
    pub fn set_window(&mut self, receive_index: u32, change_index: u32) {
        self.scan_limit = receive_index.max(change_index).saturating_add(self.lookahead);
    }

    pub fn scan_limit(&self) -> u32 {
        self.scan_limit
    }

    pub fn cached_len(&self) -> usize {
        self.by_script.len()
    }

    fn scan_window(&mut self) -> Result<(), AppError> {
        let start = match self.scanned_through {
            Some(done) if done >= self.scan_limit => return Ok(()),
            Some(done) => done + 1,
            None => 0,
        };
        log::debug!("鍵候補を走査します: index {}..={}", start, self.scan_limit);
        for branch in Branch::ALL {
            for index in start..=self.scan_limit {
                self.issue(branch, index)?;
            }
        }
        self.scanned_through = Some(self.scan_limit);
        Ok(())
    }
}

impl KeyResolver for KeyRing {
    fn resolve_key(&mut self, script_pubkey: &Script) -> Result<Option<KeyCandidate>, AppError> {
        if let Some(candidate) = self.by_script.get(script_pubkey) {
            return Ok(Some(candidate.clone()));
        }
        self.scan_window()?;
        Ok(self.by_script.get(script_pubkey).cloned())
    }
}
