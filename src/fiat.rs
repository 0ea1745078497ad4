//! 法定通貨オンランプのサンドボックス。KYC・見積もり・オンランプ意図を模擬するだけで、
//! 実際の資金やコインは動かない。

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};

// 1 BTC = 5,000,000 (モック為替レート)
pub const FX_RATE_BTC_PER_UNIT: f64 = 1.0 / 5_000_000.0;
pub const MIN_FEE: f64 = 10.0;
pub const FEE_RATIO: f64 = 0.01;
pub const KYC_AUTO_APPROVE_AFTER: Duration = Duration::from_secs(3);

const KYC_SESSION_URL: &str = "https://sandbox-kyc.example/start";
const ONRAMP_REDIRECT_URL: &str = "https://sandbox-pay.example/redirect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KycStatus {
    None,
    Pending,
    Approved,
}

#[derive(Debug, Clone)]
struct KycRecord {
    status: KycStatus,
    started_at: SystemTime,
}

#[derive(Deserialize, Debug)]
pub struct KycStartRequest {
    pub user_id: String,
}

#[derive(Deserialize, Debug)]
pub struct QuoteRequest {
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
}

#[derive(Deserialize, Debug)]
pub struct OnrampStartRequest {
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub dest_address: String,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct KycStartResponse {
    pub status: KycStatus,
    pub session_url: String,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct KycStatusResponse {
    pub status: KycStatus,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct Quote {
    pub rate: f64,
    pub btc_out: f64,
    pub fees: f64,
    pub currency: String,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum OnrampResponse {
    Created {
        intent_id: String,
        status: String,
        redirect_url: String,
    },
    Rejected {
        error: String,
    },
}

/// ユーザーごとの KYC 状態をメモリに持つ
#[derive(Debug, Default)]
pub struct FiatSandbox {
    users: HashMap<String, KycRecord>,
}

impl FiatSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kyc_start(&mut self, req: &KycStartRequest, now: SystemTime) -> KycStartResponse {
        log::info!("KYC開始 (sandbox): user={}", req.user_id);
        self.users.insert(
            req.user_id.clone(),
            KycRecord { status: KycStatus::Pending, started_at: now },
        );
        KycStartResponse {
            status: KycStatus::Pending,
            session_url: KYC_SESSION_URL.to_string(),
        }
    }

    /// pending は開始から3秒を超えると自動承認される
    pub fn kyc_status(&mut self, user_id: &str, now: SystemTime) -> KycStatusResponse {
        let Some(record) = self.users.get_mut(user_id) else {
            return KycStatusResponse { status: KycStatus::None };
        };
        if record.status == KycStatus::Pending {
            let elapsed = now.duration_since(record.started_at).unwrap_or_default();
            if elapsed > KYC_AUTO_APPROVE_AFTER {
                log::info!("KYC自動承認: user={}", user_id);
                record.status = KycStatus::Approved;
            }
        }
        KycStatusResponse { status: record.status }
    }

    pub fn quote(&self, req: &QuoteRequest) -> Quote {
        log::debug!("見積もり: user={}, amount={} {}", req.user_id, req.amount, req.currency);
        Quote {
            rate: FX_RATE_BTC_PER_UNIT,
            btc_out: req.amount * FX_RATE_BTC_PER_UNIT,
            fees: MIN_FEE.max(FEE_RATIO * req.amount),
            currency: req.currency.clone(),
        }
    }

    /// KYC 承認済みユーザーのみ意図を作成する。送金は発生しない
    pub fn onramp_start(&self, req: &OnrampStartRequest, now: SystemTime) -> OnrampResponse {
        let approved = self
            .users
            .get(&req.user_id)
            .is_some_and(|record| record.status == KycStatus::Approved);
        if !approved {
            log::warn!("KYC未承認のためオンランプを拒否: user={}", req.user_id);
            return OnrampResponse::Rejected { error: "kyc_required".to_string() };
        }
        let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        log::info!(
            "オンランプ意図を作成 (sandbox): user={}, {} {} -> {}",
            req.user_id, req.amount, req.currency, req.dest_address
        );
        OnrampResponse::Created {
            intent_id: format!("intent_{}", secs),
            status: "created".to_string(),
            redirect_url: ONRAMP_REDIRECT_URL.to_string(),
        }
    }
}
