use std::str::FromStr;
use bitcoin::{
    absolute::LockTime,
    consensus::encode,
    ecdsa,
    hashes::Hash,
    psbt::Psbt,
    secp256k1::{All, Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, Denomination, Network, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};

use crate::{
    error::AppError,
    keys::KeyResolver,
    types::{DraftTransaction, FinalizedTransaction, KeyCandidate, SpendableOutput},
};

// P2WPKH 前提の固定サイズ見積もり (vB)
pub const INPUT_VSIZE: u64 = 110;
pub const OUTPUT_VSIZE: u64 = 31;
pub const OVERHEAD_VSIZE: u64 = 10;

// これ以下のおつりは出力にせず手数料に含める
pub const DUST_THRESHOLD_SATS: u64 = 546;

// 見積もりは送金先とおつりの2出力で計算する
pub const ESTIMATED_OUTPUTS: usize = 2;

/// 送金要求。金額は sats に変換済み
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub destination: Address,
    pub amount: Amount,
    pub fee_rate_sat_per_vb: u64,
}

/// コイン選択と手数料計算の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeePlan {
    pub selected: Vec<SpendableOutput>,
    pub total_selected: Amount,
    pub estimated_vsize: u64,
    pub fee: Amount,
    /// DUST_THRESHOLD_SATS を超える場合のみ Some
    pub change: Option<Amount>,
}

/// 手数料率は小数点以下切り捨て、最低 1 sat/vB
pub fn normalize_fee_rate(raw: f64) -> u64 {
    if !raw.is_finite() || raw < 1.0 {
        return 1;
    }
    raw.floor() as u64
}

/// BTC 単位の文字列を sats に変換する
pub fn parse_amount_btc(text: &str) -> Result<Amount, AppError> {
    let amount = Amount::from_str_in(text.trim(), Denomination::Bitcoin)?;
    if amount == Amount::ZERO {
        return Err(AppError::InputValidation("送金額は0より大きくしてください".to_string()));
    }
    Ok(amount)
}

pub fn parse_destination(text: &str, network: Network) -> Result<Address, AppError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AppError::InputValidation("送金先アドレスを入力してください".to_string()));
    }
    Ok(Address::from_str(trimmed)?.require_network(network)?)
}

/// 与えられた順に積み上げ、合計が送金額に達した時点で止める
pub fn select_coins(
    candidates: &[SpendableOutput],
    amount: Amount,
) -> Result<(Vec<SpendableOutput>, Amount), AppError> {
    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for output in candidates {
        selected.push(output.clone());
        total = total.checked_add(output.value).ok_or_else(|| {
            AppError::TransactionBuild(format!("UTXO合計額がオーバーフローしました: {}", output.out_point))
        })?;
        log::debug!("UTXO選択: {} ({} sats), 累計 {} sats", output.out_point, output.value.to_sat(), total.to_sat());
        if total >= amount {
            return Ok((selected, total));
        }
    }
    Err(AppError::InsufficientFunds {
        available: total.to_sat(),
        required: amount.to_sat(),
    })
}

pub fn estimate_vsize(input_count: usize, output_count: usize) -> u64 {
    input_count as u64 * INPUT_VSIZE + output_count as u64 * OUTPUT_VSIZE + OVERHEAD_VSIZE
}

pub fn compute_fee(fee_rate_sat_per_vb: u64, input_count: usize, output_count: usize) -> Result<Amount, AppError> {
    fee_rate_sat_per_vb
        .checked_mul(estimate_vsize(input_count, output_count))
        .map(Amount::from_sat)
        .ok_or_else(|| AppError::InputValidation(format!("手数料率が大きすぎます: {} sats/vB", fee_rate_sat_per_vb)))
}

/// コイン選択のあと手数料とおつりを決める
pub fn plan_fee(
    candidates: &[SpendableOutput],
    amount: Amount,
    fee_rate_sat_per_vb: u64,
) -> Result<FeePlan, AppError> {
    let (selected, total_selected) = select_coins(candidates, amount)?;
    let estimated_vsize = estimate_vsize(selected.len(), ESTIMATED_OUTPUTS);
    let fee = compute_fee(fee_rate_sat_per_vb, selected.len(), ESTIMATED_OUTPUTS)?;
    log::debug!("推定vsize: {} vB, 手数料率: {} sats/vB, 手数料: {} sats", estimated_vsize, fee_rate_sat_per_vb, fee.to_sat());

    let change = total_selected
        .checked_sub(amount)
        .and_then(|rest| rest.checked_sub(fee))
        .ok_or(AppError::InsufficientForFee {
            selected: total_selected.to_sat(),
            amount: amount.to_sat(),
            fee: fee.to_sat(),
        })?;

    let change = if change.to_sat() > DUST_THRESHOLD_SATS {
        Some(change)
    } else {
        if change > Amount::ZERO {
            log::warn!("おつり {} sats はダスト閾値 {} sats 以下のため手数料に含めます。", change.to_sat(), DUST_THRESHOLD_SATS);
        }
        None
    };

    Ok(FeePlan { selected, total_selected, estimated_vsize, fee, change })
}

/// 未署名トランザクションを PSBT に組み立て、各入力に witness_utxo を付ける
pub fn assemble_draft(
    plan: &FeePlan,
    request: &SendRequest,
    change_script: ScriptBuf,
) -> Result<DraftTransaction, AppError> {
    let mut outputs = vec![TxOut {
        value: request.amount,
        script_pubkey: request.destination.script_pubkey(),
    }];
    if let Some(change) = plan.change {
        log::debug!("おつり出力を追加: {} sats", change.to_sat());
        outputs.push(TxOut { value: change, script_pubkey: change_script });
    }

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: plan
            .selected
            .iter()
            .map(|output| TxIn {
                previous_output: output.out_point,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)?;
    for (psbt_input, output) in psbt.inputs.iter_mut().zip(&plan.selected) {
        psbt_input.witness_utxo = Some(output.tx_out());
    }

    Ok(DraftTransaction {
        psbt,
        fee_rate_sat_per_vb: request.fee_rate_sat_per_vb,
        estimated_vsize: plan.estimated_vsize,
        fee: plan.fee,
        change: plan.change,
    })
}

/// 全入力の鍵を先に解決し、1つでも見つからなければ署名せずに中断する
fn resolve_signing_keys<R: KeyResolver>(
    psbt: &Psbt,
    resolver: &mut R,
) -> Result<Vec<KeyCandidate>, AppError> {
    let mut keys = Vec::with_capacity(psbt.inputs.len());
    for (input_index, psbt_input) in psbt.inputs.iter().enumerate() {
        let prevout = psbt_input.witness_utxo.as_ref().ok_or_else(|| {
            AppError::TransactionBuild(format!("入力 {} に witness_utxo がありません", input_index))
        })?;
        let key = resolver.resolve_key(&prevout.script_pubkey)?.ok_or_else(|| AppError::KeyNotFound {
            input_index,
            script_hex: prevout.script_pubkey.to_hex_string(),
        })?;
        log::debug!("入力 {} の署名鍵: {}", input_index, key.derivation_path);
        keys.push(key);
    }
    Ok(keys)
}

/// 署名してファイナライズし、ブロードキャスト可能な形にする
pub fn sign_draft<R: KeyResolver>(
    draft: DraftTransaction,
    resolver: &mut R,
    secp: &Secp256k1<All>,
) -> Result<FinalizedTransaction, AppError> {
    let DraftTransaction { mut psbt, fee, change, .. } = draft;
    let keys = resolve_signing_keys(&psbt, resolver)?;

    log::info!("トランザクション署名処理を開始します。");
    {
        let mut sighash_cache = SighashCache::new(&psbt.unsigned_tx);
        for (input_index, key) in keys.iter().enumerate() {
            let psbt_input = &mut psbt.inputs[input_index];
            let prevout = psbt_input.witness_utxo.as_ref().ok_or_else(|| {
                AppError::TransactionBuild(format!("入力 {} に witness_utxo がありません", input_index))
            })?;
            let sighash = sighash_cache
                .p2wpkh_signature_hash(input_index, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
                .map_err(|e| AppError::SighashError { input_index, source: e })?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, &key.secret_key),
                sighash_type: EcdsaSighashType::All,
            };
            psbt_input.partial_sigs.insert(PublicKey::new(key.public_key.0), signature);
            log::debug!("入力 {} の署名完了。", input_index);
        }
    }

    finalize(&mut psbt, &keys)?;
    log::info!("全ての入力の署名とファイナライズが完了しました。");

    let transaction = psbt
        .extract_tx()
        .map_err(|e| AppError::TransactionBuild(format!("トランザクション抽出失敗: {}", e)))?;
    let raw_hex = encode::serialize_hex(&transaction);
    Ok(FinalizedTransaction {
        txid: transaction.compute_txid(),
        transaction,
        raw_hex,
        fee,
        change,
    })
}

/// partial_sigs を final_script_witness ([sig, pubkey]) に変換する
fn finalize(psbt: &mut Psbt, keys: &[KeyCandidate]) -> Result<(), AppError> {
    for (input_index, (psbt_input, key)) in psbt.inputs.iter_mut().zip(keys).enumerate() {
        let public_key = PublicKey::new(key.public_key.0);
        let signature = psbt_input.partial_sigs.get(&public_key).ok_or_else(|| {
            AppError::TransactionBuild(format!("入力 {} の署名がありません", input_index))
        })?;
        let mut witness = Witness::new();
        witness.push(signature.to_vec());
        witness.push(key.public_key.to_bytes());
        psbt_input.final_script_witness = Some(witness);
        psbt_input.partial_sigs.clear();
    }
    Ok(())
}

/// 選択・手数料計算・組み立て・署名・ファイナライズを一括で行う
pub fn build_and_sign<R: KeyResolver>(
    request: &SendRequest,
    candidates: &[SpendableOutput],
    change_script: ScriptBuf,
    resolver: &mut R,
    secp: &Secp256k1<All>,
) -> Result<FinalizedTransaction, AppError> {
    log::info!("トランザクション構築処理を開始します。");
    let plan = plan_fee(candidates, request.amount, request.fee_rate_sat_per_vb)?;
    let draft = assemble_draft(&plan, request, change_script)?;
    log::debug!("ドラフト: 入力 {} 件, 出力 {} 件, 手数料 {} sats", draft.input_count(), draft.output_count(), draft.fee.to_sat());
    sign_draft(draft, resolver, secp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{OutPoint, Txid};
    use crate::keys::{tests::test_deriver, KeyRing, DEFAULT_LOOKAHEAD};
    use crate::types::Branch;

    fn outpoint(n: u8) -> OutPoint {
        let txid = Txid::from_str(&format!("{:064x}", n as u64 + 1)).unwrap();
        OutPoint::new(txid, n as u32)
    }

    fn output(n: u8, sats: u64, script: &ScriptBuf) -> SpendableOutput {
        SpendableOutput::new(outpoint(n), Amount::from_sat(sats), script.clone()).unwrap()
    }

    fn ring() -> KeyRing {
        KeyRing::new(test_deriver(Network::Testnet), DEFAULT_LOOKAHEAD)
    }

    fn request(amount: u64, fee_rate: u64) -> SendRequest {
        let destination = test_deriver(Network::Testnet).derive(Branch::Receiving, 100).unwrap().address;
        SendRequest {
            destination,
            amount: Amount::from_sat(amount),
            fee_rate_sat_per_vb: fee_rate,
        }
    }

    fn verify_inputs(tx: &Transaction, prevouts: &[SpendableOutput], secp: &Secp256k1<All>) {
        let mut cache = SighashCache::new(tx);
        for (i, prevout) in prevouts.iter().enumerate() {
            let witness = &tx.input[i].witness;
            assert_eq!(witness.len(), 2);
            let sig = ecdsa::Signature::from_slice(witness.nth(0).unwrap()).unwrap();
            let pk = bitcoin::CompressedPublicKey::from_slice(witness.nth(1).unwrap()).unwrap();
            assert_eq!(ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()), prevout.script_pubkey);
            let sighash = cache
                .p2wpkh_signature_hash(i, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
                .unwrap();
            let msg = Message::from_digest(sighash.to_byte_array());
            secp.verify_ecdsa(&msg, &sig.signature, &pk.0).unwrap();
        }
    }

    #[test]
    fn fee_rate_is_floored_with_minimum_one() {
        assert_eq!(normalize_fee_rate(5.9), 5);
        assert_eq!(normalize_fee_rate(0.3), 1);
        assert_eq!(normalize_fee_rate(-4.0), 1);
        assert_eq!(normalize_fee_rate(f64::NAN), 1);
    }

    #[test]
    fn parses_btc_amounts() {
        assert_eq!(parse_amount_btc("0.0012").unwrap(), Amount::from_sat(120_000));
        assert!(matches!(parse_amount_btc("0"), Err(AppError::InputValidation(_))));
        assert!(matches!(parse_amount_btc("abc"), Err(AppError::Amount(_))));
    }

    #[test]
    fn destination_must_match_network() {
        let mainnet = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
        assert!(parse_destination(mainnet, Network::Bitcoin).is_ok());
        assert!(matches!(parse_destination(mainnet, Network::Testnet), Err(AppError::BitcoinAddress(_))));
        assert!(matches!(parse_destination("  ", Network::Testnet), Err(AppError::InputValidation(_))));
    }

    #[test]
    fn fee_follows_fixed_size_formula() {
        for (inputs, outputs, rate) in [(1, 1, 1), (2, 2, 5), (7, 2, 13)] {
            let expected = rate * (inputs as u64 * 110 + outputs as u64 * 31 + 10);
            assert_eq!(compute_fee(rate, inputs, outputs).unwrap().to_sat(), expected);
        }
        assert!(compute_fee(u64::MAX, 1, 1).is_err());
    }

    #[test]
    fn selection_stops_at_first_sufficiency() {
        let script = ring().issue(Branch::Receiving, 0).unwrap().script_pubkey;
        let candidates = [output(0, 70_000, &script), output(1, 60_000, &script), output(2, 90_000, &script)];
        let (selected, total) = select_coins(&candidates, Amount::from_sat(100_000)).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(total, Amount::from_sat(130_000));
        assert_eq!(selected[1].out_point, outpoint(1));
    }

    #[test]
    fn oversized_values_fail_instead_of_overflowing() {
        let script = ring().issue(Branch::Receiving, 0).unwrap().script_pubkey;
        let candidates = [
            output(0, 5, &script),
            SpendableOutput { out_point: outpoint(1), value: Amount::from_sat(u64::MAX), script_pubkey: script.clone() },
        ];
        let err = select_coins(&candidates, Amount::from_sat(u64::MAX)).unwrap_err();
        assert!(matches!(err, AppError::TransactionBuild(_)));
        assert!(matches!(
            SpendableOutput::new(outpoint(2), Amount::MAX_MONEY + Amount::from_sat(1), script),
            Err(AppError::InputValidation(_))
        ));
    }

    #[test]
    fn successful_plans_always_cover_amount_and_fee() {
        let script = ring().issue(Branch::Receiving, 0).unwrap().script_pubkey;
        let sets: [&[u64]; 5] = [
            &[100_000],
            &[70_000, 60_000, 90_000],
            &[1_000, 1_000, 1_000, 1_000, 200_000],
            &[50_500, 50_000],
            &[546, 547, 99_000],
        ];
        for values in sets {
            let candidates: Vec<_> = values.iter().enumerate().map(|(n, sats)| output(n as u8, *sats, &script)).collect();
            let available: u64 = values.iter().sum();
            for amount in [1_000, 50_000, 99_500, 100_000, 150_000] {
                for rate in [1, 5, 25, 200] {
                    match plan_fee(&candidates, Amount::from_sat(amount), rate) {
                        Ok(plan) => {
                            let total = plan.total_selected.to_sat();
                            assert!(total >= amount + plan.fee.to_sat(), "{:?} {} {}", values, amount, rate);
                            let change = plan.change.map_or(0, |c| c.to_sat());
                            assert!(total - amount - plan.fee.to_sat() >= change);
                            assert_eq!(plan.fee.to_sat(), rate * estimate_vsize(plan.selected.len(), ESTIMATED_OUTPUTS));
                        }
                        Err(AppError::InsufficientFunds { available: a, required }) => {
                            assert_eq!(a, available);
                            assert!(required > available);
                        }
                        Err(AppError::InsufficientForFee { selected, amount: req, fee }) => {
                            assert!(selected >= req);
                            assert!(selected < req + fee);
                        }
                        Err(other) => panic!("unexpected error: {}", other),
                    }
                }
            }
        }
    }

    #[test]
    fn insufficient_funds_aborts_before_any_draft() {
        let script = ring().issue(Branch::Receiving, 0).unwrap().script_pubkey;
        let candidates = [output(0, 10_000, &script), output(1, 20_000, &script)];
        let mut keys = ring();
        let err = build_and_sign(&request(50_000, 5), &candidates, script.clone(), &mut keys, &Secp256k1::new())
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { available: 30_000, required: 50_000 }));
        // 鍵の走査まで進んでいない
        assert_eq!(keys.cached_len(), 0);
    }

    #[test]
    fn insufficient_for_fee_when_selection_leaves_no_room() {
        let script = ring().issue(Branch::Receiving, 0).unwrap().script_pubkey;
        let candidates = [output(0, 100_500, &script)];
        let err = plan_fee(&candidates, Amount::from_sat(100_000), 5).unwrap_err();
        assert!(matches!(err, AppError::InsufficientForFee { selected: 100_500, amount: 100_000, fee: 910 }));
    }

    #[test]
    fn change_at_threshold_is_dropped() {
        let script = ring().issue(Branch::Receiving, 0).unwrap().script_pubkey;
        // fee = 1 * (110 + 62 + 10) = 182
        let exact = [output(0, 100_000 + 182 + 546, &script)];
        let plan = plan_fee(&exact, Amount::from_sat(100_000), 1).unwrap();
        assert_eq!(plan.change, None);

        let above = [output(0, 100_000 + 182 + 547, &script)];
        let plan = plan_fee(&above, Amount::from_sat(100_000), 1).unwrap();
        assert_eq!(plan.change, Some(Amount::from_sat(547)));

        let draft = assemble_draft(&plan, &request(100_000, 1), script.clone()).unwrap();
        assert_eq!(draft.output_count(), 2);
        let plan = plan_fee(&exact, Amount::from_sat(100_000), 1).unwrap();
        let draft = assemble_draft(&plan, &request(100_000, 1), script).unwrap();
        assert_eq!(draft.output_count(), 1);
    }

    #[test]
    fn end_to_end_example_builds_two_in_two_out() {
        let secp = Secp256k1::new();
        let mut keys = ring();
        let receive = keys.issue(Branch::Receiving, 0).unwrap();
        let change = keys.issue(Branch::Change, 0).unwrap();
        let candidates = [
            output(0, 100_000, &receive.script_pubkey),
            output(1, 50_000, &change.script_pubkey),
        ];
        let req = request(120_000, 5);

        let plan = plan_fee(&candidates, req.amount, 5).unwrap();
        assert_eq!(plan.total_selected, Amount::from_sat(150_000));
        assert_eq!(plan.estimated_vsize, 292);
        assert_eq!(plan.fee, Amount::from_sat(1_460));
        assert_eq!(plan.change, Some(Amount::from_sat(28_540)));

        let draft = assemble_draft(&plan, &req, change.script_pubkey.clone()).unwrap();
        assert_eq!(draft.input_count(), 2);
        assert_eq!(draft.output_count(), 2);
        assert!(draft.psbt.inputs.iter().all(|i| i.witness_utxo.is_some()));

        let finalized = sign_draft(draft, &mut keys, &secp).unwrap();
        let tx = &finalized.transaction;
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output[0].value, Amount::from_sat(120_000));
        assert_eq!(tx.output[1].value, Amount::from_sat(28_540));
        assert_eq!(tx.output[1].script_pubkey, change.script_pubkey);
        assert_eq!(finalized.txid, tx.compute_txid());
        assert_eq!(finalized.raw_hex, encode::serialize_hex(tx));
        verify_inputs(tx, &candidates, &secp);
    }

    #[test]
    fn signs_inputs_found_only_by_window_scan() {
        let secp = Secp256k1::new();
        let deriver = test_deriver(Network::Testnet);
        let far_receive = deriver.derive(Branch::Receiving, 4).unwrap();
        let far_change = deriver.derive(Branch::Change, 3).unwrap();
        let candidates = [
            output(0, 30_000, &far_receive.script_pubkey),
            output(1, 40_000, &far_change.script_pubkey),
        ];

        let mut keys = ring();
        keys.set_window(1, 0);
        let finalized = build_and_sign(&request(60_000, 2), &candidates, far_change.script_pubkey.clone(), &mut keys, &secp)
            .unwrap();
        verify_inputs(&finalized.transaction, &candidates, &secp);
    }

    #[test]
    fn key_not_found_aborts_whole_send() {
        let secp = Secp256k1::new();
        let deriver = test_deriver(Network::Testnet);
        let ours = deriver.derive(Branch::Receiving, 0).unwrap();
        let beyond = deriver.derive(Branch::Receiving, 50).unwrap();
        let candidates = [
            output(0, 30_000, &ours.script_pubkey),
            output(1, 40_000, &beyond.script_pubkey),
        ];

        let mut keys = ring();
        let err = build_and_sign(&request(60_000, 2), &candidates, ours.script_pubkey.clone(), &mut keys, &secp)
            .unwrap_err();
        assert!(matches!(err, AppError::KeyNotFound { input_index: 1, .. }));
    }
}
