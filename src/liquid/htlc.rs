use anyhow::{Context as _, Result};
use lwk_wollet::elements::bitcoin::hashes::{Hash as _, sha256};
use lwk_wollet::elements::bitcoin::secp256k1::ecdsa::Signature;
use lwk_wollet::elements::bitcoin::secp256k1::{Message, PublicKey, Secp256k1};
use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
use lwk_wollet::elements::opcodes;
use lwk_wollet::elements::script::{Builder, Instruction, Script};
use lwk_wollet::elements::sighash::SighashCache;
use lwk_wollet::elements::{
    Address, AddressParams, AssetId, EcdsaSighashType, LockTime, OutPoint, Sequence, Transaction,
    TxIn, TxInWitness, TxOut, TxOutWitness, Txid,
};

use crate::liquid::keys::{DerivedKey, KeyVault};

/// Hash-time-locked swap script with a cooperative branch.
///
/// ```text
/// OP_IF
///     <refund_pubkey> OP_CHECKSIGVERIFY <claim_pubkey> OP_CHECKSIG
/// OP_ELSE
///     OP_SHA256 <payment_hash> OP_EQUAL
///     OP_IF
///         <claim_pubkey>
///     OP_ELSE
///         <timeout_height> OP_CHECKLOCKTIMEVERIFY OP_DROP <refund_pubkey>
///     OP_ENDIF
///     OP_CHECKSIG
/// OP_ENDIF
/// ```
///
/// Witnesses: claim `[sig, preimage, "", script]`, refund `[sig, "", "", script]`,
/// cooperative `[claim_sig, refund_sig, 0x01, script]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcSpec {
    pub payment_hash: [u8; 32],
    pub claim_pubkey: PublicKey,
    pub refund_pubkey: PublicKey,
    pub timeout_height: u32,
}

impl HtlcSpec {
    pub fn witness_script(&self) -> Script {
        Builder::new()
            .push_opcode(opcodes::all::OP_IF)
            .push_slice(&self.refund_pubkey.serialize())
            .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
            .push_slice(&self.claim_pubkey.serialize())
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(&self.payment_hash)
            .push_opcode(opcodes::all::OP_EQUAL)
            .push_opcode(opcodes::all::OP_IF)
            .push_slice(&self.claim_pubkey.serialize())
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(self.timeout_height as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_slice(&self.refund_pubkey.serialize())
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_ENDIF)
            .into_script()
    }

    pub fn p2wsh_address(&self, params: &'static AddressParams) -> Address {
        Address::p2wsh(&self.witness_script(), None, params)
    }

    pub fn script_pubkey(&self) -> Script {
        Script::new_v0_wsh(&self.witness_script().wscript_hash())
    }

    pub fn parse_witness_script(witness_script: &Script) -> Result<Self> {
        fn next_instruction<'a>(
            iter: &mut impl Iterator<
                Item = std::result::Result<Instruction<'a>, lwk_wollet::elements::script::Error>,
            >,
        ) -> Result<Instruction<'a>> {
            iter.next()
                .transpose()
                .map_err(|e| anyhow::anyhow!("decode witness script instruction: {e:?}"))?
                .context("unexpected end of witness script")
        }

        fn expect_op(actual: Instruction<'_>, expected: opcodes::All) -> Result<()> {
            match actual {
                Instruction::Op(op) if op == expected => Ok(()),
                other => {
                    anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}")
                }
            }
        }

        fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
            match actual {
                Instruction::PushBytes(bytes) if bytes.len() == N => {
                    let mut out = [0u8; N];
                    out.copy_from_slice(bytes);
                    Ok(out)
                }
                other => {
                    anyhow::bail!("unexpected instruction: expected push {N} bytes, got {other:?}")
                }
            }
        }

        fn expect_pubkey(actual: Instruction<'_>) -> Result<PublicKey> {
            let bytes = expect_push::<33>(actual)?;
            PublicKey::from_slice(&bytes).context("invalid public key in witness script")
        }

        let mut iter = witness_script.instructions_minimal();

        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_IF)?;
        let cooperative_refund = expect_pubkey(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIGVERIFY)?;
        let cooperative_claim = expect_pubkey(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIG)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_ELSE)?;

        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_SHA256)?;
        let payment_hash = expect_push::<32>(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUAL)?;

        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_IF)?;
        let claim_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;

        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_ELSE)?;
        let timeout_height = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(
            timeout_height >= 0 && timeout_height <= u32::MAX as i64,
            "timeout_height out of range: {timeout_height}"
        );
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CLTV)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_DROP)?;
        let refund_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;

        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_ENDIF)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIG)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_ENDIF)?;

        anyhow::ensure!(
            iter.next().is_none(),
            "unexpected trailing instructions in witness script"
        );
        anyhow::ensure!(
            cooperative_claim == claim_pubkey && cooperative_refund == refund_pubkey,
            "cooperative branch keys differ from the hash and timeout branch keys"
        );

        Ok(Self {
            payment_hash,
            claim_pubkey,
            refund_pubkey,
            timeout_height: timeout_height as u32,
        })
    }
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes),
        Instruction::Op(op) => {
            let code = op.into_u8();
            if code == opcodes::all::OP_PUSHNUM_NEG1.into_u8() {
                return Ok(-1);
            }

            let one = opcodes::all::OP_PUSHNUM_1.into_u8();
            let sixteen = opcodes::all::OP_PUSHNUM_16.into_u8();
            if (one..=sixteen).contains(&code) {
                return Ok((code - one + 1) as i64);
            }

            anyhow::bail!("unexpected opcode where script number expected: {op:?}");
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        anyhow::bail!("script number too large: {} bytes", bytes.len());
    }

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }

    Ok(if negative { -value } else { value })
}

/// The single explicit L-BTC output locked to a swap script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcFunding {
    pub txid: Txid,
    pub vout: u32,
    pub amount_sat: u64,
    pub policy_asset: AssetId,
}

impl HtlcFunding {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }
}

/// Spends the swap output through the hash branch.
pub fn claim_tx(
    spec: &HtlcSpec,
    funding: &HtlcFunding,
    destination: &Address,
    vault: &KeyVault,
    claim_key: &DerivedKey,
    preimage: [u8; 32],
    fee_sat: u64,
) -> Result<Transaction> {
    anyhow::ensure!(
        sha256_preimage(&preimage) == spec.payment_hash,
        "preimage does not match payment hash"
    );
    anyhow::ensure!(
        claim_key.public_key() == spec.claim_pubkey,
        "claim key does not match swap script"
    );
    let witness_script = spec.witness_script();
    let mut tx = spend_tx(
        funding,
        destination,
        fee_sat,
        Sequence::MAX,
        LockTime::ZERO,
    )?;

    let sig = sign_input(&tx, &witness_script, funding, vault, claim_key)?;
    tx.input[0].witness.script_witness =
        vec![sig, preimage.to_vec(), Vec::new(), witness_script.to_bytes()];
    Ok(tx)
}

/// Spends the swap output through the timeout branch. Valid from `timeout_height` on.
pub fn refund_tx(
    spec: &HtlcSpec,
    funding: &HtlcFunding,
    destination: &Address,
    vault: &KeyVault,
    refund_key: &DerivedKey,
    fee_sat: u64,
) -> Result<Transaction> {
    anyhow::ensure!(
        refund_key.public_key() == spec.refund_pubkey,
        "refund key does not match swap script"
    );
    let witness_script = spec.witness_script();
    let lock_time =
        LockTime::from_height(spec.timeout_height).context("timeout_height is invalid locktime")?;
    let mut tx = spend_tx(
        funding,
        destination,
        fee_sat,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
        lock_time,
    )?;

    let sig = sign_input(&tx, &witness_script, funding, vault, refund_key)?;
    tx.input[0].witness.script_witness = vec![sig, Vec::new(), Vec::new(), witness_script.to_bytes()];
    Ok(tx)
}

/// Unsigned spend of the swap output through the cooperative branch. Valid at
/// any height once both parties have signed it.
pub fn cooperative_refund_tx(
    funding: &HtlcFunding,
    destination: &Address,
    fee_sat: u64,
) -> Result<Transaction> {
    spend_tx(funding, destination, fee_sat, Sequence::MAX, LockTime::ZERO)
}

/// Signature of `key` over a cooperative spend of the swap output. `key` must
/// be one of the two script keys.
pub fn cooperative_signature(
    tx: &Transaction,
    spec: &HtlcSpec,
    funding: &HtlcFunding,
    vault: &KeyVault,
    key: &DerivedKey,
) -> Result<Vec<u8>> {
    let pubkey = key.public_key();
    anyhow::ensure!(
        pubkey == spec.claim_pubkey || pubkey == spec.refund_pubkey,
        "key is not part of the swap script"
    );
    sign_input(tx, &spec.witness_script(), funding, vault, key)
}

/// Checks the counterparty's claim-key signature, adds ours and completes the
/// cooperative witness.
pub fn finalize_cooperative_refund(
    mut tx: Transaction,
    spec: &HtlcSpec,
    funding: &HtlcFunding,
    vault: &KeyVault,
    refund_key: &DerivedKey,
    claim_sig: &[u8],
) -> Result<Transaction> {
    anyhow::ensure!(
        refund_key.public_key() == spec.refund_pubkey,
        "refund key does not match swap script"
    );
    anyhow::ensure!(
        tx.input.len() == 1 && tx.input[0].previous_output == funding.outpoint(),
        "cooperative refund must spend only the swap output"
    );
    let witness_script = spec.witness_script();
    verify_signature(&tx, &witness_script, funding, &spec.claim_pubkey, claim_sig)
        .context("counterparty signature")?;

    let refund_sig = sign_input(&tx, &witness_script, funding, vault, refund_key)?;
    tx.input[0].witness.script_witness = vec![
        claim_sig.to_vec(),
        refund_sig,
        vec![0x01],
        witness_script.to_bytes(),
    ];
    Ok(tx)
}

fn spend_tx(
    funding: &HtlcFunding,
    destination: &Address,
    fee_sat: u64,
    sequence: Sequence,
    lock_time: LockTime,
) -> Result<Transaction> {
    anyhow::ensure!(
        fee_sat < funding.amount_sat,
        "fee_sat ({fee_sat}) must be less than the swap amount ({})",
        funding.amount_sat
    );

    let input = TxIn {
        previous_output: funding.outpoint(),
        is_pegin: false,
        script_sig: Script::new(),
        sequence,
        asset_issuance: Default::default(),
        witness: TxInWitness::default(),
    };

    let outputs = vec![
        TxOut {
            asset: Asset::Explicit(funding.policy_asset),
            value: Value::Explicit(funding.amount_sat - fee_sat),
            nonce: Nonce::Null,
            script_pubkey: destination.script_pubkey(),
            witness: TxOutWitness::default(),
        },
        TxOut::new_fee(fee_sat, funding.policy_asset),
    ];

    Ok(Transaction {
        version: 2,
        lock_time,
        input: vec![input],
        output: outputs,
    })
}

fn input_sighash(tx: &Transaction, witness_script: &Script, funding: &HtlcFunding) -> [u8; 32] {
    let mut cache = SighashCache::new(tx);
    cache
        .segwitv0_sighash(
            0,
            witness_script,
            Value::Explicit(funding.amount_sat),
            EcdsaSighashType::All,
        )
        .to_byte_array()
}

fn sign_input(
    tx: &Transaction,
    witness_script: &Script,
    funding: &HtlcFunding,
    vault: &KeyVault,
    key: &DerivedKey,
) -> Result<Vec<u8>> {
    let sig = vault
        .sign(key, input_sighash(tx, witness_script, funding))
        .context("sign swap input")?;
    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All.as_u32() as u8);
    Ok(sig_bytes)
}

fn verify_signature(
    tx: &Transaction,
    witness_script: &Script,
    funding: &HtlcFunding,
    pubkey: &PublicKey,
    sig: &[u8],
) -> Result<()> {
    let (sighash_type, der) = sig.split_last().context("empty signature")?;
    anyhow::ensure!(
        u32::from(*sighash_type) == EcdsaSighashType::All.as_u32(),
        "signature must commit with SIGHASH_ALL"
    );
    let sig = Signature::from_der(der).context("decode DER signature")?;
    let msg = Message::from_digest(input_sighash(tx, witness_script, funding));
    Secp256k1::verification_only()
        .verify_ecdsa(&msg, &sig, pubkey)
        .context("signature does not verify")
}

/// Returns the preimage revealed by `tx` when it spends `outpoint` through the hash branch.
pub fn extract_preimage(
    tx: &Transaction,
    outpoint: &OutPoint,
    payment_hash: &[u8; 32],
) -> Option<[u8; 32]> {
    let input = tx.input.iter().find(|i| &i.previous_output == outpoint)?;
    let witness = &input.witness.script_witness;
    if witness.len() != 4 || !witness[2].is_empty() {
        return None;
    }
    let preimage: [u8; 32] = witness[1].as_slice().try_into().ok()?;
    (sha256_preimage(&preimage) == *payment_hash).then_some(preimage)
}

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}
