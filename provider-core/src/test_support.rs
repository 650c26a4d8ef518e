//! Shared fixtures for unit tests
use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_CHECKSIG;
use bitcoin::secp256k1::SecretKey;
use bitcoin::taproot::{LeafVersion, TaprootBuilder};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, Psbt, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::account::Account;
use crate::custody::SoftwareCustody;

const INPUT_VALUE: u64 = 100_000;

fn secret(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).expect("Valid secret key bytes")
}

/// Local account spending p2wpkh outputs
pub fn wpkh_account(custody: &mut SoftwareCustody, seed: u8) -> Account {
    let public_key = custody.insert_key(secret(seed));
    let compressed = CompressedPublicKey(public_key.inner);
    let address = Address::p2wpkh(&compressed, Network::Regtest);
    Account::new_local(address.to_string(), public_key)
}

/// Local account spending its taproot key-path output
pub fn taproot_account(custody: &mut SoftwareCustody, seed: u8) -> Account {
    let public_key = custody.insert_key(secret(seed));
    let x_only = public_key.inner.x_only_public_key().0;
    let address = Address::p2tr(custody.secp(), x_only, None, Network::Regtest);
    Account::new_local(address.to_string(), public_key)
}

/// Hardware twin of an existing account, with key origin metadata
pub fn hardware_account(base: &Account) -> Account {
    Account::new_hardware(
        base.address.clone(),
        base.public_key,
        Fingerprint::from([0xb0, 0x0b, 0x1e, 0x55]),
        DerivationPath::from_str("m/86'/1'/0'/0/0").expect("Valid derivation path"),
    )
}

fn unsigned_tx(input_count: usize) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: (0..input_count)
            .map(|vout| TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: vout as u32,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect(),
        output: vec![TxOut {
            value: Amount::from_sat(INPUT_VALUE * input_count as u64 - 500),
            script_pubkey: ScriptBuf::new_op_return([0u8; 8]),
        }],
    }
}

fn script_of(account: &Account) -> ScriptBuf {
    Address::from_str(&account.address)
        .expect("Valid address")
        .assume_checked()
        .script_pubkey()
}

/// Transaction with one p2wpkh input per owner
pub fn p2wpkh_psbt(owners: &[&Account]) -> Psbt {
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(owners.len())).expect("Unsigned transaction");

    for (input, owner) in psbt.inputs.iter_mut().zip(owners) {
        input.witness_utxo = Some(TxOut {
            value: Amount::from_sat(INPUT_VALUE),
            script_pubkey: script_of(owner),
        });
    }

    psbt
}

/// Transaction with two taproot inputs: input 0 spends the account's
/// key-path output, input 1 spends a script-path output with one leaf
///
/// The leaf script commits to the account key when `leaf_holds_account_key`
/// is set, otherwise to an unrelated key.
pub fn p2tr_script_path_psbt(
    custody: &SoftwareCustody,
    account: &Account,
    leaf_holds_account_key: bool,
) -> Psbt {
    let secp = custody.secp();
    let internal_key = account.x_only();

    let leaf_key = if leaf_holds_account_key {
        internal_key
    } else {
        secret(7).public_key(secp).x_only_public_key().0
    };
    let leaf_script = ScriptBuf::builder()
        .push_slice(leaf_key.serialize())
        .push_opcode(OP_CHECKSIG)
        .into_script();

    let spend_info = TaprootBuilder::new()
        .add_leaf(0, leaf_script.clone())
        .expect("Single leaf")
        .finalize(secp, internal_key)
        .expect("Complete taproot tree");
    let script_path_output = ScriptBuf::new_p2tr(secp, internal_key, spend_info.merkle_root());
    let control_block = spend_info
        .control_block(&(leaf_script.clone(), LeafVersion::TapScript))
        .expect("Control block for the only leaf");

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(2)).expect("Unsigned transaction");

    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: Amount::from_sat(INPUT_VALUE),
        script_pubkey: ScriptBuf::new_p2tr(secp, internal_key, None),
    });

    psbt.inputs[1].witness_utxo = Some(TxOut {
        value: Amount::from_sat(INPUT_VALUE),
        script_pubkey: script_path_output,
    });
    psbt.inputs[1].tap_internal_key = Some(internal_key);
    psbt.inputs[1].tap_merkle_root = spend_info.merkle_root();
    psbt.inputs[1]
        .tap_scripts
        .insert(control_block, (leaf_script, LeafVersion::TapScript));

    psbt
}
