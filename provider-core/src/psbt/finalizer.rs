//! Final script and witness assembly
//!
//! Converts accumulated partial-signature data into the final unlocking
//! script or witness for the standard script shapes. Inputs with missing or
//! structurally invalid signature data fail loudly instead of being skipped.
use bitcoin::psbt::{Input as PsbtInput, Psbt};
use bitcoin::script::PushBytesBuf;
use bitcoin::sighash::TapSighashType;
use bitcoin::{taproot, ScriptBuf, Witness};

use provider_common::{Error, ErrorKind, Result, ResultExt};

use super::spent_output;

/// Finalizes one input in place
///
/// Inputs that already carry final data are left untouched; every other
/// signing-metadata field of the input is cleared once the final script or
/// witness is assembled.
pub fn finalize_input(psbt: &mut Psbt, index: usize) -> Result<()> {
    let spent = spent_output(psbt, index)?;

    let input = psbt.inputs.get_mut(index).ok_or_else(|| {
        Error::new(
            ErrorKind::ValidationError,
            format!("Input index out of range: {}", index),
        )
    })?;

    if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
        return Ok(());
    }

    let script = &spent.script_pubkey;

    if script.is_p2tr() {
        finalize_taproot(input, index)?;
    } else if script.is_p2wpkh() {
        finalize_p2wpkh(input, index)?;
    } else if script.is_p2sh() {
        finalize_p2sh_p2wpkh(input, index)?;
    } else if script.is_p2pkh() {
        finalize_p2pkh(input, index)?;
    } else {
        return Err(Error::new(
            ErrorKind::ValidationError,
            format!("Input {} spends an unsupported script shape", index),
        ));
    }

    clear_signing_metadata(input);
    Ok(())
}

fn finalize_taproot(input: &mut PsbtInput, index: usize) -> Result<()> {
    if let Some(signature) = input.tap_key_sig {
        let mut witness = Witness::new();
        witness.push(serialize_taproot_signature(&signature));
        input.final_script_witness = Some(witness);
        return Ok(());
    }

    let (control_block, (leaf_script, _)) = input.tap_scripts.iter().next().ok_or_else(|| {
        Error::new(
            ErrorKind::CustodyError,
            format!("Input {} has neither a key-path signature nor a leaf script", index),
        )
    })?;

    let signatures: Vec<&taproot::Signature> = input
        .tap_script_sigs
        .iter()
        .filter(|((_, leaf_hash), _)| {
            *leaf_hash == taproot::TapLeafHash::from_script(leaf_script, taproot::LeafVersion::TapScript)
        })
        .map(|(_, signature)| signature)
        .collect();

    if signatures.is_empty() {
        return Err(Error::new(
            ErrorKind::CustodyError,
            format!("Input {} has no signature for its leaf script", index),
        ));
    }

    let mut witness = Witness::new();
    for signature in signatures {
        witness.push(serialize_taproot_signature(signature));
    }
    witness.push(leaf_script.as_bytes());
    witness.push(control_block.serialize());
    input.final_script_witness = Some(witness);

    Ok(())
}

fn finalize_p2wpkh(input: &mut PsbtInput, index: usize) -> Result<()> {
    let (public_key, signature) = first_partial_sig(input, index)?;

    let mut witness = Witness::new();
    witness.push(signature.serialize().to_vec());
    witness.push(public_key.to_bytes());
    input.final_script_witness = Some(witness);

    Ok(())
}

fn finalize_p2sh_p2wpkh(input: &mut PsbtInput, index: usize) -> Result<()> {
    let redeem = input.redeem_script.clone().ok_or_else(|| {
        Error::new(
            ErrorKind::CustodyError,
            format!("Input {} spends a p2sh output without a redeem script", index),
        )
    })?;

    if !redeem.is_p2wpkh() {
        return Err(Error::new(
            ErrorKind::ValidationError,
            format!("Input {} has a redeem script that is not p2wpkh", index),
        ));
    }

    let (public_key, signature) = first_partial_sig(input, index)?;

    let mut witness = Witness::new();
    witness.push(signature.serialize().to_vec());
    witness.push(public_key.to_bytes());
    input.final_script_witness = Some(witness);

    let redeem_push = PushBytesBuf::try_from(redeem.to_bytes())
        .chain(|| (ErrorKind::ValidationError, "Redeem script exceeds push limits"))?;
    input.final_script_sig = Some(
        ScriptBuf::builder()
            .push_slice(redeem_push)
            .into_script(),
    );

    Ok(())
}

fn finalize_p2pkh(input: &mut PsbtInput, index: usize) -> Result<()> {
    let (public_key, signature) = first_partial_sig(input, index)?;

    let signature_push = PushBytesBuf::try_from(signature.serialize().to_vec())
        .chain(|| (ErrorKind::ValidationError, "Signature exceeds push limits"))?;
    let key_push = PushBytesBuf::try_from(public_key.to_bytes())
        .chain(|| (ErrorKind::ValidationError, "Public key exceeds push limits"))?;

    input.final_script_sig = Some(
        ScriptBuf::builder()
            .push_slice(signature_push)
            .push_slice(key_push)
            .into_script(),
    );

    Ok(())
}

fn first_partial_sig(
    input: &PsbtInput,
    index: usize,
) -> Result<(bitcoin::PublicKey, bitcoin::ecdsa::Signature)> {
    input
        .partial_sigs
        .iter()
        .next()
        .map(|(public_key, signature)| (*public_key, *signature))
        .ok_or_else(|| {
            Error::new(
                ErrorKind::CustodyError,
                format!("Input {} has no signature to finalize", index),
            )
        })
}

/// Serializes a taproot signature, appending the sighash flag byte only for
/// non-default types
fn serialize_taproot_signature(signature: &taproot::Signature) -> Vec<u8> {
    let mut bytes = signature.signature.serialize().to_vec();
    if signature.sighash_type != TapSighashType::Default {
        bytes.push(bitcoin::psbt::PsbtSighashType::from(signature.sighash_type).to_u32() as u8);
    }
    bytes
}

/// Clears per-input signing metadata after finalization; the previous-output
/// records stay so later runs can still attribute the input
fn clear_signing_metadata(input: &mut PsbtInput) {
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
    input.tap_key_origins.clear();
}
