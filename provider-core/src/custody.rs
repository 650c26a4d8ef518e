//! Key custody interfaces
//!
//! The provider never holds raw key material. Accounts are routed to one of
//! three custody paths: local signing, a remote signing exchange (hardware
//! signers), or no path at all. [`SoftwareCustody`] is the local keyring.
use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Keypair, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::sign_message::signed_msg_hash;
use bitcoin::taproot::TapLeafHash;
use bitcoin::{ecdsa, taproot, PublicKey, TxOut};
use serde::{Deserialize, Serialize};

use provider_common::{Error, ErrorKind, Result};

use crate::account::{Account, KeyringKind};
use crate::psbt::{spent_output, TapSigner, ToSignInput};

/// How signatures for an account are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodyRoute {
    /// The custody component signs locally
    LocalSign,
    /// Signatures come from an external exchange; the transaction is
    /// annotated and returned unsigned
    RemoteExchangeRequired,
    /// No key material reachable for the account
    Unsupported,
}

/// Supported message signing schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSignKind {
    /// Legacy recoverable signature over the signed-message hash
    #[serde(rename = "ecdsa")]
    Ecdsa,
    /// BIP-322 simple signature
    #[serde(rename = "bip322-simple")]
    Bip322Simple,
}

/// Key custody component
///
/// `sign_transaction` mutates and returns the transaction; callers must
/// treat the returned value as the new authoritative one.
pub trait KeyCustody: Send + Sync {
    /// Classifies how signatures for given account are produced
    fn route(&self, account: &Account) -> CustodyRoute;

    /// Signs the listed inputs and returns the updated transaction
    fn sign_transaction(
        &self,
        account: &Account,
        psbt: Psbt,
        to_sign: &[ToSignInput],
    ) -> Result<Psbt>;

    /// Signs a text message with the key behind given public key
    fn sign_message(
        &self,
        public_key: &PublicKey,
        kind: MessageSignKind,
        text: &str,
    ) -> Result<String>;
}

/// Local software keyring
///
/// Holds secp256k1 keypairs in memory and implements ECDSA signing for the
/// legacy and segwit-v0 script shapes plus Schnorr signing for taproot key
/// path and script path spends.
pub struct SoftwareCustody {
    keys: HashMap<PublicKey, SecretKey>,
    secp: Secp256k1<All>,
}

impl Default for SoftwareCustody {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareCustody {
    /// Creates an empty keyring
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            secp: Secp256k1::new(),
        }
    }

    /// Adds a secret key and returns its public key
    pub fn insert_key(&mut self, secret_key: SecretKey) -> PublicKey {
        let public_key = PublicKey::new(secret_key.public_key(&self.secp));
        self.keys.insert(public_key, secret_key);
        public_key
    }

    /// Secp context shared with helpers
    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    fn secret_for(&self, public_key: &PublicKey) -> Result<&SecretKey> {
        self.keys.get(public_key).ok_or_else(|| {
            Error::new(
                ErrorKind::CustodyError,
                "No keyring holds the requested public key",
            )
        })
    }

    /// Checks the effective sighash flag against the allowed set of the
    /// to-sign entry
    fn check_sighash_allowed(item: &ToSignInput, effective: u32) -> Result<()> {
        if let Some(allowed) = &item.sighash_types {
            if !allowed.contains(&effective) {
                return Err(Error::new(
                    ErrorKind::CustodyError,
                    format!(
                        "Sighash type {} is not allowed for input {}",
                        effective, item.index
                    ),
                ));
            }
        }
        Ok(())
    }

    fn sign_taproot_input(
        &self,
        psbt: &mut Psbt,
        prevouts: &[TxOut],
        item: &ToSignInput,
        keypair: &Keypair,
    ) -> Result<()> {
        let input = &psbt.inputs[item.index];

        let sighash_type = match input.sighash_type {
            Some(sighash) => sighash.taproot_hash_ty().map_err(|_| {
                Error::new(
                    ErrorKind::CustodyError,
                    format!("Input {} carries a non-taproot sighash type", item.index),
                )
            })?,
            None => TapSighashType::Default,
        };
        Self::check_sighash_allowed(item, sighash_type as u32)?;

        let leaf = input
            .tap_scripts
            .values()
            .next()
            .map(|(script, version)| (script.clone(), *version));

        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        let prevouts = Prevouts::All(prevouts);

        if let Some((leaf_script, leaf_version)) = leaf {
            // script path: sign the first alternative spending leaf
            let leaf_hash = TapLeafHash::from_script(&leaf_script, leaf_version);
            let sighash = cache
                .taproot_script_spend_signature_hash(item.index, &prevouts, leaf_hash, sighash_type)
                .map_err(|err| {
                    Error::new(ErrorKind::CustodyError, format!("Sighash failure: {}", err))
                })?;
            let message = Message::from_digest(sighash.to_byte_array());

            let (signer, signer_key) = match item.tap_signer {
                Some(TapSigner::Untweaked) => {
                    (*keypair, keypair.x_only_public_key().0)
                }
                _ => {
                    let tweaked = keypair
                        .tap_tweak(&self.secp, psbt.inputs[item.index].tap_merkle_root)
                        .to_inner();
                    (tweaked, tweaked.x_only_public_key().0)
                }
            };

            let signature = taproot::Signature {
                signature: self.secp.sign_schnorr(&message, &signer),
                sighash_type,
            };
            psbt.inputs[item.index]
                .tap_script_sigs
                .insert((signer_key, leaf_hash), signature);
        } else {
            // key path: sign with the tweaked internal key
            let sighash = cache
                .taproot_key_spend_signature_hash(item.index, &prevouts, sighash_type)
                .map_err(|err| {
                    Error::new(ErrorKind::CustodyError, format!("Sighash failure: {}", err))
                })?;
            let message = Message::from_digest(sighash.to_byte_array());

            let tweaked = keypair
                .tap_tweak(&self.secp, psbt.inputs[item.index].tap_merkle_root)
                .to_inner();

            psbt.inputs[item.index].tap_key_sig = Some(taproot::Signature {
                signature: self.secp.sign_schnorr(&message, &tweaked),
                sighash_type,
            });
        }

        Ok(())
    }

    fn sign_ecdsa_input(
        &self,
        psbt: &mut Psbt,
        spent: &TxOut,
        item: &ToSignInput,
        secret_key: &SecretKey,
        public_key: PublicKey,
    ) -> Result<()> {
        let input = &psbt.inputs[item.index];

        let sighash_type = match input.sighash_type {
            Some(sighash) => sighash.ecdsa_hash_ty().map_err(|_| {
                Error::new(
                    ErrorKind::CustodyError,
                    format!("Input {} carries a non-ecdsa sighash type", item.index),
                )
            })?,
            None => EcdsaSighashType::All,
        };
        Self::check_sighash_allowed(item, sighash_type.to_u32())?;

        let script = &spent.script_pubkey;
        let mut cache = SighashCache::new(&psbt.unsigned_tx);

        let message = if script.is_p2wpkh() {
            let sighash = cache
                .p2wpkh_signature_hash(item.index, script, spent.value, sighash_type)
                .map_err(|err| {
                    Error::new(ErrorKind::CustodyError, format!("Sighash failure: {}", err))
                })?;
            Message::from_digest(sighash.to_byte_array())
        } else if script.is_p2sh() {
            let redeem = input.redeem_script.clone().ok_or_else(|| {
                Error::new(
                    ErrorKind::CustodyError,
                    format!("Input {} spends a p2sh output without a redeem script", item.index),
                )
            })?;
            if !redeem.is_p2wpkh() {
                return Err(Error::new(
                    ErrorKind::CustodyError,
                    format!("Input {} spends an unsupported p2sh output", item.index),
                ));
            }
            let sighash = cache
                .p2wpkh_signature_hash(item.index, &redeem, spent.value, sighash_type)
                .map_err(|err| {
                    Error::new(ErrorKind::CustodyError, format!("Sighash failure: {}", err))
                })?;
            Message::from_digest(sighash.to_byte_array())
        } else {
            let sighash = cache
                .legacy_signature_hash(item.index, script, sighash_type.to_u32())
                .map_err(|err| {
                    Error::new(ErrorKind::CustodyError, format!("Sighash failure: {}", err))
                })?;
            Message::from_digest(sighash.to_byte_array())
        };

        let signature = ecdsa::Signature {
            signature: self.secp.sign_ecdsa(&message, secret_key),
            sighash_type,
        };
        psbt.inputs[item.index]
            .partial_sigs
            .insert(public_key, signature);

        Ok(())
    }
}

impl KeyCustody for SoftwareCustody {
    fn route(&self, account: &Account) -> CustodyRoute {
        match account.kind {
            KeyringKind::Hardware => CustodyRoute::RemoteExchangeRequired,
            KeyringKind::Local => {
                if self.keys.contains_key(&account.public_key) {
                    CustodyRoute::LocalSign
                } else {
                    CustodyRoute::Unsupported
                }
            }
        }
    }

    fn sign_transaction(
        &self,
        account: &Account,
        mut psbt: Psbt,
        to_sign: &[ToSignInput],
    ) -> Result<Psbt> {
        let secret_key = *self.secret_for(&account.public_key)?;
        let keypair = Keypair::from_secret_key(&self.secp, &secret_key);

        // taproot sighashes commit to every spent output
        let mut prevouts = Vec::with_capacity(psbt.inputs.len());
        let mut prevouts_complete = true;
        for index in 0..psbt.inputs.len() {
            match spent_output(&psbt, index) {
                Ok(output) => prevouts.push(output),
                Err(_) => {
                    prevouts_complete = false;
                    break;
                }
            }
        }

        for item in to_sign {
            if item.already_signed {
                continue;
            }

            let spent = spent_output(&psbt, item.index)?;

            if spent.script_pubkey.is_p2tr() {
                if !prevouts_complete {
                    return Err(Error::new(
                        ErrorKind::CustodyError,
                        "Taproot signing requires every previous output to be known",
                    ));
                }
                self.sign_taproot_input(&mut psbt, &prevouts, item, &keypair)?;
            } else {
                self.sign_ecdsa_input(&mut psbt, &spent, item, &secret_key, item.public_key)?;
            }
        }

        Ok(psbt)
    }

    fn sign_message(
        &self,
        public_key: &PublicKey,
        kind: MessageSignKind,
        text: &str,
    ) -> Result<String> {
        match kind {
            MessageSignKind::Ecdsa => {
                let secret_key = self.secret_for(public_key)?;
                let hash = signed_msg_hash(text);
                let message = Message::from_digest(hash.to_byte_array());

                let signature = self.secp.sign_ecdsa_recoverable(&message, secret_key);
                let (recovery_id, compact) = signature.serialize_compact();

                // compact recoverable encoding with the compressed-key header
                let mut bytes = Vec::with_capacity(65);
                bytes.push(31 + recovery_id.to_i32() as u8);
                bytes.extend_from_slice(&compact);

                use bitcoin::base64::engine::general_purpose::STANDARD;
                use bitcoin::base64::Engine;
                Ok(STANDARD.encode(bytes))
            }
            MessageSignKind::Bip322Simple => Err(Error::new(
                ErrorKind::CustodyError,
                "BIP-322 message signing is not supported by the software keyring",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::{p2wpkh_psbt, wpkh_account};

    #[test]
    fn check_route_classification() {
        let mut custody = SoftwareCustody::new();
        let local = wpkh_account(&mut custody, 1);
        let hardware = crate::test_support::hardware_account(&local);
        let unknown = Account::new_local(
            local.address.clone(),
            wpkh_account(&mut SoftwareCustody::new(), 9).public_key,
        );

        assert_eq!(CustodyRoute::LocalSign, custody.route(&local));
        assert_eq!(
            CustodyRoute::RemoteExchangeRequired,
            custody.route(&hardware)
        );
        assert_eq!(CustodyRoute::Unsupported, custody.route(&unknown));
    }

    #[test]
    fn check_sighash_restriction_is_enforced() {
        let mut custody = SoftwareCustody::new();
        let account = wpkh_account(&mut custody, 1);
        let psbt = p2wpkh_psbt(&[&account]);

        let item = ToSignInput {
            index: 0,
            public_key: account.public_key,
            // only SIGHASH_NONE allowed; the effective type is SIGHASH_ALL
            sighash_types: Some(vec![2]),
            tap_signer: None,
            already_signed: false,
        };

        let error = custody
            .sign_transaction(&account, psbt, &[item])
            .expect_err("Disallowed sighash must fail");
        assert_eq!(ErrorKind::CustodyError, error.kind());
    }

    #[test]
    fn check_p2wpkh_signature_lands_in_partial_sigs() {
        let mut custody = SoftwareCustody::new();
        let account = wpkh_account(&mut custody, 1);
        let psbt = p2wpkh_psbt(&[&account]);

        let item = ToSignInput {
            index: 0,
            public_key: account.public_key,
            sighash_types: None,
            tap_signer: None,
            already_signed: false,
        };

        let signed = custody.sign_transaction(&account, psbt, &[item]).unwrap();
        assert_eq!(1, signed.inputs[0].partial_sigs.len());
        assert!(signed.inputs[0].partial_sigs.contains_key(&account.public_key));
    }
}
