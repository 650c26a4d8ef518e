//! PSBT signing engine
//!
//! Decides which transaction inputs get signed, with which logical key and
//! under which signature-hash policy, including the taproot key-path vs
//! script-path disambiguation. The engine never touches raw key material;
//! actual signatures come from the key custody component.
pub mod finalizer;

use bitcoin::psbt::{Input as PsbtInput, Psbt};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, PublicKey, ScriptBuf, TxOut, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use provider_common::{Error, ErrorKind, Result, ResultExt};

use crate::account::Account;
use crate::custody::{CustodyRoute, KeyCustody};

/// Which taproot signer a script-path input should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapSigner {
    /// Sign with the tweaked output key
    Tweaked,
    /// Sign with the plain internal key
    Untweaked,
}

/// Caller-supplied input selector, as received on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserToSignInput {
    /// Input position; accepted as an integer or a numeric string
    pub index: Value,
    /// Address the input must belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Public key the input must belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Allowed signature-hash flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sighash_types: Option<Vec<Value>>,
    /// Fixed taproot signer preference; when absent the engine decides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_tweaked_signer: Option<bool>,
}

impl UserToSignInput {
    fn parsed_index(&self) -> Result<usize> {
        match &self.index {
            Value::Number(number) => number
                .as_u64()
                .map(|index| index as usize)
                .ok_or_else(|| invalid_index(&self.index)),
            Value::String(text) => text.parse::<usize>().err_kind(ErrorKind::ValidationError, || {
                format!("To-sign input index is not a non-negative integer: {}", text)
            }),
            other => Err(invalid_index(other)),
        }
    }

    fn parsed_sighash_types(&self) -> Result<Option<Vec<u32>>> {
        let raw = match &self.sighash_types {
            None => return Ok(None),
            Some(raw) => raw,
        };

        let mut flags = Vec::with_capacity(raw.len());
        for value in raw {
            let flag = match value {
                Value::Number(number) => number.as_u64().map(|flag| flag as u32),
                _ => None,
            };
            flags.push(flag.ok_or_else(|| {
                Error::new(
                    ErrorKind::ValidationError,
                    format!("Signature-hash flag is not numeric: {}", value),
                )
            })?);
        }

        Ok(Some(flags))
    }
}

fn invalid_index(value: &Value) -> Error {
    Error::new(
        ErrorKind::ValidationError,
        format!("To-sign input index is not a non-negative integer: {}", value),
    )
}

/// Authoritative description of one input to sign
#[derive(Debug, Clone, PartialEq)]
pub struct ToSignInput {
    /// Input position in the transaction
    pub index: usize,
    /// Logical key the input is signed with
    pub public_key: PublicKey,
    /// Allowed signature-hash flags, if restricted
    pub sighash_types: Option<Vec<u32>>,
    /// Taproot signer decision; fixed by the caller or computed once during
    /// classification
    pub tap_signer: Option<TapSigner>,
    /// Whether the input already carried signature data when it was selected
    pub already_signed: bool,
}

/// Result of classifying one input during signing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TapClassification {
    /// The spent output is not a taproot output
    NotTaproot,
    /// Key-path spend with the account internal key
    KeyPath,
    /// Script-path spend
    ScriptPath {
        /// Whether the tweaked signer was chosen
        tweaked: bool,
    },
    /// Classification failed; the input was left unmodified
    Unclassified,
}

/// Observable per-input status of a signing run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputStatus {
    /// Input position in the transaction
    pub index: usize,
    /// Taproot classification outcome
    pub classification: TapClassification,
    /// Whether the input is finalized after the run
    pub finalized: bool,
}

/// Outcome of a signing run
#[derive(Debug)]
pub struct SignOutcome {
    /// The new authoritative transaction; callers must discard prior copies
    pub psbt: Psbt,
    /// Which custody path produced (or deferred) the signatures
    pub route: CustodyRoute,
    /// Per-input classification and finalization status
    pub statuses: Vec<InputStatus>,
}

/// Resolves the output spent by given input, from the witness-style record
/// or by decoding the referenced previous transaction
pub fn spent_output(psbt: &Psbt, index: usize) -> Result<TxOut> {
    let input = psbt.inputs.get(index).ok_or_else(|| {
        Error::new(
            ErrorKind::ValidationError,
            format!("Input index out of range: {}", index),
        )
    })?;

    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.clone());
    }

    if let Some(prev_tx) = &input.non_witness_utxo {
        let txin = psbt.unsigned_tx.input.get(index).ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                format!("Transaction has no input at index {}", index),
            )
        })?;
        let vout = txin.previous_output.vout as usize;
        return prev_tx.output.get(vout).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                format!("Previous transaction has no output at index {}", vout),
            )
        });
    }

    Err(Error::new(
        ErrorKind::ValidationError,
        format!("Input {} carries no previous output information", index),
    ))
}

/// Whether the input already carries any signature data
pub fn input_is_signed(input: &PsbtInput) -> bool {
    input_is_finalized(input)
        || input.tap_key_sig.is_some()
        || !input.partial_sigs.is_empty()
        || !input.tap_script_sigs.is_empty()
}

/// Whether the input carries a final script or witness
pub fn input_is_finalized(input: &PsbtInput) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Computes sign decisions and drives the custody component
pub struct SigningEngine<'a, C: KeyCustody + ?Sized> {
    custody: &'a C,
    network: Network,
    secp: Secp256k1<All>,
}

impl<'a, C: KeyCustody + ?Sized> SigningEngine<'a, C> {
    /// Creates an engine over given custody component and network
    pub fn new(custody: &'a C, network: Network) -> Self {
        Self {
            custody,
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Computes the authoritative list of inputs to sign
    ///
    /// With explicit selectors every selector is validated against the active
    /// account (fail fast, before any signing attempt); without selectors the
    /// transaction is scanned for unsigned inputs owned by the account,
    /// falling back to whole-transaction signing when the scan finds nothing.
    pub fn compute_to_sign_inputs(
        &self,
        psbt: &Psbt,
        account: &Account,
        selectors: Option<&[UserToSignInput]>,
    ) -> Result<Vec<ToSignInput>> {
        match selectors.filter(|selectors| !selectors.is_empty()) {
            Some(selectors) => self.resolve_selectors(psbt, account, selectors),
            None => Ok(self.scan_inputs(psbt, account)),
        }
    }

    fn resolve_selectors(
        &self,
        psbt: &Psbt,
        account: &Account,
        selectors: &[UserToSignInput],
    ) -> Result<Vec<ToSignInput>> {
        let mut to_sign = Vec::with_capacity(selectors.len());

        for selector in selectors {
            let index = selector.parsed_index()?;

            if selector.address.is_none() && selector.public_key.is_none() {
                return Err(Error::new(
                    ErrorKind::ValidationError,
                    format!(
                        "To-sign input {} specifies neither an address nor a public key",
                        index
                    ),
                ));
            }

            if let Some(address) = &selector.address {
                if *address != account.address {
                    return Err(Error::new(
                        ErrorKind::ValidationError,
                        format!(
                            "To-sign input {} address does not match the current account",
                            index
                        ),
                    ));
                }
            }

            if let Some(public_key) = &selector.public_key {
                if *public_key != account.public_key.to_string() {
                    return Err(Error::new(
                        ErrorKind::ValidationError,
                        format!(
                            "To-sign input {} public key does not match the current account",
                            index
                        ),
                    ));
                }
            }

            let input = psbt.inputs.get(index).ok_or_else(|| {
                Error::new(
                    ErrorKind::ValidationError,
                    format!("To-sign input index out of range: {}", index),
                )
            })?;

            to_sign.push(ToSignInput {
                index,
                public_key: account.public_key,
                sighash_types: selector.parsed_sighash_types()?,
                tap_signer: selector.use_tweaked_signer.map(|tweaked| {
                    if tweaked {
                        TapSigner::Tweaked
                    } else {
                        TapSigner::Untweaked
                    }
                }),
                already_signed: input_is_signed(input),
            });
        }

        Ok(to_sign)
    }

    fn scan_inputs(&self, psbt: &Psbt, account: &Account) -> Vec<ToSignInput> {
        let mut to_sign = Vec::new();

        for (index, input) in psbt.inputs.iter().enumerate() {
            if input_is_signed(input) {
                continue;
            }

            let script = match spent_output(psbt, index) {
                Ok(output) => output.script_pubkey,
                Err(err) => {
                    log::debug!("Skipping input {} during scan: {}", index, err);
                    continue;
                }
            };

            if self.script_address(&script).as_deref() == Some(account.address.as_str()) {
                to_sign.push(self.scanned_input(index, input, account));
            }
        }

        if to_sign.is_empty() {
            // no input could be attributed to the account; fall back to
            // whole-transaction signing so uncommon script shapes stay usable
            for (index, input) in psbt.inputs.iter().enumerate() {
                if !input_is_signed(input) {
                    to_sign.push(self.scanned_input(index, input, account));
                }
            }
        }

        to_sign
    }

    fn scanned_input(&self, index: usize, input: &PsbtInput, account: &Account) -> ToSignInput {
        ToSignInput {
            index,
            public_key: account.public_key,
            sighash_types: input.sighash_type.map(|sighash| vec![sighash.to_u32()]),
            tap_signer: None,
            already_signed: false,
        }
    }

    fn script_address(&self, script: &ScriptBuf) -> Option<String> {
        Address::from_script(script.as_script(), self.network)
            .ok()
            .map(|address| address.to_string())
    }

    /// Signs the listed inputs with the active account and optionally
    /// finalizes exactly those inputs
    ///
    /// The PSBT is exclusively owned by this call; the returned PSBT is the
    /// new authoritative value.
    pub fn sign_psbt(
        &self,
        mut psbt: Psbt,
        account: &Account,
        mut to_sign: Vec<ToSignInput>,
        auto_finalize: bool,
    ) -> Result<SignOutcome> {
        let mut statuses = Vec::with_capacity(to_sign.len());

        for item in to_sign.iter_mut() {
            let input = psbt.inputs.get(item.index).ok_or_else(|| {
                Error::new(
                    ErrorKind::ValidationError,
                    format!("To-sign input index out of range: {}", item.index),
                )
            })?;

            let classification = if input_is_finalized(input) {
                TapClassification::Unclassified
            } else {
                match self.classify_taproot(&mut psbt, account, item) {
                    Ok(classification) => classification,
                    Err(err) => {
                        // best effort: the input keeps its original fields
                        log::warn!(
                            "Taproot classification failed for input {}: {}",
                            item.index,
                            err
                        );
                        TapClassification::Unclassified
                    }
                }
            };

            statuses.push(InputStatus {
                index: item.index,
                classification,
                finalized: false,
            });
        }

        let route = self.custody.route(account);

        psbt = match route {
            CustodyRoute::LocalSign => self.custody.sign_transaction(account, psbt, &to_sign)?,
            CustodyRoute::RemoteExchangeRequired => {
                // annotate key origins and defer the actual signature to the
                // external exchange; the transaction goes back unsigned
                annotate_for_remote_exchange(&mut psbt, account, &to_sign)?;
                psbt
            }
            CustodyRoute::Unsupported => {
                return Err(Error::new(
                    ErrorKind::CustodyError,
                    "No signing route available for the active account",
                ));
            }
        };

        if auto_finalize && route == CustodyRoute::LocalSign {
            for item in &to_sign {
                if item.already_signed {
                    continue;
                }
                finalizer::finalize_input(&mut psbt, item.index)?;
            }
        }

        for status in statuses.iter_mut() {
            if let Some(input) = psbt.inputs.get(status.index) {
                status.finalized = input_is_finalized(input);
            }
        }

        Ok(SignOutcome {
            psbt,
            route,
            statuses,
        })
    }

    /// Classifies one taproot input as key-path or script-path spending and
    /// records the signer decision on the to-sign entry
    ///
    /// The decision is computed once per input: a preference already fixed by
    /// the caller (or a previous run) is kept, so re-running is idempotent.
    fn classify_taproot(
        &self,
        psbt: &mut Psbt,
        account: &Account,
        item: &mut ToSignInput,
    ) -> Result<TapClassification> {
        let spent = spent_output(psbt, item.index)?;

        if !spent.script_pubkey.is_p2tr() {
            return Ok(TapClassification::NotTaproot);
        }

        let internal_key = account.x_only();
        let key_path_script = ScriptBuf::new_p2tr(&self.secp, internal_key, None);

        let input = psbt.inputs.get_mut(item.index).ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                format!("Input index out of range: {}", item.index),
            )
        })?;

        if key_path_script == spent.script_pubkey {
            // key-path spending: the plain internal key satisfies the output;
            // key-path and script-path annotations are mutually exclusive
            input.tap_internal_key = Some(internal_key);
            input.tap_merkle_root = None;
            input.tap_scripts.clear();
            item.tap_signer.get_or_insert(TapSigner::Tweaked);
            return Ok(TapClassification::KeyPath);
        }

        if item.tap_signer.is_none() {
            let first_leaf_holds_key = input
                .tap_scripts
                .values()
                .next()
                .map(|(script, _)| script_contains_key(script, &internal_key))
                .unwrap_or(false);

            // the account is a literal participant of the leaf script iff its
            // x-only key appears in it; otherwise it only controls the
            // (irrelevant) key-path fallback, so default to the tweaked signer
            item.tap_signer = Some(if first_leaf_holds_key {
                TapSigner::Untweaked
            } else {
                TapSigner::Tweaked
            });
        }

        Ok(TapClassification::ScriptPath {
            tweaked: item.tap_signer == Some(TapSigner::Tweaked),
        })
    }
}

/// Whether the serialized script contains the x-only key bytes
fn script_contains_key(script: &ScriptBuf, key: &XOnlyPublicKey) -> bool {
    let needle = key.serialize();
    script
        .as_bytes()
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Annotates the listed inputs with the key-derivation metadata an external
/// signer needs (master fingerprint, derivation path, public key)
fn annotate_for_remote_exchange(
    psbt: &mut Psbt,
    account: &Account,
    to_sign: &[ToSignInput],
) -> Result<()> {
    let (fingerprint, path) = account.key_source.clone().ok_or_else(|| {
        Error::new(
            ErrorKind::CustodyError,
            "Hardware account is missing key origin metadata",
        )
    })?;

    let taproot_flags: Vec<(usize, bool)> = to_sign
        .iter()
        .filter(|item| !item.already_signed)
        .map(|item| {
            spent_output(psbt, item.index)
                .map(|output| (item.index, output.script_pubkey.is_p2tr()))
        })
        .collect::<Result<_>>()?;

    for (index, is_taproot) in taproot_flags {
        let input = psbt.inputs.get_mut(index).ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                format!("Input index out of range: {}", index),
            )
        })?;

        if is_taproot {
            let internal_key = account.x_only();
            input.tap_internal_key.get_or_insert(internal_key);
            input
                .tap_key_origins
                .insert(internal_key, (Vec::new(), (fingerprint, path.clone())));
        } else {
            input
                .bip32_derivation
                .insert(account.public_key.inner, (fingerprint, path.clone()));
        }
    }

    Ok(())
}
