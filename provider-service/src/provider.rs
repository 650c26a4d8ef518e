//! Provider operation implementations
//!
//! The operations behind the method surface, shared between the gated and
//! the ungated execution paths: the same implementation runs whether or not
//! a human decision was required.
use bitcoin::Psbt;
use serde::Deserialize;
use serde_json::{json, Value};

use provider_common::{Error, ErrorKind, Result, ResultExt, ServiceRequest};
use provider_core::account::{ChainType, NetworkType};
use provider_core::custody::{KeyCustody, MessageSignKind};
use provider_core::psbt::{finalizer, input_is_finalized, input_is_signed, SigningEngine, UserToSignInput};
use provider_core::service::{
    AccountStore, ChainBackend, PermissionStore, EVENT_ACCOUNTS_CHANGED, EVENT_CHAIN_CHANGED,
    EVENT_NETWORK_CHANGED,
};

use crate::methods::PrecheckEnv;

/// Per-transaction signing options, as received on the wire
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignPsbtOptions {
    /// Finalize the signed inputs (defaults to true)
    #[serde(default)]
    pub auto_finalized: Option<bool>,
    /// Explicit input selectors
    #[serde(default)]
    pub to_sign_inputs: Option<Vec<UserToSignInput>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignPsbtParams {
    psbt_hex: String,
    #[serde(default)]
    options: Option<SignPsbtOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiSignPsbtParams {
    psbt_hexs: Vec<String>,
    #[serde(default)]
    options: Option<Vec<SignPsbtOptions>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBitcoinParams {
    to_address: String,
    satoshis: u64,
}

#[derive(Debug, Deserialize)]
struct SignTextParams {
    text: String,
    #[serde(rename = "type", default)]
    kind: Option<MessageSignKind>,
}

#[derive(Debug, Deserialize)]
struct MultiSignMessageParams {
    messages: Vec<SignTextParams>,
}

/// Operation implementations over the collaborator stores
pub struct Provider<P, A, C, K> {
    permissions: P,
    accounts: A,
    backend: C,
    custody: K,
}

impl<P, A, C, K> Provider<P, A, C, K>
where
    P: PermissionStore,
    A: AccountStore,
    C: ChainBackend,
    K: KeyCustody,
{
    /// Creates a provider over given collaborators
    pub fn new(permissions: P, accounts: A, backend: C, custody: K) -> Self {
        Self {
            permissions,
            accounts,
            backend,
            custody,
        }
    }

    /// Permission store of this provider
    pub fn permissions(&self) -> &P {
        &self.permissions
    }

    /// Account store of this provider
    pub fn accounts(&self) -> &A {
        &self.accounts
    }

    /// Chain backend of this provider
    pub fn backend(&self) -> &C {
        &self.backend
    }

    /// Snapshot of state available to prechecks
    pub fn precheck_env(&self) -> Result<PrecheckEnv> {
        Ok(PrecheckEnv {
            network_type: self.accounts.network_type(),
            chain_type: self.accounts.chain_type(),
            current_address: self.accounts.current_account()?.address,
        })
    }

    /// Runs the operation behind a classified request
    pub fn execute(&self, request: &ServiceRequest) -> Result<Value> {
        match request.method.as_str() {
            "requestAccounts" => self.request_accounts(&request.origin),
            "getAccounts" => self.get_accounts(&request.origin),
            "getNetwork" => Ok(json!(self.accounts.network_type().name())),
            "getChain" => Ok(json!(self.accounts.chain_type().name())),
            "getPublicKey" => self.get_public_key(&request.origin),
            "getBalance" => self.get_balance(&request.origin),
            "getVersion" => Ok(json!(env!("CARGO_PKG_VERSION"))),
            "pushTx" => self.push_tx(&request.params),
            "pushPsbt" => self.push_psbt(&request.params),
            "switchNetwork" => self.switch_network(&request.params),
            "switchChain" => self.switch_chain(&request.params),
            "sendBitcoin" => self.send_bitcoin(&request.params),
            "signPsbt" => self.sign_psbt(&request.params),
            "multiSignPsbt" => self.multi_sign_psbt(&request.params),
            "signText" | "signData" => self.sign_text(&request.params),
            "multiSignMessage" => self.multi_sign_message(&request.params),
            _ => Err(Error::new(
                ErrorKind::ValidationError,
                format!("Unknown method: {}", request.method),
            )),
        }
    }

    fn request_accounts(&self, origin: &str) -> Result<Value> {
        let account = self.accounts.current_account()?;
        self.permissions.set_connected(origin, &account.address);
        self.permissions.broadcast_event(
            EVENT_ACCOUNTS_CHANGED,
            json!([account.address]),
            Some(origin),
        );
        Ok(json!([account.address]))
    }

    fn get_accounts(&self, origin: &str) -> Result<Value> {
        // safe method: degrades to an empty result without a permission grant
        if !self.permissions.has_permission(origin) {
            return Ok(json!([]));
        }
        let account = self.accounts.current_account()?;
        Ok(json!([account.address]))
    }

    fn get_public_key(&self, origin: &str) -> Result<Value> {
        if !self.permissions.has_permission(origin) {
            return Ok(json!(""));
        }
        let account = self.accounts.current_account()?;
        Ok(json!(account.public_key.to_string()))
    }

    fn get_balance(&self, origin: &str) -> Result<Value> {
        if !self.permissions.has_permission(origin) {
            return Ok(json!(provider_core::service::Balance::default()));
        }
        let account = self.accounts.current_account()?;
        let balance = self.backend.balance(&account.address)?;
        Ok(json!(balance))
    }

    fn push_tx(&self, params: &Value) -> Result<Value> {
        let raw_tx = params
            .get("rawtx")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::new(ErrorKind::ValidationError, "Missing required field: rawtx"))?;
        let txid = self.backend.broadcast_raw(raw_tx)?;
        Ok(json!(txid))
    }

    fn push_psbt(&self, params: &Value) -> Result<Value> {
        let psbt_hex = params
            .get("psbtHex")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(ErrorKind::ValidationError, "Missing required field: psbtHex")
            })?;

        let mut psbt = decode_psbt(psbt_hex)?;

        // finalize whatever carries signatures but no final data yet
        for index in 0..psbt.inputs.len() {
            let input = &psbt.inputs[index];
            if input_is_signed(input) && !input_is_finalized(input) {
                finalizer::finalize_input(&mut psbt, index)?;
            }
        }

        let tx = psbt
            .extract_tx()
            .chain(|| (ErrorKind::ValidationError, "Transaction extraction failed"))?;
        let raw = bitcoin::consensus::encode::serialize_hex(&tx);
        let txid = self.backend.broadcast_raw(&raw)?;
        Ok(json!(txid))
    }

    fn switch_network(&self, params: &Value) -> Result<Value> {
        let name = params
            .get("network")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(ErrorKind::ValidationError, "Missing required field: network")
            })?;
        let network = NetworkType::from_name(name)?;

        self.accounts.set_network_type(network);
        self.permissions
            .broadcast_event(EVENT_NETWORK_CHANGED, json!(network.name()), None);
        Ok(json!(network.name()))
    }

    fn switch_chain(&self, params: &Value) -> Result<Value> {
        let name = params.get("chain").and_then(Value::as_str).ok_or_else(|| {
            Error::new(ErrorKind::ValidationError, "Missing required field: chain")
        })?;
        let chain = ChainType::from_name(name)?;

        self.accounts.set_chain_type(chain);
        self.accounts.set_network_type(chain.network_type());
        self.permissions
            .broadcast_event(EVENT_CHAIN_CHANGED, json!(chain.name()), None);
        Ok(json!(chain.name()))
    }

    fn send_bitcoin(&self, params: &Value) -> Result<Value> {
        let params: SendBitcoinParams = parse_params(params)?;
        let account = self.accounts.current_account()?;

        let psbt = self
            .backend
            .build_payment(&account, &params.to_address, params.satoshis)?;

        let engine = SigningEngine::new(&self.custody, self.accounts.chain_type().network());
        let to_sign = engine.compute_to_sign_inputs(&psbt, &account, None)?;
        let outcome = engine.sign_psbt(psbt, &account, to_sign, true)?;

        let tx = outcome
            .psbt
            .extract_tx()
            .chain(|| (ErrorKind::ValidationError, "Transaction extraction failed"))?;
        let raw = bitcoin::consensus::encode::serialize_hex(&tx);
        let txid = self.backend.broadcast_raw(&raw)?;
        Ok(json!(txid))
    }

    fn sign_psbt(&self, params: &Value) -> Result<Value> {
        let params: SignPsbtParams = parse_params(params)?;
        let account = self.accounts.current_account()?;
        let options = params.options.unwrap_or_default();

        let psbt = decode_psbt(&params.psbt_hex)?;
        let engine = SigningEngine::new(&self.custody, self.accounts.chain_type().network());

        let to_sign =
            engine.compute_to_sign_inputs(&psbt, &account, options.to_sign_inputs.as_deref())?;
        let outcome = engine.sign_psbt(
            psbt,
            &account,
            to_sign,
            options.auto_finalized.unwrap_or(true),
        )?;

        Ok(json!(hex::encode(outcome.psbt.serialize())))
    }

    fn multi_sign_psbt(&self, params: &Value) -> Result<Value> {
        let params: MultiSignPsbtParams = parse_params(params)?;
        let options = params.options.unwrap_or_default();

        let mut signed = Vec::with_capacity(params.psbt_hexs.len());
        for (index, psbt_hex) in params.psbt_hexs.iter().enumerate() {
            let entry_options = options.get(index).cloned().unwrap_or_default();
            let entry = json!({
                "psbtHex": psbt_hex,
                "options": {
                    "autoFinalized": entry_options.auto_finalized,
                    "toSignInputs": entry_options.to_sign_inputs,
                },
            });
            signed.push(self.sign_psbt(&entry)?);
        }

        Ok(Value::Array(signed))
    }

    fn sign_text(&self, params: &Value) -> Result<Value> {
        // signText carries a `text` field, signData a `data` field; both
        // route through the same custody operation
        let payload = params
            .get("text")
            .or_else(|| params.get("data"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(ErrorKind::ValidationError, "Missing required field: text")
            })?;
        let kind = match params.get("type") {
            None | Some(Value::Null) => MessageSignKind::Ecdsa,
            Some(value) => serde_json::from_value(value.clone())
                .chain(|| (ErrorKind::ValidationError, "Unknown message signing type"))?,
        };

        let account = self.accounts.current_account()?;
        let signature = self
            .custody
            .sign_message(&account.public_key, kind, payload)?;
        Ok(json!(signature))
    }

    fn multi_sign_message(&self, params: &Value) -> Result<Value> {
        let params: MultiSignMessageParams = parse_params(params)?;
        let account = self.accounts.current_account()?;

        let mut signatures = Vec::with_capacity(params.messages.len());
        for message in &params.messages {
            let kind = message.kind.unwrap_or(MessageSignKind::Ecdsa);
            signatures.push(self.custody.sign_message(
                &account.public_key,
                kind,
                &message.text,
            )?);
        }

        Ok(json!(signatures))
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T> {
    serde_json::from_value(params.clone())
        .chain(|| (ErrorKind::ValidationError, "Malformed request parameters"))
}

fn decode_psbt(psbt_hex: &str) -> Result<Psbt> {
    let bytes = hex::decode(psbt_hex)
        .chain(|| (ErrorKind::ValidationError, "Transaction is not valid hex"))?;
    Psbt::deserialize(&bytes).chain(|| {
        (
            ErrorKind::DeserializationError,
            "Transaction does not decode as a partially signed transaction",
        )
    })
}
