//! Method classification
//!
//! Static table mapping each externally callable method to either "safe"
//! (no gating) or "approval required" with a precheck. Prechecks run before
//! any surface is opened; they may normalize parameters in place, fail the
//! request with a method-specific validation error, or short-circuit the
//! approval for idempotent no-ops.
use serde_json::Value;

use provider_common::{Error, ErrorKind, Result};
use provider_core::account::{ChainType, NetworkType};

use crate::approval::ApprovalKind;

/// How a method executes
#[derive(Debug, Clone, Copy)]
pub enum Classification {
    /// Executes immediately, no approval surface
    Safe,
    /// Blocks on a serialized user approval
    ApprovalRequired {
        /// Decision being asked for
        kind: ApprovalKind,
        /// Validation run before any surface is opened
        precheck: Precheck,
    },
}

/// Outcome of a precheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecheckOutcome {
    /// Continue into the approval flow
    Proceed,
    /// The request is an idempotent no-op from the approval's point of view;
    /// execute the operation without showing a surface
    SkipApproval,
}

/// Snapshot of provider state available to prechecks
#[derive(Debug, Clone)]
pub struct PrecheckEnv {
    /// Currently selected network type
    pub network_type: NetworkType,
    /// Currently selected chain type
    pub chain_type: ChainType,
    /// Address of the active account
    pub current_address: String,
}

/// Synchronous validation hook run before any surface is opened
pub type Precheck = fn(&PrecheckEnv, &mut Value) -> Result<PrecheckOutcome>;

/// Classifies a method name; unknown methods return `None`
pub fn classify(method: &str) -> Option<Classification> {
    let approval = |kind, precheck| Classification::ApprovalRequired { kind, precheck };

    Some(match method {
        "getAccounts" | "getNetwork" | "getChain" | "getPublicKey" | "getBalance"
        | "getVersion" | "pushTx" | "pushPsbt" => Classification::Safe,
        "requestAccounts" => approval(ApprovalKind::Connect, precheck_none),
        "switchNetwork" => approval(ApprovalKind::SwitchNetwork, precheck_switch_network),
        "switchChain" => approval(ApprovalKind::SwitchChain, precheck_switch_chain),
        "sendBitcoin" => approval(ApprovalKind::SendBitcoin, precheck_send_bitcoin),
        "signPsbt" => approval(ApprovalKind::SignPsbt, precheck_sign_psbt),
        "multiSignPsbt" => approval(ApprovalKind::MultiSignPsbt, precheck_multi_sign_psbt),
        "signText" => approval(ApprovalKind::SignText, precheck_sign_message),
        "signData" => approval(ApprovalKind::SignData, precheck_sign_data),
        "multiSignMessage" => approval(ApprovalKind::MultiSignMessage, precheck_multi_sign_message),
        _ => return None,
    })
}

fn precheck_none(_env: &PrecheckEnv, _params: &mut Value) -> Result<PrecheckOutcome> {
    Ok(PrecheckOutcome::Proceed)
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                format!("Missing required field: {}", field),
            )
        })
}

fn precheck_switch_network(env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    let requested = NetworkType::from_name(required_str(params, "network")?)?;

    // canonicalize aliases ("livenet") to the wire name
    params["network"] = Value::String(requested.name().to_string());

    if requested == env.network_type {
        Ok(PrecheckOutcome::SkipApproval)
    } else {
        Ok(PrecheckOutcome::Proceed)
    }
}

fn precheck_switch_chain(env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    let requested = ChainType::from_name(required_str(params, "chain")?)?;

    if requested == env.chain_type {
        Ok(PrecheckOutcome::SkipApproval)
    } else {
        Ok(PrecheckOutcome::Proceed)
    }
}

fn precheck_send_bitcoin(_env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    required_str(params, "toAddress")?;

    let satoshis = params.get("satoshis").and_then(Value::as_u64).ok_or_else(|| {
        Error::new(
            ErrorKind::ValidationError,
            "Missing required field: satoshis",
        )
    })?;
    if satoshis == 0 {
        return Err(Error::new(
            ErrorKind::ValidationError,
            "Amount must be greater than zero",
        ));
    }

    Ok(PrecheckOutcome::Proceed)
}

/// Canonicalizes a transaction hex field in place (strips `0x`, lowercases)
/// and requires it to decode
fn normalize_tx_hex(params: &mut Value, field: &str) -> Result<()> {
    let raw = required_str(params, field)?;
    let normalized = raw.trim_start_matches("0x").to_ascii_lowercase();

    if normalized.is_empty() || hex::decode(&normalized).is_err() {
        return Err(Error::new(
            ErrorKind::ValidationError,
            format!("Field {} is not valid hex", field),
        ));
    }

    params[field] = Value::String(normalized);
    Ok(())
}

fn precheck_sign_psbt(_env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    normalize_tx_hex(params, "psbtHex")?;
    Ok(PrecheckOutcome::Proceed)
}

fn precheck_multi_sign_psbt(_env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    let count = params
        .get("psbtHexs")
        .and_then(Value::as_array)
        .map(Vec::len)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                "Missing required field: psbtHexs",
            )
        })?;
    if count == 0 {
        return Err(Error::new(
            ErrorKind::ValidationError,
            "psbtHexs must not be empty",
        ));
    }

    for index in 0..count {
        let entry = &mut params["psbtHexs"][index];
        let raw = entry.as_str().ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                format!("psbtHexs[{}] is not a string", index),
            )
        })?;
        let normalized = raw.trim_start_matches("0x").to_ascii_lowercase();
        if normalized.is_empty() || hex::decode(&normalized).is_err() {
            return Err(Error::new(
                ErrorKind::ValidationError,
                format!("psbtHexs[{}] is not valid hex", index),
            ));
        }
        *entry = Value::String(normalized);
    }

    Ok(PrecheckOutcome::Proceed)
}

fn precheck_sign_message(_env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    required_str(params, "text")?;
    Ok(PrecheckOutcome::Proceed)
}

fn precheck_sign_data(_env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    normalize_tx_hex(params, "data")?;
    Ok(PrecheckOutcome::Proceed)
}

fn precheck_multi_sign_message(_env: &PrecheckEnv, params: &mut Value) -> Result<PrecheckOutcome> {
    let messages = params
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                "Missing required field: messages",
            )
        })?;

    if messages.is_empty() {
        return Err(Error::new(
            ErrorKind::ValidationError,
            "messages must not be empty",
        ));
    }

    for (index, message) in messages.iter().enumerate() {
        if message.get("text").and_then(Value::as_str).is_none() {
            return Err(Error::new(
                ErrorKind::ValidationError,
                format!("messages[{}] is missing its text", index),
            ));
        }
    }

    Ok(PrecheckOutcome::Proceed)
}
