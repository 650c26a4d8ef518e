//! End-to-end flows through the request pipeline
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, Psbt, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use serde_json::{json, Value};

use provider_common::channel::FrameSink;
use provider_common::{CorrelationChannel, ErrorKind, Frame, RequestPayload, ServiceRequest};
use provider_core::account::Account;
use provider_core::custody::SoftwareCustody;
use provider_core::psbt::input_is_finalized;
use provider_core::service::{
    AccountStore, MemoryAccountStore, MemoryChainBackend, MemoryPermissionStore, PermissionStore,
};
use provider_service::{
    attach_pipeline, ApprovalKind, ApprovalMediator, MemorySurfaceManager, Provider,
    RequestPipeline,
};

const ORIGIN: &str = "https://site.example";

type Pipeline = RequestPipeline<
    MemoryPermissionStore,
    MemoryAccountStore,
    MemoryChainBackend,
    SoftwareCustody,
    MemorySurfaceManager,
>;

struct Harness {
    pipeline: Arc<Pipeline>,
    account: Account,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut custody = SoftwareCustody::new();
    let secret_key = SecretKey::from_slice(&[3; 32]).unwrap();
    let public_key = custody.insert_key(secret_key);
    let address = Address::p2wpkh(&CompressedPublicKey(public_key.inner), Network::Regtest);
    let account = Account::new_local(address.to_string(), public_key);

    let provider = Provider::new(
        MemoryPermissionStore::new(),
        MemoryAccountStore::new(account.clone()),
        MemoryChainBackend::new(),
        custody,
    );
    let mediator = Arc::new(ApprovalMediator::new(MemorySurfaceManager::new()));

    Harness {
        pipeline: Arc::new(RequestPipeline::new(provider, mediator)),
        account,
    }
}

fn request(method: &str, params: Value) -> ServiceRequest {
    ServiceRequest {
        id: 1,
        method: method.to_string(),
        params,
        origin: ORIGIN.to_string(),
        tab_id: 7,
    }
}

fn owned_psbt_hex(account: &Account) -> String {
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(99_500),
            script_pubkey: ScriptBuf::new_op_return([0u8; 8]),
        }],
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: Amount::from_sat(100_000),
        script_pubkey: Address::from_str(&account.address)
            .unwrap()
            .assume_checked()
            .script_pubkey(),
    });

    hex::encode(psbt.serialize())
}

async fn approve(pipeline: &Arc<Pipeline>, value: Value) {
    while pipeline.mediator().pending_kind().is_none() {
        tokio::task::yield_now().await;
    }
    pipeline.mediator().resolve_approval(value, false);
}

#[tokio::test]
async fn safe_method_degrades_without_permission() {
    let harness = harness();

    let accounts = harness
        .pipeline
        .handle(request("getAccounts", Value::Null))
        .await
        .unwrap();
    assert_eq!(json!([]), accounts);

    let version = harness
        .pipeline
        .handle(request("getVersion", Value::Null))
        .await
        .unwrap();
    assert_eq!(json!(env!("CARGO_PKG_VERSION")), version);
}

#[tokio::test]
async fn approval_method_requires_permission() {
    let harness = harness();

    let error = harness
        .pipeline
        .handle(request("signText", json!({ "text": "hi" })))
        .await
        .expect_err("No grant yet");
    assert_eq!(ErrorKind::UnauthorizedError, error.kind());
}

#[tokio::test]
async fn request_accounts_connects_after_approval() {
    let harness = harness();
    let pipeline = harness.pipeline.clone();

    let task = tokio::spawn(async move {
        pipeline
            .handle(request("requestAccounts", Value::Null))
            .await
    });

    approve(&harness.pipeline, Value::Null).await;

    let accounts = task.await.unwrap().unwrap();
    assert_eq!(json!([harness.account.address]), accounts);
    assert!(harness
        .pipeline
        .provider()
        .permissions()
        .has_permission(ORIGIN));

    // connected origins now see the account through the safe path
    let accounts = harness
        .pipeline
        .handle(request("getAccounts", Value::Null))
        .await
        .unwrap();
    assert_eq!(json!([harness.account.address]), accounts);
}

#[tokio::test]
async fn sign_psbt_flow_signs_and_finalizes() {
    let harness = harness();
    harness
        .pipeline
        .provider()
        .permissions()
        .set_connected(ORIGIN, &harness.account.address);

    let psbt_hex = owned_psbt_hex(&harness.account);
    let pipeline = harness.pipeline.clone();
    let task = tokio::spawn(async move {
        pipeline
            .handle(request("signPsbt", json!({ "psbtHex": psbt_hex })))
            .await
    });

    approve(&harness.pipeline, Value::Null).await;

    let signed_hex = task.await.unwrap().unwrap();
    let bytes = hex::decode(signed_hex.as_str().unwrap()).unwrap();
    let signed = Psbt::deserialize(&bytes).unwrap();
    assert!(input_is_finalized(&signed.inputs[0]));
}

#[tokio::test]
async fn rejected_approval_propagates_to_the_caller() {
    let harness = harness();
    harness
        .pipeline
        .provider()
        .permissions()
        .set_connected(ORIGIN, &harness.account.address);

    let pipeline = harness.pipeline.clone();
    let task = tokio::spawn(async move {
        pipeline
            .handle(request("signText", json!({ "text": "hello" })))
            .await
    });

    while harness.pipeline.mediator().pending_kind().is_none() {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        Some(ApprovalKind::SignText),
        harness.pipeline.mediator().pending_kind()
    );
    harness
        .pipeline
        .mediator()
        .reject_approval(None, false, false);

    let error = task.await.unwrap().expect_err("User rejected");
    assert_eq!(ErrorKind::UserRejectedError, error.kind());
}

#[tokio::test]
async fn switch_network_to_current_skips_approval() {
    let harness = harness();
    harness
        .pipeline
        .provider()
        .permissions()
        .set_connected(ORIGIN, &harness.account.address);

    // the store starts on testnet; switching to testnet is an idempotent
    // no-op and must not open a surface
    let result = harness
        .pipeline
        .handle(request("switchNetwork", json!({ "network": "testnet" })))
        .await
        .unwrap();
    assert_eq!(json!("testnet"), result);
    assert!(harness.pipeline.mediator().pending_kind().is_none());

    // switching to mainnet requires the approval
    let pipeline = harness.pipeline.clone();
    let task = tokio::spawn(async move {
        pipeline
            .handle(request("switchNetwork", json!({ "network": "livenet" })))
            .await
    });

    approve(&harness.pipeline, Value::Null).await;

    let result = task.await.unwrap().unwrap();
    assert_eq!(json!("mainnet"), result);
    assert_eq!(
        provider_core::account::NetworkType::Mainnet,
        harness.pipeline.provider().accounts().network_type()
    );
}

#[tokio::test]
async fn unknown_method_is_a_validation_error() {
    let harness = harness();

    let error = harness
        .pipeline
        .handle(request("mintCoins", Value::Null))
        .await
        .expect_err("Unknown method");
    assert_eq!(ErrorKind::ValidationError, error.kind());
}

#[derive(Clone, Default)]
struct RecordingSink {
    frames: std::sync::Arc<std::sync::Mutex<Vec<Frame>>>,
}

impl FrameSink for RecordingSink {
    fn transmit(&self, frame: Frame) -> provider_common::Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

#[tokio::test]
async fn channel_requests_flow_through_the_pipeline() {
    let harness = harness();
    harness
        .pipeline
        .provider()
        .permissions()
        .set_connected(ORIGIN, &harness.account.address);

    let sink = RecordingSink::default();
    let channel = CorrelationChannel::new(sink.clone());
    attach_pipeline(&channel, harness.pipeline.clone(), ORIGIN, 7);

    channel
        .handle_frame(Frame::Request {
            id: 9,
            data: RequestPayload {
                method: "getAccounts".to_string(),
                params: Value::Null,
            },
        })
        .await;

    channel
        .handle_frame(Frame::Request {
            id: 10,
            data: RequestPayload {
                method: "mintCoins".to_string(),
                params: Value::Null,
            },
        })
        .await;

    let frames = sink.frames.lock().unwrap().clone();
    assert_eq!(2, frames.len());

    match &frames[0] {
        Frame::Response { id, res, err } => {
            assert_eq!(9, *id);
            assert_eq!(Some(json!([harness.account.address])), *res);
            assert!(err.is_none());
        }
        other => panic!("Expected response frame, got {:?}", other),
    }

    match &frames[1] {
        Frame::Response { id, res, err } => {
            assert_eq!(10, *id);
            assert!(res.is_none());
            let err = err.as_ref().expect("Error frame");
            assert_eq!(Some(ErrorKind::ValidationError.wire_code()), err.code);
        }
        other => panic!("Expected response frame, got {:?}", other),
    }
}

#[tokio::test]
async fn push_tx_broadcasts_through_the_backend() {
    let harness = harness();

    // a minimal valid transaction: the finalized form of an owned input
    let psbt_hex = owned_psbt_hex(&harness.account);
    harness
        .pipeline
        .provider()
        .permissions()
        .set_connected(ORIGIN, &harness.account.address);

    let pipeline = harness.pipeline.clone();
    let task = tokio::spawn(async move {
        pipeline
            .handle(request("signPsbt", json!({ "psbtHex": psbt_hex })))
            .await
    });
    approve(&harness.pipeline, Value::Null).await;
    let signed_hex = task.await.unwrap().unwrap();

    let txid = harness
        .pipeline
        .handle(request(
            "pushPsbt",
            json!({ "psbtHex": signed_hex.as_str().unwrap() }),
        ))
        .await
        .unwrap();

    assert!(txid.as_str().is_some());
    assert_eq!(1, harness.pipeline.provider().backend().broadcasts().len());
}
