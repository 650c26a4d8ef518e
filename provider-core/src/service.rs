//! Collaborator store interfaces
//!
//! Keyring/preference persistence, site permissions and network fetch are
//! out of scope for this workspace; these traits are their seams. The
//! in-memory implementations back the tests.
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use provider_common::{ErrorKind, Result, ResultExt, Session};

use crate::account::{Account, ChainType, NetworkType};

/// Event fired when the set of exposed accounts changes
pub const EVENT_ACCOUNTS_CHANGED: &str = "accountsChanged";
/// Event fired when the active network changes
pub const EVENT_NETWORK_CHANGED: &str = "networkChanged";
/// Event fired when the active chain changes
pub const EVENT_CHAIN_CHANGED: &str = "chainChanged";

/// Confirmed and pending balance of an address, in satoshis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    /// Satoshis in confirmed outputs
    pub confirmed: u64,
    /// Satoshis in unconfirmed outputs
    pub unconfirmed: u64,
    /// Sum of confirmed and unconfirmed satoshis
    pub total: u64,
}

/// Site permission and push-event delivery store
pub trait PermissionStore: Send + Sync {
    /// Whether given origin holds a permission grant
    fn has_permission(&self, origin: &str) -> bool;

    /// Session of given origin, if connected
    fn get_connected_site(&self, origin: &str) -> Option<Session>;

    /// Grants permission to given origin for given address
    fn set_connected(&self, origin: &str, address: &str);

    /// Delivers a push event, either to one origin or to every connected one
    fn broadcast_event(&self, event: &str, payload: Value, origin: Option<&str>);
}

/// Active account and preference store
pub trait AccountStore: Send + Sync {
    /// Currently selected account
    fn current_account(&self) -> Result<Account>;

    /// Currently selected network type
    fn network_type(&self) -> NetworkType;

    /// Currently selected chain type
    fn chain_type(&self) -> ChainType;

    /// Selects a network type
    fn set_network_type(&self, network: NetworkType);

    /// Selects a chain type
    fn set_chain_type(&self, chain: ChainType);
}

/// Chain query and broadcast backend
pub trait ChainBackend: Send + Sync {
    /// Balance of given address
    fn balance(&self, address: &str) -> Result<Balance>;

    /// Broadcasts a raw transaction, returning its txid
    fn broadcast_raw(&self, raw_tx: &str) -> Result<String>;

    /// Builds an unsigned payment transaction funded by the account
    fn build_payment(&self, from: &Account, to_address: &str, amount: u64) -> Result<Psbt>;
}

/// In-memory permission store
#[derive(Default)]
pub struct MemoryPermissionStore {
    sites: Mutex<HashMap<String, Session>>,
    events: Mutex<Vec<(String, Value, Option<String>)>>,
}

impl MemoryPermissionStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Default::default()
    }

    /// Events broadcast so far, in delivery order
    pub fn events(&self) -> Vec<(String, Value, Option<String>)> {
        self.events
            .lock()
            .expect("Unable to acquire lock on event log")
            .clone()
    }
}

impl PermissionStore for MemoryPermissionStore {
    fn has_permission(&self, origin: &str) -> bool {
        self.sites
            .lock()
            .expect("Unable to acquire lock on sites")
            .get(origin)
            .map(|session| session.is_connected)
            .unwrap_or(false)
    }

    fn get_connected_site(&self, origin: &str) -> Option<Session> {
        self.sites
            .lock()
            .expect("Unable to acquire lock on sites")
            .get(origin)
            .cloned()
    }

    fn set_connected(&self, origin: &str, address: &str) {
        self.sites
            .lock()
            .expect("Unable to acquire lock on sites")
            .insert(origin.to_string(), Session::connected(origin, address));
    }

    fn broadcast_event(&self, event: &str, payload: Value, origin: Option<&str>) {
        self.events
            .lock()
            .expect("Unable to acquire lock on event log")
            .push((event.to_string(), payload, origin.map(str::to_string)));
    }
}

/// In-memory account and preference store
pub struct MemoryAccountStore {
    account: Mutex<Account>,
    network: Mutex<NetworkType>,
    chain: Mutex<ChainType>,
}

impl MemoryAccountStore {
    /// Creates a store with given active account on regtest
    pub fn new(account: Account) -> Self {
        Self {
            account: Mutex::new(account),
            network: Mutex::new(NetworkType::Testnet),
            chain: Mutex::new(ChainType::BitcoinRegtest),
        }
    }

    /// Replaces the active account
    pub fn set_current_account(&self, account: Account) {
        *self
            .account
            .lock()
            .expect("Unable to acquire lock on account") = account;
    }
}

impl AccountStore for MemoryAccountStore {
    fn current_account(&self) -> Result<Account> {
        Ok(self
            .account
            .lock()
            .expect("Unable to acquire lock on account")
            .clone())
    }

    fn network_type(&self) -> NetworkType {
        *self
            .network
            .lock()
            .expect("Unable to acquire lock on network")
    }

    fn chain_type(&self) -> ChainType {
        *self.chain.lock().expect("Unable to acquire lock on chain")
    }

    fn set_network_type(&self, network: NetworkType) {
        *self
            .network
            .lock()
            .expect("Unable to acquire lock on network") = network;
    }

    fn set_chain_type(&self, chain: ChainType) {
        *self.chain.lock().expect("Unable to acquire lock on chain") = chain;
    }
}

/// In-memory chain backend
///
/// Balances are seeded by tests; broadcasts are recorded instead of sent.
#[derive(Default)]
pub struct MemoryChainBackend {
    balances: Mutex<HashMap<String, Balance>>,
    broadcasts: Mutex<Vec<String>>,
}

impl MemoryChainBackend {
    /// Creates an empty backend
    pub fn new() -> Self {
        Default::default()
    }

    /// Seeds the balance of an address
    pub fn seed_balance(&self, address: &str, balance: Balance) {
        self.balances
            .lock()
            .expect("Unable to acquire lock on balances")
            .insert(address.to_string(), balance);
    }

    /// Raw transactions broadcast so far
    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts
            .lock()
            .expect("Unable to acquire lock on broadcasts")
            .clone()
    }
}

impl ChainBackend for MemoryChainBackend {
    fn balance(&self, address: &str) -> Result<Balance> {
        Ok(self
            .balances
            .lock()
            .expect("Unable to acquire lock on balances")
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    fn broadcast_raw(&self, raw_tx: &str) -> Result<String> {
        let bytes = hex::decode(raw_tx)
            .chain(|| (ErrorKind::ValidationError, "Raw transaction is not valid hex"))?;
        let tx: Transaction = bitcoin::consensus::encode::deserialize(&bytes).chain(|| {
            (
                ErrorKind::ValidationError,
                "Raw transaction does not decode",
            )
        })?;

        let txid = tx.compute_txid().to_string();
        self.broadcasts
            .lock()
            .expect("Unable to acquire lock on broadcasts")
            .push(raw_tx.to_string());
        Ok(txid)
    }

    fn build_payment(&self, from: &Account, to_address: &str, amount: u64) -> Result<Psbt> {
        let funding = Amount::from_sat(amount + 1_000);
        let from_script = Address::from_str(&from.address)
            .chain(|| (ErrorKind::ValidationError, "Account address does not parse"))?
            .assume_checked()
            .script_pubkey();
        let to_script = Address::from_str(to_address)
            .chain(|| (ErrorKind::ValidationError, "Destination address does not parse"))?
            .assume_checked()
            .script_pubkey();

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
                value: Amount::from_sat(amount),
                script_pubkey: to_script,
            }],
        };

        let mut psbt =
            Psbt::from_unsigned_tx(tx).chain(|| (ErrorKind::InternalError, "Unsigned payment"))?;
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: funding,
            script_pubkey: from_script,
        });

        Ok(psbt)
    }
}
