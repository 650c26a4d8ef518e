//! Account and network model
use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::{Network, PublicKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};

use provider_common::{Error, ErrorKind, Result};

/// Where the key material of an account lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyringKind {
    /// Key material is available to the local custody component
    Local,
    /// Key material lives on an external signer; signatures are produced
    /// through a remote exchange
    Hardware,
}

/// Network the provider currently operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Main network
    Mainnet,
    /// Test network
    Testnet,
}

impl NetworkType {
    /// Parses a network type from its wire name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mainnet" | "livenet" => Ok(NetworkType::Mainnet),
            "testnet" => Ok(NetworkType::Testnet),
            _ => Err(Error::new(
                ErrorKind::ValidationError,
                format!("Unknown network type: {}", name),
            )),
        }
    }

    /// Wire name of this network type
    pub fn name(self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
        }
    }
}

/// Chain the provider currently operates on; a network type may carry
/// several chains (e.g. testnet vs signet)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    /// Bitcoin mainnet
    Bitcoin,
    /// Bitcoin testnet
    BitcoinTestnet,
    /// Bitcoin signet
    BitcoinSignet,
    /// Local regression test network
    BitcoinRegtest,
}

impl ChainType {
    /// Parses a chain type from its wire name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "bitcoin" => Ok(ChainType::Bitcoin),
            "bitcoin_testnet" => Ok(ChainType::BitcoinTestnet),
            "bitcoin_signet" => Ok(ChainType::BitcoinSignet),
            "bitcoin_regtest" => Ok(ChainType::BitcoinRegtest),
            _ => Err(Error::new(
                ErrorKind::ValidationError,
                format!("Unknown chain type: {}", name),
            )),
        }
    }

    /// Wire name of this chain type
    pub fn name(self) -> &'static str {
        match self {
            ChainType::Bitcoin => "bitcoin",
            ChainType::BitcoinTestnet => "bitcoin_testnet",
            ChainType::BitcoinSignet => "bitcoin_signet",
            ChainType::BitcoinRegtest => "bitcoin_regtest",
        }
    }

    /// Network type this chain belongs to
    pub fn network_type(self) -> NetworkType {
        match self {
            ChainType::Bitcoin => NetworkType::Mainnet,
            _ => NetworkType::Testnet,
        }
    }

    /// Consensus network of this chain
    pub fn network(self) -> Network {
        match self {
            ChainType::Bitcoin => Network::Bitcoin,
            ChainType::BitcoinTestnet => Network::Testnet,
            ChainType::BitcoinSignet => Network::Signet,
            ChainType::BitcoinRegtest => Network::Regtest,
        }
    }
}

/// Handle to an account held by the key custody component
///
/// The provider never holds raw key material; an account carries only the
/// public identity needed for ownership attribution and, for hardware
/// accounts, the key origin metadata needed by the remote exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Receive address of the account
    pub address: String,
    /// Public key of the account
    pub public_key: PublicKey,
    /// Where the key material lives
    pub kind: KeyringKind,
    /// Master fingerprint and derivation path, present on hardware accounts
    pub key_source: Option<(Fingerprint, DerivationPath)>,
}

impl Account {
    /// Creates a locally held account
    pub fn new_local(address: String, public_key: PublicKey) -> Self {
        Self {
            address,
            public_key,
            kind: KeyringKind::Local,
            key_source: None,
        }
    }

    /// Creates a hardware account with its key origin metadata
    pub fn new_hardware(
        address: String,
        public_key: PublicKey,
        fingerprint: Fingerprint,
        path: DerivationPath,
    ) -> Self {
        Self {
            address,
            public_key,
            kind: KeyringKind::Hardware,
            key_source: Some((fingerprint, path)),
        }
    }

    /// X-only form of the account public key, used as the taproot internal key
    pub fn x_only(&self) -> XOnlyPublicKey {
        self.public_key.inner.x_only_public_key().0
    }
}
