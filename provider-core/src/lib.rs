#![deny(unsafe_code, unstable_features)]
//! # Wallet Provider Core
//!
//! Domain model of the wallet provider:
//! - Account and network model
//! - Key custody interfaces and the local software keyring
//! - Collaborator store interfaces (permissions, preferences, chain backend)
//! - PSBT signing engine with input selection, taproot disambiguation and
//!   finalization
pub mod account;
pub mod custody;
pub mod psbt;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

#[doc(inline)]
pub use account::{Account, ChainType, KeyringKind, NetworkType};
#[doc(inline)]
pub use custody::{CustodyRoute, KeyCustody, MessageSignKind, SoftwareCustody};
#[doc(inline)]
pub use psbt::{SignOutcome, SigningEngine, TapClassification, ToSignInput, UserToSignInput};
#[doc(inline)]
pub use service::{AccountStore, Balance, ChainBackend, PermissionStore};
