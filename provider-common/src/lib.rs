#![deny(unsafe_code, unstable_features)]
//! # Wallet Provider Common
//!
//! Shared plumbing for the wallet provider workspace:
//! - Error taxonomy used across all crates
//! - Wire protocol frames exchanged with external callers
//! - Correlation channel matching asynchronous responses back to callers
//! - Readiness gate deferring work while the hosting page is not visible
pub mod channel;
pub mod error;
pub mod gate;
pub mod session;
pub mod wire;

#[doc(inline)]
pub use channel::{CorrelationChannel, FrameSink, REQUEST_POOL_SIZE};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, ResultExt};
#[doc(inline)]
pub use gate::ReadyGate;
#[doc(inline)]
pub use session::Session;
#[doc(inline)]
pub use wire::{ErrorFrame, Frame, PushPayload, RequestPayload, ServiceRequest};
