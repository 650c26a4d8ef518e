#![deny(unsafe_code, unstable_features)]
//! # Wallet Provider Service
//!
//! The sign pipeline: request classification, single-flight user approval
//! and the operation implementations behind the method surface.
pub mod approval;
pub mod methods;
pub mod pipeline;
pub mod provider;

#[doc(inline)]
pub use approval::{
    ApprovalKind, ApprovalMediator, ApprovalRequest, MemorySurfaceManager, SurfaceId,
    SurfaceManager, SurfaceOptions,
};
#[doc(inline)]
pub use methods::{classify, Classification, Precheck, PrecheckEnv, PrecheckOutcome};
#[doc(inline)]
pub use pipeline::{attach_pipeline, RequestPipeline};
#[doc(inline)]
pub use provider::{Provider, SignPsbtOptions};
