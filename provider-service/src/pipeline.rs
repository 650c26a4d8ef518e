//! Request pipeline
//!
//! Composes the method classifier, the approval mediator and the operation
//! implementations into one linear, ordered flow per request: classify →
//! permission gate → precheck → approval → operation → value or error.
use std::sync::Arc;

use serde_json::Value;

use provider_common::channel::{CorrelationChannel, FrameSink};
use provider_common::{Error, ErrorKind, Result, ServiceRequest};
use provider_core::custody::KeyCustody;
use provider_core::service::{AccountStore, ChainBackend, PermissionStore};

use crate::approval::{ApprovalKind, ApprovalMediator, ApprovalRequest, SurfaceManager, SurfaceOptions};
use crate::methods::{classify, Classification, PrecheckOutcome};
use crate::provider::Provider;

/// Linear per-request pipeline
pub struct RequestPipeline<P, A, C, K, W: SurfaceManager> {
    provider: Provider<P, A, C, K>,
    mediator: Arc<ApprovalMediator<W>>,
}

impl<P, A, C, K, W> RequestPipeline<P, A, C, K, W>
where
    P: PermissionStore,
    A: AccountStore,
    C: ChainBackend,
    K: KeyCustody,
    W: SurfaceManager,
{
    /// Creates a pipeline over given provider and mediator
    pub fn new(provider: Provider<P, A, C, K>, mediator: Arc<ApprovalMediator<W>>) -> Self {
        Self { provider, mediator }
    }

    /// Provider behind this pipeline
    pub fn provider(&self) -> &Provider<P, A, C, K> {
        &self.provider
    }

    /// Approval mediator behind this pipeline
    pub fn mediator(&self) -> &Arc<ApprovalMediator<W>> {
        &self.mediator
    }

    /// Runs one request to completion
    pub async fn handle(&self, mut request: ServiceRequest) -> Result<Value> {
        let classification = classify(&request.method).ok_or_else(|| {
            Error::new(
                ErrorKind::ValidationError,
                format!("Unknown method: {}", request.method),
            )
        })?;

        let (kind, precheck) = match classification {
            Classification::Safe => return self.provider.execute(&request),
            Classification::ApprovalRequired { kind, precheck } => (kind, precheck),
        };

        // connecting is the grant flow itself; everything else gated on an
        // approval requires an existing grant
        if kind != ApprovalKind::Connect && !self.provider.permissions().has_permission(&request.origin)
        {
            return Err(Error::new(
                ErrorKind::UnauthorizedError,
                "Origin has no permission grant",
            ));
        }

        let env = self.provider.precheck_env()?;
        let outcome = precheck(&env, &mut request.params)?;

        if outcome == PrecheckOutcome::Proceed {
            let receiver = self
                .mediator
                .request_approval(
                    ApprovalRequest {
                        kind,
                        origin: request.origin.clone(),
                        params: request.params.clone(),
                    },
                    &SurfaceOptions::for_kind(kind),
                )
                .map_err(|err| {
                    Error::new_with_source(
                        ErrorKind::InternalError,
                        "Unable to open the approval surface",
                        Box::new(err),
                    )
                })?;

            // the user decision; a dismissed surface resolves as rejection
            receiver
                .await
                .map_err(|_| Error::new(ErrorKind::UserRejectedError, "Approval was dismissed"))??;
        }

        self.provider.execute(&request)
    }
}

/// Answers a channel's inbound request frames with given pipeline
///
/// One channel carries requests of one external caller, so its origin and
/// hosting tab are fixed at binding time.
pub fn attach_pipeline<S, P, A, C, K, W>(
    channel: &CorrelationChannel<S>,
    pipeline: Arc<RequestPipeline<P, A, C, K, W>>,
    origin: &str,
    tab_id: i64,
) where
    S: FrameSink,
    P: PermissionStore + 'static,
    A: AccountStore + 'static,
    C: ChainBackend + 'static,
    K: KeyCustody + 'static,
    W: SurfaceManager + 'static,
{
    let origin = origin.to_string();
    channel.set_request_listener(Box::new(move |id, payload| {
        let pipeline = pipeline.clone();
        let origin = origin.clone();
        Box::pin(async move {
            pipeline
                .handle(ServiceRequest {
                    id,
                    method: payload.method,
                    params: payload.params,
                    origin,
                    tab_id,
                })
                .await
        })
    }));
}
