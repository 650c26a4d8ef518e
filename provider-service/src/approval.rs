//! Approval mediation
//!
//! Owns the "at most one outstanding approval" invariant: a single slot
//! holds the pending approval, a user-facing surface is opened for it, and
//! resolve/reject entry points complete the caller's deferred result. The
//! surface lifecycle (removal, focus loss) feeds back into the mediator so
//! the deferred result is never left unresolved.
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use provider_common::{Error, ErrorKind, Result};

/// Kinds of user decisions a method may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalKind {
    /// Grant the origin access to accounts
    Connect,
    /// Switch the active network
    SwitchNetwork,
    /// Switch the active chain
    SwitchChain,
    /// Build and sign a payment
    SendBitcoin,
    /// Sign one transaction
    SignPsbt,
    /// Sign several transactions
    MultiSignPsbt,
    /// Sign a text message
    SignText,
    /// Sign arbitrary data
    SignData,
    /// Sign several text messages
    MultiSignMessage,
}

/// Options for opening an approval surface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceOptions {
    /// Screen to present
    pub route: String,
    /// Requested surface width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Requested surface height
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl SurfaceOptions {
    /// Default surface for given approval kind
    pub fn for_kind(kind: ApprovalKind) -> Self {
        let route = match kind {
            ApprovalKind::Connect => "/connect",
            ApprovalKind::SwitchNetwork => "/switch-network",
            ApprovalKind::SwitchChain => "/switch-chain",
            ApprovalKind::SendBitcoin => "/send",
            ApprovalKind::SignPsbt | ApprovalKind::MultiSignPsbt => "/sign-psbt",
            ApprovalKind::SignText | ApprovalKind::SignData | ApprovalKind::MultiSignMessage => {
                "/sign-message"
            }
        };
        Self {
            route: route.to_string(),
            width: None,
            height: None,
        }
    }
}

/// Identifier of an open approval surface
pub type SurfaceId = u32;

/// Window/surface manager collaborator
pub trait SurfaceManager: Send + Sync {
    /// Opens a user-facing surface and returns its identifier
    fn open_surface(&self, options: &SurfaceOptions) -> Result<SurfaceId>;

    /// Closes a previously opened surface; closing an unknown surface is a
    /// no-op
    fn close_surface(&self, id: SurfaceId);
}

/// Approval request data presented to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Decision being asked for
    pub kind: ApprovalKind,
    /// Origin that triggered the request
    pub origin: String,
    /// Validated request parameters
    pub params: Value,
}

type Decision = oneshot::Sender<Result<Value>>;

struct PendingApproval {
    request: ApprovalRequest,
    sender: Decision,
    surface: SurfaceId,
}

#[derive(Default)]
struct MediatorState {
    pending: Option<PendingApproval>,
    // displaced deferred results; intentionally kept unresolved (newest
    // request wins, see DESIGN.md)
    orphaned: Vec<Decision>,
}

/// Serializes user approvals: at most one is outstanding at any time
pub struct ApprovalMediator<W: SurfaceManager> {
    surfaces: W,
    state: Mutex<MediatorState>,
    reject_on_blur: bool,
}

impl<W: SurfaceManager> ApprovalMediator<W> {
    /// Creates a mediator over given surface manager
    pub fn new(surfaces: W) -> Self {
        Self {
            surfaces,
            state: Mutex::new(MediatorState::default()),
            reject_on_blur: false,
        }
    }

    /// Treats focus loss of the approval surface as an implicit rejection
    ///
    /// Off by default: on some platforms transient focus changes arrive while
    /// the surface is still in front of the user.
    pub fn with_reject_on_blur(mut self, reject_on_blur: bool) -> Self {
        self.reject_on_blur = reject_on_blur;
        self
    }

    /// Opens a surface for the request and returns the caller's deferred
    /// decision
    ///
    /// A pending approval is unconditionally replaced: its surface is closed
    /// and its deferred result is orphaned, never resolved by the new
    /// request's outcome.
    pub fn request_approval(
        &self,
        request: ApprovalRequest,
        options: &SurfaceOptions,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let displaced = {
            let mut state = self
                .state
                .lock()
                .expect("Unable to acquire lock on approval state");
            state.pending.take()
        };

        if let Some(previous) = displaced {
            log::warn!(
                "Replacing pending {:?} approval from {}",
                previous.request.kind,
                previous.request.origin
            );
            self.surfaces.close_surface(previous.surface);
            self.state
                .lock()
                .expect("Unable to acquire lock on approval state")
                .orphaned
                .push(previous.sender);
        }

        let surface = self.surfaces.open_surface(options)?;
        let (sender, receiver) = oneshot::channel();

        self.state
            .lock()
            .expect("Unable to acquire lock on approval state")
            .pending = Some(PendingApproval {
            request,
            sender,
            surface,
        });

        Ok(receiver)
    }

    /// Completes the pending approval with a success value
    ///
    /// With `force_reject` the resolution is redirected to the standard
    /// user-cancel error; the UI cancels uniformly through this path.
    pub fn resolve_approval(&self, value: Value, force_reject: bool) {
        let pending = self.take_pending();

        if let Some(pending) = pending {
            let outcome = if force_reject {
                Err(Error::new(ErrorKind::UserRejectedError, "User Cancel"))
            } else {
                Ok(value)
            };

            if pending.sender.send(outcome).is_err() {
                log::warn!("Approval caller went away before its resolution");
            }
            self.surfaces.close_surface(pending.surface);
        }
    }

    /// Completes the pending approval with a rejection
    ///
    /// `is_internal` marks unexpected failures raised while preparing the
    /// approval; anything else is a user rejection (explicit decision or
    /// surface loss).
    pub fn reject_approval(
        &self,
        reason: Option<String>,
        keep_surface_open: bool,
        is_internal: bool,
    ) {
        let pending = self.take_pending();

        if let Some(pending) = pending {
            let error = if is_internal {
                Error::new(
                    ErrorKind::InternalError,
                    reason.unwrap_or_else(|| "Unexpected approval failure".to_string()),
                )
            } else {
                Error::new(
                    ErrorKind::UserRejectedError,
                    reason.unwrap_or_else(|| "User rejected the request.".to_string()),
                )
            };

            if pending.sender.send(Err(error)).is_err() {
                log::warn!("Approval caller went away before its rejection");
            }

            if !keep_surface_open {
                self.surfaces.close_surface(pending.surface);
            }
        }
    }

    /// Drops the pending approval without resolving it; safe to call with
    /// none pending
    pub fn clear(&self, keep_surface_open: bool) {
        if let Some(pending) = self.take_pending() {
            self.state
                .lock()
                .expect("Unable to acquire lock on approval state")
                .orphaned
                .push(pending.sender);
            if !keep_surface_open {
                self.surfaces.close_surface(pending.surface);
            }
        }
    }

    /// Surface lifecycle: a surface was closed by any means
    ///
    /// Rejects the pending approval exactly once, and only when the removed
    /// surface is the one belonging to it; the close of a replaced surface
    /// cannot kill its successor.
    pub fn on_surface_removed(&self, id: SurfaceId) {
        if self.pending_surface() == Some(id) {
            self.reject_approval(None, true, false);
        }
    }

    /// Surface lifecycle: focus changed
    pub fn on_surface_focus_changed(&self, id: SurfaceId, focused: bool) {
        if self.reject_on_blur && !focused && self.pending_surface() == Some(id) {
            self.reject_approval(None, false, false);
        }
    }

    /// Kind of the pending approval, if any
    pub fn pending_kind(&self) -> Option<ApprovalKind> {
        self.state
            .lock()
            .expect("Unable to acquire lock on approval state")
            .pending
            .as_ref()
            .map(|pending| pending.request.kind)
    }

    fn pending_surface(&self) -> Option<SurfaceId> {
        self.state
            .lock()
            .expect("Unable to acquire lock on approval state")
            .pending
            .as_ref()
            .map(|pending| pending.surface)
    }

    fn take_pending(&self) -> Option<PendingApproval> {
        self.state
            .lock()
            .expect("Unable to acquire lock on approval state")
            .pending
            .take()
    }
}

/// In-memory surface manager recording open/close calls
#[derive(Default)]
pub struct MemorySurfaceManager {
    state: Mutex<SurfaceLog>,
}

#[derive(Default)]
struct SurfaceLog {
    next_id: SurfaceId,
    open: Vec<SurfaceId>,
    closed: Vec<SurfaceId>,
}

impl MemorySurfaceManager {
    /// Creates an empty surface manager
    pub fn new() -> Self {
        Default::default()
    }

    /// Surfaces currently open
    pub fn open_surfaces(&self) -> Vec<SurfaceId> {
        self.state
            .lock()
            .expect("Unable to acquire lock on surface log")
            .open
            .clone()
    }

    /// Surfaces closed so far
    pub fn closed_surfaces(&self) -> Vec<SurfaceId> {
        self.state
            .lock()
            .expect("Unable to acquire lock on surface log")
            .closed
            .clone()
    }
}

impl SurfaceManager for MemorySurfaceManager {
    fn open_surface(&self, _options: &SurfaceOptions) -> Result<SurfaceId> {
        let mut state = self
            .state
            .lock()
            .expect("Unable to acquire lock on surface log");
        let id = state.next_id;
        state.next_id += 1;
        state.open.push(id);
        Ok(id)
    }

    fn close_surface(&self, id: SurfaceId) {
        let mut state = self
            .state
            .lock()
            .expect("Unable to acquire lock on surface log");
        state.open.retain(|open| *open != id);
        state.closed.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn request(kind: ApprovalKind) -> ApprovalRequest {
        ApprovalRequest {
            kind,
            origin: "https://example.org".to_string(),
            params: json!({}),
        }
    }

    fn mediator() -> ApprovalMediator<MemorySurfaceManager> {
        ApprovalMediator::new(MemorySurfaceManager::new())
    }

    #[tokio::test]
    async fn check_resolve_completes_the_caller() {
        let mediator = mediator();
        let receiver = mediator
            .request_approval(
                request(ApprovalKind::SignPsbt),
                &SurfaceOptions::for_kind(ApprovalKind::SignPsbt),
            )
            .unwrap();

        mediator.resolve_approval(json!("signed"), false);

        let value = receiver.await.unwrap().unwrap();
        assert_eq!(json!("signed"), value);
        assert!(mediator.pending_kind().is_none());
        assert!(mediator.surfaces.open_surfaces().is_empty());
    }

    #[tokio::test]
    async fn check_forced_rejection_uses_user_cancel() {
        let mediator = mediator();
        let receiver = mediator
            .request_approval(
                request(ApprovalKind::SendBitcoin),
                &SurfaceOptions::for_kind(ApprovalKind::SendBitcoin),
            )
            .unwrap();

        mediator.resolve_approval(json!("ignored"), true);

        let error = receiver.await.unwrap().expect_err("Forced rejection");
        assert_eq!(ErrorKind::UserRejectedError, error.kind());
        assert_eq!("User rejected: User Cancel", error.to_string());
    }

    #[tokio::test]
    async fn check_at_most_one_approval() {
        let mediator = mediator();

        let first = mediator
            .request_approval(
                request(ApprovalKind::SignText),
                &SurfaceOptions::for_kind(ApprovalKind::SignText),
            )
            .unwrap();
        let second = mediator
            .request_approval(
                request(ApprovalKind::SignPsbt),
                &SurfaceOptions::for_kind(ApprovalKind::SignPsbt),
            )
            .unwrap();

        // exactly one pending approval; the first surface was closed
        assert_eq!(Some(ApprovalKind::SignPsbt), mediator.pending_kind());
        assert_eq!(1, mediator.surfaces.open_surfaces().len());
        assert_eq!(vec![0], mediator.surfaces.closed_surfaces());

        // the second decision resolves only the second caller
        mediator.resolve_approval(json!("second"), false);
        assert_eq!(json!("second"), second.await.unwrap().unwrap());

        // the first caller's deferred result was orphaned, not resolved
        let mut first = first;
        assert!(matches!(
            first.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn check_implicit_rejection_on_surface_removal() {
        let mediator = mediator();
        let receiver = mediator
            .request_approval(
                request(ApprovalKind::SignPsbt),
                &SurfaceOptions::for_kind(ApprovalKind::SignPsbt),
            )
            .unwrap();

        let surface = mediator.pending_surface().unwrap();
        mediator.on_surface_removed(surface);

        let error = receiver.await.unwrap().expect_err("Implicit rejection");
        assert_eq!(ErrorKind::UserRejectedError, error.kind());
        assert!(mediator.pending_kind().is_none());

        // a second removal event is a no-op
        mediator.on_surface_removed(surface);
    }

    #[tokio::test]
    async fn check_stale_surface_removal_is_ignored() {
        let mediator = mediator();

        let _first = mediator
            .request_approval(
                request(ApprovalKind::SignText),
                &SurfaceOptions::for_kind(ApprovalKind::SignText),
            )
            .unwrap();
        let second = mediator
            .request_approval(
                request(ApprovalKind::SignPsbt),
                &SurfaceOptions::for_kind(ApprovalKind::SignPsbt),
            )
            .unwrap();

        // removal of the replaced surface must not kill the new approval
        mediator.on_surface_removed(0);
        assert_eq!(Some(ApprovalKind::SignPsbt), mediator.pending_kind());

        mediator.resolve_approval(json!(true), false);
        assert_eq!(json!(true), second.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn check_focus_loss_rejection_is_opt_in() {
        let quiet = mediator();
        let receiver = quiet
            .request_approval(
                request(ApprovalKind::SignPsbt),
                &SurfaceOptions::for_kind(ApprovalKind::SignPsbt),
            )
            .unwrap();
        let surface = quiet.pending_surface().unwrap();

        quiet.on_surface_focus_changed(surface, false);
        assert_eq!(Some(ApprovalKind::SignPsbt), quiet.pending_kind());
        drop(receiver);

        let strict = mediator().with_reject_on_blur(true);
        let receiver = strict
            .request_approval(
                request(ApprovalKind::SignPsbt),
                &SurfaceOptions::for_kind(ApprovalKind::SignPsbt),
            )
            .unwrap();
        let surface = strict.pending_surface().unwrap();

        strict.on_surface_focus_changed(surface, false);
        let error = receiver.await.unwrap().expect_err("Blur rejection");
        assert_eq!(ErrorKind::UserRejectedError, error.kind());
    }

    #[tokio::test]
    async fn check_internal_rejection_kind() {
        let mediator = mediator();
        let receiver = mediator
            .request_approval(
                request(ApprovalKind::SignPsbt),
                &SurfaceOptions::for_kind(ApprovalKind::SignPsbt),
            )
            .unwrap();

        mediator.reject_approval(Some("precheck blew up".to_string()), false, true);

        let error = receiver.await.unwrap().expect_err("Internal rejection");
        assert_eq!(ErrorKind::InternalError, error.kind());
    }

    #[test]
    fn check_clear_is_idempotent() {
        let mediator = mediator();
        mediator.clear(false);
        mediator.clear(true);
        assert!(mediator.pending_kind().is_none());
    }
}
