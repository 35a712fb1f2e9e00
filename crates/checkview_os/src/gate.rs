#![forbid(unsafe_code)]

use std::sync::Arc;

use checkview_contracts::gate::{
    reason_codes, Admitted, GateDenial, GateRequest, TokenValidator, TransportSecurity,
};
use checkview_contracts::identifier::{is_well_formed_identifier, NonceId};
use checkview_contracts::nonce::ClaimOutcome;
use checkview_storage::audit::{AuditChannel, AuditRowInput, AuditRuntime};
use checkview_storage::repo::CheckviewStore;
use tracing::{debug, error, warn};

/// Admission check in front of every API handler.
///
/// Steps run in a fixed order and stop at the first failure. Only the last step touches
/// the store, and it is a single atomic claim.
#[derive(Clone)]
pub struct PermissionGate {
    validator: Arc<dyn TokenValidator>,
    store: Arc<dyn CheckviewStore>,
}

impl PermissionGate {
    pub fn new(validator: Arc<dyn TokenValidator>, store: Arc<dyn CheckviewStore>) -> Self {
        Self { validator, store }
    }

    pub fn evaluate(&self, req: &GateRequest<'_>) -> Result<Admitted, GateDenial> {
        match self.admit(req) {
            Ok(admitted) => {
                debug!(
                    nonce = admitted.nonce().as_str(),
                    reason_code = %reason_codes::GATE_OK_ADMITTED,
                    "request admitted"
                );
                Ok(admitted)
            }
            Err(denial) => {
                self.record_denial(req, &denial);
                Err(denial)
            }
        }
    }

    fn admit(&self, req: &GateRequest<'_>) -> Result<Admitted, GateDenial> {
        let credential = match req.authorization.map(str::trim) {
            Some(c) if !c.is_empty() => c,
            _ => return Err(GateDenial::AuthMissing),
        };

        // Checked before the credential is looked at: a plaintext channel already leaked it.
        if req.transport != TransportSecurity::Encrypted {
            return Err(GateDenial::InsecureTransport);
        }

        let raw_nonce = match self.validator.validate(credential, req.now) {
            Ok(n) if !n.trim().is_empty() => n,
            Ok(_) => return Err(GateDenial::InvalidToken(None)),
            Err(err) => return Err(GateDenial::InvalidToken(Some(err))),
        };

        if !is_well_formed_identifier(&raw_nonce) {
            return Err(GateDenial::MalformedIdentifier);
        }
        let nonce = NonceId::new(raw_nonce).map_err(|_| GateDenial::MalformedIdentifier)?;

        match self.store.claim_nonce(&nonce, req.now) {
            Ok(ClaimOutcome::Claimed) => Ok(Admitted::after_claim(nonce, req.now)),
            Ok(ClaimOutcome::AlreadyClaimed) => Err(GateDenial::ReplayedToken),
            Err(err) => Err(GateDenial::StoreError {
                detail: err.to_string(),
            }),
        }
    }

    fn record_denial(&self, req: &GateRequest<'_>, denial: &GateDenial) {
        warn!(
            denial = denial.kind(),
            reason_code = %denial.reason_code(),
            "{denial}"
        );
        let row = AuditRowInput::v1(
            req.now,
            AuditChannel::ApiLogs,
            denial.reason_code(),
            denial.audit_message(),
        );
        if let Err(err) = AuditRuntime::emit(&*self.store, row) {
            error!(denial = denial.kind(), error = %err, "audit write failed");
        }
    }
}
