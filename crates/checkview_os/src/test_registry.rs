#![forbid(unsafe_code)]

use std::sync::Arc;

use checkview_contracts::gate::Admitted;
use checkview_contracts::session::{TestConfiguration, TestKey};
use checkview_contracts::{ContractViolation, ReasonCodeId, UnixTimeMs};
use checkview_storage::audit::{AuditChannel, AuditRowInput, AuditRuntime};
use checkview_storage::repo::CheckviewStore;
use checkview_storage::StorageError;
use tracing::{error, info, warn};

pub mod reason_codes {
    use checkview_contracts::ReasonCodeId;

    pub const REGISTRY_OK_STORED: ReasonCodeId = ReasonCodeId(0xC710_0001);
    pub const REGISTRY_FAIL_INCOMPLETE: ReasonCodeId = ReasonCodeId(0xC710_00F1);
}

pub const INCOMPLETE_DETAILS_MESSAGE: &str = "Details to register form test are not correct.";

/// Raw registration fields as they arrive from the caller. Every one is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFormTestRequest {
    pub form_id: Option<String>,
    pub page_id: Option<String>,
    pub test_type: Option<String>,
    pub send_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Details to register form test are not correct.")]
    Incomplete(#[source] ContractViolation),
    #[error("test registration store failure: {0}")]
    Store(#[from] StorageError),
}

/// Stores the configuration a later page view and submission resolve against.
#[derive(Clone)]
pub struct TestRegistry {
    store: Arc<dyn CheckviewStore>,
}

impl TestRegistry {
    pub fn new(store: Arc<dyn CheckviewStore>) -> Self {
        Self { store }
    }

    /// Registers (or replaces) the test for a page. Requires a request already admitted by
    /// the permission gate.
    pub fn register_form_test(
        &self,
        admitted: &Admitted,
        req: &RegisterFormTestRequest,
    ) -> Result<TestKey, RegistrationError> {
        let now = admitted.claimed_at();
        let config = match parse_request(req) {
            Ok(config) => config,
            Err(violation) => {
                warn!(error = %violation, "{INCOMPLETE_DETAILS_MESSAGE}");
                self.audit(now, reason_codes::REGISTRY_FAIL_INCOMPLETE, INCOMPLETE_DETAILS_MESSAGE);
                return Err(RegistrationError::Incomplete(violation));
            }
        };

        let key = config.test_key();
        self.store.upsert_test_config(config)?;
        info!(test_key = key.as_str(), "form test registered");
        self.audit(
            now,
            reason_codes::REGISTRY_OK_STORED,
            &format!("Form test registered under {}.", key.as_str()),
        );
        Ok(key)
    }

    fn audit(&self, at: UnixTimeMs, code: ReasonCodeId, message: &str) {
        let row = AuditRowInput::v1(at, AuditChannel::ApiLogs, code, message);
        if let Err(err) = AuditRuntime::emit(&*self.store, row) {
            error!(error = %err, "audit write failed");
        }
    }
}

fn required<'a>(
    field: &'static str,
    value: &'a Option<String>,
) -> Result<&'a str, ContractViolation> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ContractViolation::InvalidValue {
            field,
            reason: "is required",
        }),
    }
}

fn required_id(field: &'static str, value: &Option<String>) -> Result<u64, ContractViolation> {
    required(field, value)?
        .parse::<u64>()
        .map_err(|_| ContractViolation::InvalidValue {
            field,
            reason: "must be a positive integer",
        })
}

fn parse_request(req: &RegisterFormTestRequest) -> Result<TestConfiguration, ContractViolation> {
    let form_id = required_id("form_id", &req.form_id)?;
    let page_id = required_id("page_id", &req.page_id)?;
    let test_type = required("type", &req.test_type)?;
    let send_to = required("send_to", &req.send_to)?;
    TestConfiguration::v1(form_id, page_id, test_type, send_to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkview_contracts::identifier::NonceId;
    use checkview_storage::repo::{AuditLogRepo, TestConfigRepo};
    use checkview_storage::InMemoryStore;

    fn admitted() -> Admitted {
        Admitted::after_claim(
            NonceId::new("11111111-1111-1111-1111-111111111111").unwrap(),
            UnixTimeMs(1_000),
        )
    }

    fn full() -> RegisterFormTestRequest {
        RegisterFormTestRequest {
            form_id: Some("12".to_string()),
            page_id: Some(" 34 ".to_string()),
            test_type: Some("contact".to_string()),
            send_to: Some("qa@example.com".to_string()),
        }
    }

    #[test]
    fn at_registry_01_complete_request_is_stored_under_page_key() {
        let store = Arc::new(InMemoryStore::new_in_memory());
        let reg = TestRegistry::new(store.clone());
        let key = reg.register_form_test(&admitted(), &full()).unwrap();
        assert_eq!(key.as_str(), "CF_TEST_34");
        let cfg = store.get_test_config(&key).unwrap().unwrap();
        assert_eq!((cfg.form_id, cfg.page_id), (12, 34));
        assert_eq!(cfg.send_to, "qa@example.com");
    }

    #[test]
    fn at_registry_02_any_missing_field_is_refused_and_audited() {
        let store = Arc::new(InMemoryStore::new_in_memory());
        let reg = TestRegistry::new(store.clone());
        let variants = [
            RegisterFormTestRequest { form_id: None, ..full() },
            RegisterFormTestRequest { page_id: Some("abc".to_string()), ..full() },
            RegisterFormTestRequest { test_type: Some("  ".to_string()), ..full() },
            RegisterFormTestRequest { send_to: None, ..full() },
        ];
        for req in &variants {
            assert!(matches!(
                reg.register_form_test(&admitted(), req),
                Err(RegistrationError::Incomplete(_))
            ));
        }
        let rows = store.audit_rows().unwrap();
        assert_eq!(rows.len(), variants.len());
        assert!(rows.iter().all(|r| r.message == INCOMPLETE_DETAILS_MESSAGE));
        assert!(store.get_test_config(&TestKey::for_page(34)).unwrap().is_none());
    }

    #[test]
    fn at_registry_03_reregistration_replaces_previous_config() {
        let store = Arc::new(InMemoryStore::new_in_memory());
        let reg = TestRegistry::new(store.clone());
        reg.register_form_test(&admitted(), &full()).unwrap();
        let changed = RegisterFormTestRequest {
            send_to: Some("other@example.com".to_string()),
            ..full()
        };
        reg.register_form_test(&admitted(), &changed).unwrap();
        let cfg = store.get_test_config(&TestKey::for_page(34)).unwrap().unwrap();
        assert_eq!(cfg.send_to, "other@example.com");
    }
}
