#![forbid(unsafe_code)]

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::identifier::TestIdentifier;
use crate::{ContractViolation, UnixTimeMs, Validate};

/// Query parameter (and generic cookie name) carrying the test identifier.
pub const TEST_ID_PARAM: &str = "checkview_test_id";
pub const TEST_ID_COOKIE_MAX_AGE_S: u64 = 6_600;
pub const NAMESPACED_TEST_ID_COOKIE_MAX_AGE_S: u64 = 3_600;

/// Sessions live as long as the long-lived cookie does.
pub const DEFAULT_SESSION_TTL_MS: u64 = TEST_ID_COOKIE_MAX_AGE_S * 1_000;

const TEST_KEY_PREFIX: &str = "CF_TEST_";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VisitorAddress(String);

impl VisitorAddress {
    pub fn new(addr: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(addr.into().trim().to_string());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for VisitorAddress {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "visitor_address",
                reason: "must not be empty",
            });
        }
        if self.0.parse::<IpAddr>().is_err() {
            return Err(ContractViolation::InvalidValue {
                field: "visitor_address",
                reason: "must be an IPv4 or IPv6 address",
            });
        }
        Ok(())
    }
}

/// Storage key of a test configuration, derived from the page the test runs on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestKey(String);

impl TestKey {
    pub fn for_page(page_id: u64) -> Self {
        Self(format!("{TEST_KEY_PREFIX}{page_id}"))
    }

    /// Rebuilds a key read back from storage.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into();
        let page = raw
            .strip_prefix(TEST_KEY_PREFIX)
            .ok_or(ContractViolation::InvalidValue {
                field: "test_key",
                reason: "must start with CF_TEST_",
            })?;
        match page.parse::<u64>() {
            Ok(id) if id > 0 => Ok(Self(raw)),
            _ => Err(ContractViolation::InvalidValue {
                field: "test_key",
                reason: "must end with a positive page id",
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub form_id: u64,
    pub page_id: u64,
    #[serde(rename = "type")]
    pub test_type: String,
    pub send_to: String,
}

impl TestConfiguration {
    pub fn v1(
        form_id: u64,
        page_id: u64,
        test_type: impl Into<String>,
        send_to: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let v = Self {
            form_id,
            page_id,
            test_type: test_type.into().trim().to_string(),
            send_to: send_to.into().trim().to_string(),
        };
        v.validate()?;
        Ok(v)
    }

    pub fn test_key(&self) -> TestKey {
        TestKey::for_page(self.page_id)
    }
}

impl Validate for TestConfiguration {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.form_id == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "form_id",
                reason: "must be a positive integer",
            });
        }
        if self.page_id == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "page_id",
                reason: "must be a positive integer",
            });
        }
        if self.test_type.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "type",
                reason: "must not be empty",
            });
        }
        if self.test_type.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "type",
                reason: "must be <= 64 chars",
            });
        }
        if self.send_to.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "send_to",
                reason: "must not be empty",
            });
        }
        if self.send_to.len() > 254 {
            return Err(ContractViolation::InvalidValue {
                field: "send_to",
                reason: "must be <= 254 chars",
            });
        }
        Ok(())
    }
}

/// "This visitor is running this test, whose configuration lives under `test_key`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSessionRecord {
    pub visitor_address: VisitorAddress,
    pub test_identifier: TestIdentifier,
    pub test_key: TestKey,
    pub created_at: UnixTimeMs,
}

impl TestSessionRecord {
    pub fn v1(
        visitor_address: VisitorAddress,
        test_identifier: TestIdentifier,
        test_key: TestKey,
        created_at: UnixTimeMs,
    ) -> Self {
        Self {
            visitor_address,
            test_identifier,
            test_key,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTest {
    pub test_identifier: TestIdentifier,
    pub test_key: TestKey,
    /// `None` when the session points at a key nobody registered (or it was removed).
    pub configuration: Option<TestConfiguration>,
    pub send_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    Pending {
        test_identifier: TestIdentifier,
        recorded_at: UnixTimeMs,
    },
    Resolved(ResolvedTest),
    Expired {
        test_identifier: TestIdentifier,
        recorded_at: UnixTimeMs,
    },
}

/// Request-scoped test context handed to whatever handles the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestContext {
    pub test_identifier: Option<TestIdentifier>,
    pub send_to: String,
}

impl TestContext {
    pub fn without_test(default_send_to: &str) -> Self {
        Self {
            test_identifier: None,
            send_to: default_send_to.to_string(),
        }
    }

    pub fn from_phase(phase: &SessionPhase, default_send_to: &str) -> Self {
        match phase {
            SessionPhase::Resolved(resolved) => Self {
                test_identifier: Some(resolved.test_identifier.clone()),
                send_to: resolved.send_to.clone(),
            },
            SessionPhase::NoSession
            | SessionPhase::Pending { .. }
            | SessionPhase::Expired { .. } => Self::without_test(default_send_to),
        }
    }

    pub fn is_test(&self) -> bool {
        self.test_identifier.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CookieScope {
    /// Empty means a host-only cookie.
    pub domain: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub max_age_s: u64,
    pub domain: String,
    pub path: String,
}

/// Both correlation cookies for one test: the generic one and the per-test fallback.
pub fn session_cookies(test_identifier: &TestIdentifier, scope: &CookieScope) -> [SessionCookie; 2] {
    let value = test_identifier.as_str().to_string();
    [
        SessionCookie {
            name: TEST_ID_PARAM.to_string(),
            value: value.clone(),
            max_age_s: TEST_ID_COOKIE_MAX_AGE_S,
            domain: scope.domain.clone(),
            path: scope.path.clone(),
        },
        SessionCookie {
            name: format!("{TEST_ID_PARAM}{value}"),
            value,
            max_age_s: NAMESPACED_TEST_ID_COOKIE_MAX_AGE_S,
            domain: scope.domain.clone(),
            path: scope.path.clone(),
        },
    ]
}
