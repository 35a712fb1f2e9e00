#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

/// Length of the canonical hyphenated form `8-4-4-4-12`.
const HYPHENATED_UUID_LEN: usize = 36;

/// Returns true only for the hyphenated hex UUID form.
///
/// Simple, braced and URN encodings are rejected even though they name the same value,
/// so one identifier has exactly one accepted spelling in the ledger.
pub fn is_well_formed_identifier(s: &str) -> bool {
    s.len() == HYPHENATED_UUID_LEN && uuid::Uuid::try_parse(s).is_ok()
}

fn validate_uuid_shaped(field: &'static str, s: &str) -> Result<(), ContractViolation> {
    if s.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if !is_well_formed_identifier(s) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be a hyphenated UUID",
        });
    }
    Ok(())
}

/// Single-use identifier carried inside a validated credential.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NonceId(String);

impl NonceId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for NonceId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_uuid_shaped("nonce_id", &self.0)
    }
}

/// Identifier of one test run, supplied by the client on the page view.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestIdentifier(String);

impl TestIdentifier {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TestIdentifier {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_uuid_shaped("test_identifier", &self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_ident_01_hyphenated_uuid_is_accepted() {
        assert!(is_well_formed_identifier(
            "11111111-1111-1111-1111-111111111111"
        ));
        assert!(is_well_formed_identifier(
            "6F9619FF-8B86-D011-B42D-00C04FC964FF"
        ));
    }

    #[test]
    fn at_ident_02_other_spellings_are_rejected() {
        assert!(!is_well_formed_identifier("not-a-uuid"));
        assert!(!is_well_formed_identifier(""));
        assert!(!is_well_formed_identifier(
            "11111111111111111111111111111111"
        ));
        assert!(!is_well_formed_identifier(
            "{11111111-1111-1111-1111-111111111111}"
        ));
        assert!(!is_well_formed_identifier(
            "urn:uuid:11111111-1111-1111-1111-111111111111"
        ));
        assert!(!is_well_formed_identifier(
            "1111111g-1111-1111-1111-111111111111"
        ));
    }

    #[test]
    fn at_ident_03_newtypes_fail_closed_on_malformed_input() {
        assert_eq!(
            NonceId::new("not-a-uuid"),
            Err(ContractViolation::InvalidValue {
                field: "nonce_id",
                reason: "must be a hyphenated UUID",
            })
        );
        assert_eq!(
            TestIdentifier::new("  "),
            Err(ContractViolation::InvalidValue {
                field: "test_identifier",
                reason: "must not be empty",
            })
        );
        let id = TestIdentifier::new("22222222-2222-2222-2222-222222222222").unwrap();
        assert_eq!(id.as_str(), "22222222-2222-2222-2222-222222222222");
    }
}
