#![forbid(unsafe_code)]

pub mod common;
pub mod gate;
pub mod identifier;
pub mod nonce;
pub mod session;

pub use common::{ContractViolation, ReasonCodeId, UnixTimeMs, Validate};
