#![forbid(unsafe_code)]

pub mod cleanup;
pub mod clock;
pub mod gate;
pub mod session_resolver;
pub mod test_registry;

#[cfg(test)]
mod test_support;
