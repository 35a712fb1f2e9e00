#![forbid(unsafe_code)]

pub mod audit;
pub mod repo;
pub mod sqlite;
pub mod store;

pub use store::{InMemoryStore, StorageError};
