//! Persistence backends for LocalAPI.
//!
//! `SqliteStore` is the durable backend the server runs on; `InMemoryStore`
//! backs tests and throwaway sessions. Both implement
//! [`localapi_core::Store`].

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
