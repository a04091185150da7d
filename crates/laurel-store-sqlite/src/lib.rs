//! SQLite backend for the Laurel XP ledger.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. Every mutating operation is
//! one SQLite transaction executed while holding the in-process per-user
//! lock.

mod encode;
mod schema;
mod store;

pub mod error;
pub mod lock;

pub use error::{Error, Result};
pub use lock::{LockGuard, LockManager};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
