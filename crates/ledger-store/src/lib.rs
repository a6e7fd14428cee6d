//! Transactional storage for the kermesse token ledger.
//!
//! The [`LedgerStore`] trait is the only way balances, stock, tickets, lot
//! winners and credit events change. Every method is one atomic unit of
//! work, serialized per entity:
//! - [`InMemoryLedgerStore`] holds one async mutex per entity
//! - [`PostgresLedgerStore`] takes row locks inside a database transaction

pub mod error;
mod locks;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use store::{Award, LedgerStore, LedgerStoreExt};
