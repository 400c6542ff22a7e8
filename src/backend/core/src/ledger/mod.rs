//! Settlement ledger: entities and the repositories that persist them.
//!
//! - **models**: wallets, transactions, investments, staking, referrals, ...
//! - **store**: `LedgerStore` / `LedgerTx` repository traits
//! - **memory**: `InMemoryStore` for tests and local runs
//! - **postgres**: `PgStore` over `sqlx`

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::{InMemoryStore, MemoryState};
pub use models::*;
pub use postgres::PgStore;
pub use store::{IsolationLevel, LedgerStore, LedgerTx, LockMode};
