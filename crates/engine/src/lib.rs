//! Engines of the kermesse token ledger.
//!
//! Each engine wraps an injected [`LedgerStore`](ledger_store::LedgerStore)
//! and exposes one family of operations:
//! - [`ExchangeEngine`]: purchases at stands, top-ups, transfers, balances
//! - [`TombolaEngine`]: ticket sales and lot draws
//! - [`CreditIntake`]: idempotent credits from the payment provider
//!
//! Transient store conflicts are retried with backoff according to the
//! [`RetryPolicy`] built from [`EngineConfig`].

pub mod config;
pub mod error;
pub mod exchange;
pub mod intake;
pub mod random;
pub mod retry;
pub mod telemetry;
pub mod tombola;

pub use config::{EngineConfig, LogFormat};
pub use error::EngineError;
pub use exchange::ExchangeEngine;
pub use intake::CreditIntake;
pub use random::{RandomSource, SeededRandom};
pub use retry::RetryPolicy;
pub use tombola::{DrawOutcome, TombolaEngine};
