//! Shared identifiers and token amounts used across the ledger crates.

mod ids;
mod tokens;

pub use ids::{AccountId, EntryId, KermesseId, LotId, StandId, TicketId};
pub use tokens::Tokens;
