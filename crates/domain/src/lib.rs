//! Domain layer for the kermesse token ledger.
//!
//! This crate holds the ledger's entities and the rules that govern them:
//! - Accounts with a non-negative token balance
//! - Stands with finite, priced stock
//! - Tombola tickets and lots with a one-way winner assignment
//! - Deduplicated external credit events
//! - The append-only journal of balance movements
//!
//! Every transition here validates before it mutates, so a store can apply
//! several of them under its locks and commit all of them or none.

pub mod account;
pub mod credit;
pub mod error;
pub mod exchange;
pub mod journal;
pub mod kermesse;
pub mod stand;
pub mod tombola;

pub use account::Account;
pub use common::{AccountId, EntryId, KermesseId, LotId, StandId, TicketId, Tokens};
pub use credit::{CreditEvent, CreditOutcome, ExternalCredit, MAX_EVENT_ID_LEN};
pub use error::{EntityKind, LedgerError};
pub use exchange::{
    MAX_TICKETS_PER_PURCHASE, PurchaseReceipt, TicketBatch, TransferReceipt, settle_purchase,
    settle_ticket_purchase, settle_transfer,
};
pub use journal::{Direction, EntryKind, LedgerEntry};
pub use kermesse::Kermesse;
pub use stand::{Stand, StandKind};
pub use tombola::{Lot, Ticket};
