//! Ledger error taxonomy.

use common::{AccountId, KermesseId, LotId, StandId, Tokens};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kinds of entity a ledger operation can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Account,
    Stand,
    Kermesse,
    Lot,
    CreditEvent,
}

impl EntityKind {
    /// Returns the entity kind as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Stand => "stand",
            EntityKind::Kermesse => "kermesse",
            EntityKind::Lot => "lot",
            EntityKind::CreditEvent => "credit event",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rule violations reported by ledger operations.
///
/// These are terminal for a request: retrying with the same input against
/// the same state cannot make them succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The account balance does not cover the requested debit.
    #[error("Insufficient funds on account {account}: balance is {balance}, {required} required")]
    InsufficientFunds {
        account: AccountId,
        balance: Tokens,
        required: Tokens,
    },

    /// The stand does not hold enough stock for the requested quantity.
    #[error("Insufficient stock at stand {stand}: {available} available, {requested} requested")]
    InsufficientStock {
        stand: StandId,
        available: u32,
        requested: u32,
    },

    /// A draw was requested for a kermesse with no eligible tickets.
    #[error("No tickets available for the draw in kermesse {kermesse}")]
    NoTicketsAvailable { kermesse: KermesseId },

    /// The lot already has a winner.
    #[error("Lot {lot} has already been drawn, winner is {winner}")]
    LotAlreadyDrawn { lot: LotId, winner: AccountId },

    /// The referenced entity does not exist.
    #[error("Unknown {kind}: {id}")]
    UnknownEntity { kind: EntityKind, id: String },

    /// Token amounts must be strictly positive.
    #[error("Invalid amount: {amount} (must be greater than 0)")]
    InvalidAmount { amount: Tokens },

    /// A cost or balance would exceed the representable token range.
    #[error("Token amount overflow")]
    AmountOverflow,

    /// Quantities must be strictly positive.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// A transfer must move tokens between two distinct accounts.
    #[error("Invalid transfer: account {account} cannot transfer to itself")]
    InvalidTransfer { account: AccountId },

    /// External credit events must carry a non-blank identifier of at most
    /// 255 characters.
    #[error("External credit event id must be non-blank and at most 255 characters")]
    InvalidEventId,
}

impl LedgerError {
    /// Builds an `UnknownEntity` error for the given kind and id.
    pub fn unknown(kind: EntityKind, id: impl std::fmt::Display) -> Self {
        LedgerError::UnknownEntity {
            kind,
            id: id.to_string(),
        }
    }
}
