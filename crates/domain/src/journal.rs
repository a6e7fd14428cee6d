//! Append-only journal of balance movements.

use chrono::{DateTime, Utc};
use common::{AccountId, EntryId, KermesseId, StandId, Tokens};
use serde::{Deserialize, Serialize};

/// Whether an entry added or removed tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "credit" => Some(Direction::Credit),
            "debit" => Some(Direction::Debit),
            _ => None,
        }
    }
}

/// Why a balance moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// Goods bought at a stand.
    Purchase { stand: StandId, quantity: u32 },
    /// Tombola tickets bought for a kermesse.
    TicketPurchase { kermesse: KermesseId, quantity: u32 },
    /// Tokens credited by a confirmed external payment.
    ExternalCredit { event_id: String },
    /// Tokens added directly to the account.
    TopUp,
    /// Tokens sent to another account.
    TransferOut { to: AccountId },
    /// Tokens received from another account.
    TransferIn { from: AccountId },
}

impl EntryKind {
    /// Returns a short label, used as the stored kind column.
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Purchase { .. } => "purchase",
            EntryKind::TicketPurchase { .. } => "ticket_purchase",
            EntryKind::ExternalCredit { .. } => "external_credit",
            EntryKind::TopUp => "top_up",
            EntryKind::TransferOut { .. } => "transfer_out",
            EntryKind::TransferIn { .. } => "transfer_in",
        }
    }
}

/// One line of an account's journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account: AccountId,
    pub direction: Direction,
    pub amount: Tokens,
    pub kind: EntryKind,
    pub balance_after: Tokens,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Journals tokens added to an account.
    pub fn credit(
        account: AccountId,
        amount: Tokens,
        kind: EntryKind,
        balance_after: Tokens,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            account,
            direction: Direction::Credit,
            amount,
            kind,
            balance_after,
            recorded_at,
        }
    }

    /// Journals tokens removed from an account.
    pub fn debit(
        account: AccountId,
        amount: Tokens,
        kind: EntryKind,
        balance_after: Tokens,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            account,
            direction: Direction::Debit,
            amount,
            kind,
            balance_after,
            recorded_at,
        }
    }
}
