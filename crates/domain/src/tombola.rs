//! Tombola tickets and lots.

use chrono::{DateTime, Utc};
use common::{AccountId, KermesseId, LotId, TicketId};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// A purchased entry into a kermesse's draws. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub account: AccountId,
    pub kermesse: KermesseId,
    pub issued_at: DateTime<Utc>,
}

impl Ticket {
    /// Issues a single ticket.
    pub fn issue(account: AccountId, kermesse: KermesseId, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: TicketId::new(),
            account,
            kermesse,
            issued_at,
        }
    }

    /// Issues `quantity` tickets sharing one timestamp.
    pub fn issue_batch(
        account: AccountId,
        kermesse: KermesseId,
        quantity: u32,
        issued_at: DateTime<Utc>,
    ) -> Vec<Ticket> {
        (0..quantity)
            .map(|_| Ticket::issue(account, kermesse, issued_at))
            .collect()
    }
}

/// A prize awarded to exactly one winning ticket-holder.
///
/// The winner goes from unset to set once and is never reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    id: LotId,
    kermesse: KermesseId,
    name: String,
    winner: Option<AccountId>,
    winning_ticket: Option<TicketId>,
    drawn_at: Option<DateTime<Utc>>,
}

impl Lot {
    /// Creates a lot that has not been drawn yet.
    pub fn new(id: LotId, kermesse: KermesseId, name: impl Into<String>) -> Self {
        Self {
            id,
            kermesse,
            name: name.into(),
            winner: None,
            winning_ticket: None,
            drawn_at: None,
        }
    }

    /// Rebuilds a lot from persisted fields.
    pub fn restore(
        id: LotId,
        kermesse: KermesseId,
        name: impl Into<String>,
        winner: Option<AccountId>,
        winning_ticket: Option<TicketId>,
        drawn_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            kermesse,
            name: name.into(),
            winner,
            winning_ticket,
            drawn_at,
        }
    }

    pub fn id(&self) -> LotId {
        self.id
    }

    pub fn kermesse(&self) -> KermesseId {
        self.kermesse
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn winner(&self) -> Option<AccountId> {
        self.winner
    }

    pub fn winning_ticket(&self) -> Option<TicketId> {
        self.winning_ticket
    }

    pub fn drawn_at(&self) -> Option<DateTime<Utc>> {
        self.drawn_at
    }

    pub fn is_drawn(&self) -> bool {
        self.winner.is_some()
    }

    /// Fails with `LotAlreadyDrawn` if a winner is set.
    pub fn ensure_undrawn(&self) -> Result<(), LedgerError> {
        match self.winner {
            Some(winner) => Err(LedgerError::LotAlreadyDrawn {
                lot: self.id,
                winner,
            }),
            None => Ok(()),
        }
    }

    /// Assigns the winning ticket's holder.
    pub fn award(&mut self, ticket: &Ticket, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.ensure_undrawn()?;
        self.winner = Some(ticket.account);
        self.winning_ticket = Some(ticket.id);
        self.drawn_at = Some(at);
        Ok(())
    }
}
