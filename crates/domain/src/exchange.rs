//! Compound transitions spanning more than one entity.
//!
//! Each function checks every precondition before touching any entity, so
//! when it returns an error none of its arguments has been modified.

use chrono::{DateTime, Utc};
use common::{AccountId, KermesseId, StandId, Tokens};
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::error::LedgerError;
use crate::stand::Stand;
use crate::tombola::Ticket;

/// Result of a goods purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub account: AccountId,
    pub stand: StandId,
    pub quantity: u32,
    pub total_cost: Tokens,
    pub new_balance: Tokens,
    pub new_stock: u32,
}

/// Result of a tombola ticket purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBatch {
    pub account: AccountId,
    pub kermesse: KermesseId,
    pub tickets: Vec<Ticket>,
    pub total_cost: Tokens,
    pub new_balance: Tokens,
}

/// Result of a transfer between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Tokens,
    pub from_balance: Tokens,
    pub to_balance: Tokens,
}

/// Debits the account and takes the goods out of the stand's stock.
///
/// Funds are checked before stock. A free stand (unit price zero) only
/// consumes stock.
pub fn settle_purchase(
    account: &mut Account,
    stand: &mut Stand,
    quantity: u32,
) -> Result<PurchaseReceipt, LedgerError> {
    let total_cost = stand.quote(quantity)?;
    if !total_cost.is_zero() {
        account.ensure_can_afford(total_cost)?;
    }
    stand.ensure_in_stock(quantity)?;

    let new_balance = if total_cost.is_zero() {
        account.balance()
    } else {
        account.debit(total_cost)?
    };
    let new_stock = stand.reserve(quantity)?;

    Ok(PurchaseReceipt {
        account: account.id(),
        stand: stand.id(),
        quantity,
        total_cost,
        new_balance,
        new_stock,
    })
}

/// Largest number of tickets a single purchase may issue.
pub const MAX_TICKETS_PER_PURCHASE: u32 = 1_000;

/// Debits the account for `quantity` tickets and issues them.
pub fn settle_ticket_purchase(
    account: &mut Account,
    kermesse: KermesseId,
    quantity: u32,
    ticket_price: Tokens,
    issued_at: DateTime<Utc>,
) -> Result<TicketBatch, LedgerError> {
    if quantity == 0 || quantity > MAX_TICKETS_PER_PURCHASE {
        return Err(LedgerError::InvalidQuantity { quantity });
    }
    let total_cost = ticket_price
        .checked_mul(quantity)
        .ok_or(LedgerError::AmountOverflow)?;

    let new_balance = if total_cost.is_zero() {
        account.balance()
    } else {
        account.debit(total_cost)?
    };

    Ok(TicketBatch {
        account: account.id(),
        kermesse,
        tickets: Ticket::issue_batch(account.id(), kermesse, quantity, issued_at),
        total_cost,
        new_balance,
    })
}

/// Moves tokens from one account to another.
pub fn settle_transfer(
    from: &mut Account,
    to: &mut Account,
    amount: Tokens,
) -> Result<TransferReceipt, LedgerError> {
    if from.id() == to.id() {
        return Err(LedgerError::InvalidTransfer { account: from.id() });
    }
    from.ensure_can_afford(amount)?;
    to.balance()
        .checked_add(amount)
        .ok_or(LedgerError::AmountOverflow)?;

    let from_balance = from.debit(amount)?;
    let to_balance = to.credit(amount)?;

    Ok(TransferReceipt {
        from: from.id(),
        to: to.id(),
        amount,
        from_balance,
        to_balance,
    })
}
