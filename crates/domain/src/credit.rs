//! External payment confirmations and their idempotency record.

use chrono::{DateTime, Utc};
use common::{AccountId, Tokens};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// A verified payment confirmation, as delivered by the payment collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCredit {
    pub event_id: String,
    pub account: AccountId,
    pub amount: Tokens,
}

/// Longest external event id the ledger records.
pub const MAX_EVENT_ID_LEN: usize = 255;

impl ExternalCredit {
    pub fn new(event_id: impl Into<String>, account: AccountId, amount: Tokens) -> Self {
        Self {
            event_id: event_id.into(),
            account,
            amount,
        }
    }

    /// Rejects blank or overlong event ids and zero amounts.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.event_id.trim().is_empty() || self.event_id.chars().count() > MAX_EVENT_ID_LEN {
            return Err(LedgerError::InvalidEventId);
        }
        if self.amount.is_zero() {
            return Err(LedgerError::InvalidAmount {
                amount: self.amount,
            });
        }
        Ok(())
    }
}

/// The recorded result of applying an external credit.
///
/// One record exists per external event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEvent {
    pub event_id: String,
    pub account: AccountId,
    pub amount: Tokens,
    pub balance_after: Tokens,
    pub processed_at: DateTime<Utc>,
}

impl CreditEvent {
    /// Records a credit that has just been applied.
    pub fn record(credit: &ExternalCredit, balance_after: Tokens, processed_at: DateTime<Utc>) -> Self {
        Self {
            event_id: credit.event_id.clone(),
            account: credit.account,
            amount: credit.amount,
            balance_after,
            processed_at,
        }
    }
}

/// Outcome of applying an external credit.
///
/// A replayed event yields the first record with `duplicate` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditOutcome {
    pub event: CreditEvent,
    pub duplicate: bool,
}

impl CreditOutcome {
    pub fn applied(event: CreditEvent) -> Self {
        Self {
            event,
            duplicate: false,
        }
    }

    pub fn replayed(event: CreditEvent) -> Self {
        Self {
            event,
            duplicate: true,
        }
    }
}
