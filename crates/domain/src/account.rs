//! Token-holding accounts.

use common::{AccountId, Tokens};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// A user's token-holding identity.
///
/// The balance can only change through [`Account::credit`] and
/// [`Account::debit`], which keep it non-negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    name: String,
    balance: Tokens,
}

impl Account {
    /// Opens an account with a starting balance.
    pub fn new(id: AccountId, name: impl Into<String>, balance: Tokens) -> Self {
        Self {
            id,
            name: name.into(),
            balance,
        }
    }

    /// Opens an account with a fresh id and an empty balance.
    pub fn open(name: impl Into<String>) -> Self {
        Self::new(AccountId::new(), name, Tokens::zero())
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn balance(&self) -> Tokens {
        self.balance
    }

    /// Checks that a debit of `amount` would succeed, without applying it.
    pub fn ensure_can_afford(&self, amount: Tokens) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount { amount });
        }
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: self.id,
                balance: self.balance,
                required: amount,
            });
        }
        Ok(())
    }

    /// Adds tokens and returns the new balance.
    pub fn credit(&mut self, amount: Tokens) -> Result<Tokens, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount { amount });
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::AmountOverflow)?;
        Ok(self.balance)
    }

    /// Removes tokens if the balance covers them and returns the new balance.
    ///
    /// On failure the balance is left untouched.
    pub fn debit(&mut self, amount: Tokens) -> Result<Tokens, LedgerError> {
        self.ensure_can_afford(amount)?;
        // ensure_can_afford guarantees balance >= amount
        self.balance = Tokens::new(self.balance.amount() - amount.amount());
        Ok(self.balance)
    }
}
