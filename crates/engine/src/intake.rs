//! Credit intake: turning confirmed external payments into tokens.

use std::time::Instant;

use common::{AccountId, Tokens};
use domain::{CreditOutcome, ExternalCredit, LedgerError};
use ledger_store::LedgerStore;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::telemetry::observe;

const CENTS_PER_EURO: u64 = 100;

/// Applies payment provider confirmations to account balances.
///
/// The provider may deliver the same confirmation more than once; each event
/// id credits its account at most once.
pub struct CreditIntake<S: LedgerStore> {
    store: S,
    retry: RetryPolicy,
    tokens_per_euro: u64,
}

impl<S: LedgerStore> CreditIntake<S> {
    /// Creates a new credit intake over the given store.
    pub fn new(store: S, config: &EngineConfig) -> Self {
        Self {
            store,
            retry: config.retry_policy(),
            tokens_per_euro: config.tokens_per_euro,
        }
    }

    /// Gets a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Credits `amount` tokens for a verified external event.
    ///
    /// A replayed `event_id` returns the first outcome with `duplicate` set
    /// and leaves the balance untouched.
    #[tracing::instrument(skip(self, event_id), fields(event_id = %event_id.as_ref()))]
    pub async fn apply_external_credit(
        &self,
        event_id: impl AsRef<str>,
        account: AccountId,
        amount: Tokens,
    ) -> Result<CreditOutcome, EngineError> {
        let started = Instant::now();
        let credit = ExternalCredit::new(event_id.as_ref(), account, amount);
        let result = retry_on_conflict(&self.retry, "apply_external_credit", || {
            self.store.apply_external_credit(credit.clone())
        })
        .await;
        observe("apply_external_credit", started, &result);

        match &result {
            Ok(outcome) if outcome.duplicate => {
                metrics::counter!("ledger_duplicate_credits_total").increment(1);
                tracing::info!(
                    processed_at = %outcome.event.processed_at,
                    "duplicate external credit ignored"
                );
            }
            Ok(outcome) => {
                metrics::counter!("ledger_external_credits_total").increment(1);
                tracing::info!(
                    new_balance = outcome.event.balance_after.amount(),
                    "external credit applied"
                );
            }
            Err(_) => {}
        }
        result
    }

    /// Converts a payment amount in cents into whole tokens.
    ///
    /// Partial euros are dropped. A payment worth less than one token is
    /// rejected.
    pub fn tokens_for_payment(&self, amount_cents: u64) -> Result<Tokens, EngineError> {
        let tokens = (amount_cents / CENTS_PER_EURO)
            .checked_mul(self.tokens_per_euro)
            .map(Tokens::new)
            .ok_or(LedgerError::AmountOverflow)?;
        if tokens.is_zero() {
            return Err(LedgerError::InvalidAmount { amount: tokens }.into());
        }
        Ok(tokens)
    }
}
