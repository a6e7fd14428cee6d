//! Exchange engine: spending and moving tokens.

use std::time::Instant;

use common::{AccountId, StandId, Tokens};
use domain::{EntryKind, LedgerEntry, PurchaseReceipt, TransferReceipt};
use ledger_store::{LedgerStore, LedgerStoreExt};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::telemetry::observe;

/// Handles purchases at stands and the balance operations around them.
pub struct ExchangeEngine<S: LedgerStore> {
    store: S,
    retry: RetryPolicy,
}

impl<S: LedgerStore> ExchangeEngine<S> {
    /// Creates a new exchange engine over the given store.
    pub fn new(store: S, config: &EngineConfig) -> Self {
        Self {
            store,
            retry: config.retry_policy(),
        }
    }

    /// Overrides the conflict retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Gets a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Buys `quantity` units at a stand.
    ///
    /// The debit and the stock decrement happen together or not at all.
    /// Funds are checked before stock.
    #[tracing::instrument(skip(self))]
    pub async fn purchase(
        &self,
        account: AccountId,
        stand: StandId,
        quantity: u32,
    ) -> Result<PurchaseReceipt, EngineError> {
        let started = Instant::now();
        let result = retry_on_conflict(&self.retry, "purchase", || {
            self.store.purchase(account, stand, quantity)
        })
        .await;
        observe("purchase", started, &result);

        match &result {
            Ok(receipt) => {
                metrics::counter!("ledger_purchases_total").increment(1);
                tracing::info!(
                    total_cost = receipt.total_cost.amount(),
                    new_balance = receipt.new_balance.amount(),
                    new_stock = receipt.new_stock,
                    "purchase settled"
                );
            }
            Err(err) => {
                metrics::counter!("ledger_purchase_rejections_total", "reason" => err.reason())
                    .increment(1);
            }
        }
        result
    }

    /// Takes stock out of a stand without charging anyone.
    #[tracing::instrument(skip(self))]
    pub async fn reserve_stock(&self, stand: StandId, quantity: u32) -> Result<u32, EngineError> {
        let started = Instant::now();
        let result = retry_on_conflict(&self.retry, "reserve_stock", || {
            self.store.reserve_stock(stand, quantity)
        })
        .await;
        observe("reserve_stock", started, &result);
        result
    }

    /// Credits tokens bought directly, outside the payment provider flow.
    #[tracing::instrument(skip(self))]
    pub async fn top_up(&self, account: AccountId, amount: Tokens) -> Result<Tokens, EngineError> {
        let started = Instant::now();
        let result = retry_on_conflict(&self.retry, "top_up", || {
            self.store.credit(account, amount, EntryKind::TopUp)
        })
        .await;
        observe("top_up", started, &result);

        if let Ok(balance) = &result {
            tracing::info!(new_balance = balance.amount(), "account topped up");
        }
        result
    }

    /// Moves tokens from one account to another, typically parent to child.
    #[tracing::instrument(skip(self))]
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Tokens,
    ) -> Result<TransferReceipt, EngineError> {
        let started = Instant::now();
        let result = retry_on_conflict(&self.retry, "transfer", || {
            self.store.transfer(from, to, amount)
        })
        .await;
        observe("transfer", started, &result);

        if result.is_ok() {
            metrics::counter!("ledger_transfers_total").increment(1);
        }
        result
    }

    /// Returns the current balance of an account.
    pub async fn balance(&self, account: AccountId) -> Result<Tokens, EngineError> {
        Ok(self.store.balance_of(account).await?)
    }

    /// Returns the journal of an account, oldest first.
    pub async fn history(&self, account: AccountId) -> Result<Vec<LedgerEntry>, EngineError> {
        self.store.require_account(account).await?;
        Ok(self.store.entries_for_account(account).await?)
    }
}
