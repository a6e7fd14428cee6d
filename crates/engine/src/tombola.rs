//! Tombola engine: ticket sales and lot draws.

use std::collections::HashSet;
use std::time::Instant;

use common::{AccountId, KermesseId, LotId, TicketId, Tokens};
use domain::{LedgerError, Lot, TicketBatch};
use ledger_store::{Award, LedgerStore, LedgerStoreExt, StoreError};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::random::{RandomSource, SeededRandom};
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::telemetry::observe;

/// Result of a successful draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawOutcome {
    pub lot: LotId,
    pub kermesse: KermesseId,
    pub winner: AccountId,
    pub ticket: TicketId,
    /// Number of tickets the winner was drawn from.
    pub candidates: usize,
}

/// Sells tombola tickets and draws lot winners.
pub struct TombolaEngine<S: LedgerStore, R: RandomSource = SeededRandom> {
    store: S,
    random: R,
    ticket_price: Tokens,
    exclude_previous_winners: bool,
    retry: RetryPolicy,
}

impl<S: LedgerStore> TombolaEngine<S, SeededRandom> {
    /// Creates an engine whose randomness follows `config.draw_seed`.
    pub fn from_config(store: S, config: &EngineConfig) -> Self {
        Self::new(
            store,
            SeededRandom::from_optional_seed(config.draw_seed),
            config,
        )
    }
}

impl<S: LedgerStore, R: RandomSource> TombolaEngine<S, R> {
    /// Creates a new tombola engine with an explicit random source.
    pub fn new(store: S, random: R, config: &EngineConfig) -> Self {
        Self {
            store,
            random,
            ticket_price: config.ticket_price,
            exclude_previous_winners: config.exclude_previous_winners,
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

    /// Price of a single ticket.
    pub fn ticket_price(&self) -> Tokens {
        self.ticket_price
    }

    /// Buys `quantity` tickets for the kermesse's draws.
    ///
    /// If the debit fails no ticket is issued.
    #[tracing::instrument(skip(self))]
    pub async fn buy_tickets(
        &self,
        account: AccountId,
        kermesse: KermesseId,
        quantity: u32,
    ) -> Result<TicketBatch, EngineError> {
        let started = Instant::now();
        let result = retry_on_conflict(&self.retry, "buy_tickets", || {
            self.store
                .issue_tickets(account, kermesse, quantity, self.ticket_price)
        })
        .await;
        observe("buy_tickets", started, &result);

        if let Ok(batch) = &result {
            metrics::counter!("ledger_tickets_sold_total").increment(u64::from(quantity));
            tracing::info!(
                total_cost = batch.total_cost.amount(),
                new_balance = batch.new_balance.amount(),
                "tickets issued"
            );
        }
        result
    }

    /// Draws the winner of a lot among the kermesse's tickets.
    ///
    /// Every ticket has the same chance, so an account's odds grow with the
    /// number of tickets it holds. When previous winners are excluded and a
    /// concurrent draw awards the picked account first, the draw is repeated
    /// against the updated candidate set.
    #[tracing::instrument(skip(self))]
    pub async fn draw_winner(
        &self,
        kermesse: KermesseId,
        lot: LotId,
    ) -> Result<DrawOutcome, EngineError> {
        let started = Instant::now();
        let result =
            retry_on_conflict(&self.retry, "draw_winner", || self.try_draw(kermesse, lot)).await;
        observe("draw_winner", started, &result);

        if let Ok(outcome) = &result {
            metrics::counter!("ledger_draws_total").increment(1);
            tracing::info!(
                winner = %outcome.winner,
                ticket = %outcome.ticket,
                candidates = outcome.candidates,
                "lot drawn"
            );
        }
        result
    }

    /// Lists the lots of a kermesse with their draw state.
    pub async fn lots(&self, kermesse: KermesseId) -> Result<Vec<Lot>, EngineError> {
        self.store.require_kermesse(kermesse).await?;
        Ok(self.store.lots_for_kermesse(kermesse).await?)
    }

    async fn try_draw(&self, kermesse: KermesseId, lot: LotId) -> Result<DrawOutcome, StoreError> {
        self.store.require_kermesse(kermesse).await?;
        self.store.require_lot(kermesse, lot).await?.ensure_undrawn()?;

        let mut tickets = self.store.tickets_for_kermesse(kermesse).await?;
        if self.exclude_previous_winners {
            let previous: HashSet<AccountId> = self
                .store
                .lots_for_kermesse(kermesse)
                .await?
                .iter()
                .filter_map(Lot::winner)
                .collect();
            tickets.retain(|ticket| !previous.contains(&ticket.account));
        }
        if tickets.is_empty() {
            return Err(LedgerError::NoTicketsAvailable { kermesse }.into());
        }

        let candidates = tickets.len();
        let ticket = tickets.swap_remove(self.random.pick(candidates));
        let award = Award::new(lot, kermesse, ticket.clone()).exclusive(self.exclude_previous_winners);
        self.store.award_lot(award).await?;

        Ok(DrawOutcome {
            lot,
            kermesse,
            winner: ticket.account,
            ticket: ticket.id,
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use domain::{Account, Kermesse};
    use ledger_store::InMemoryLedgerStore;

    use super::*;

    /// Always picks the same index.
    struct FixedPick(AtomicUsize);

    impl RandomSource for FixedPick {
        fn pick(&self, len: usize) -> usize {
            self.0.load(Ordering::SeqCst).min(len - 1)
        }
    }

    struct Setup {
        store: InMemoryLedgerStore,
        kermesse: KermesseId,
    }

    async fn setup() -> Setup {
        let store = InMemoryLedgerStore::new();
        let kermesse = Kermesse::new(KermesseId::new(), "Spring fair");
        let id = kermesse.id();
        store.register_kermesse(kermesse).await.unwrap();
        Setup {
            store,
            kermesse: id,
        }
    }

    impl Setup {
        async fn account(&self, name: &str, balance: u64) -> AccountId {
            let account = Account::new(AccountId::new(), name, Tokens::new(balance));
            let id = account.id();
            self.store.open_account(account).await.unwrap();
            id
        }

        async fn lot(&self, name: &str) -> LotId {
            let lot = Lot::new(LotId::new(), self.kermesse, name);
            let id = lot.id();
            self.store.register_lot(lot).await.unwrap();
            id
        }

        fn engine(&self, config: &EngineConfig) -> TombolaEngine<InMemoryLedgerStore> {
            TombolaEngine::new(self.store.clone(), SeededRandom::from_seed(3), config)
        }
    }

    #[tokio::test]
    async fn tickets_cost_the_configured_price() {
        let s = setup().await;
        let alice = s.account("Alice", 12).await;
        let engine = s.engine(&EngineConfig::default());

        let batch = engine.buy_tickets(alice, s.kermesse, 2).await.unwrap();
        assert_eq!(batch.tickets.len(), 2);
        assert_eq!(batch.total_cost, Tokens::new(10));
        assert_eq!(batch.new_balance, Tokens::new(2));

        let err = engine.buy_tickets(alice, s.kermesse, 1).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InsufficientFunds { .. })
        ));
        assert_eq!(s.store.ticket_count(s.kermesse).await, 2);
    }

    #[tokio::test]
    async fn tickets_for_unknown_kermesse_are_rejected() {
        let s = setup().await;
        let alice = s.account("Alice", 12).await;
        let engine = s.engine(&EngineConfig::default());

        let err = engine
            .buy_tickets(alice, KermesseId::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::UnknownEntity { .. })
        ));
    }

    #[tokio::test]
    async fn free_tickets_are_still_capped_per_purchase() {
        let s = setup().await;
        let alice = s.account("Alice", 0).await;
        let engine = s.engine(&EngineConfig {
            ticket_price: Tokens::zero(),
            ..EngineConfig::default()
        });

        let err = engine
            .buy_tickets(alice, s.kermesse, u32::MAX)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InvalidQuantity { quantity: u32::MAX })
        ));
        assert_eq!(s.store.ticket_count(s.kermesse).await, 0);
    }

    #[tokio::test]
    async fn draw_without_tickets_fails() {
        let s = setup().await;
        let lot = s.lot("Bicycle").await;
        let engine = s.engine(&EngineConfig::default());

        let err = engine.draw_winner(s.kermesse, lot).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::NoTicketsAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn injected_source_decides_the_winner() {
        let s = setup().await;
        let alice = s.account("Alice", 20).await;
        let bob = s.account("Bob", 20).await;
        let lot = s.lot("Bicycle").await;
        let config = EngineConfig::default();
        let seller = s.engine(&config);
        seller.buy_tickets(alice, s.kermesse, 1).await.unwrap();
        seller.buy_tickets(bob, s.kermesse, 1).await.unwrap();

        let engine = TombolaEngine::new(s.store.clone(), FixedPick(AtomicUsize::new(1)), &config);
        let outcome = engine.draw_winner(s.kermesse, lot).await.unwrap();

        assert_eq!(outcome.winner, bob);
        assert_eq!(outcome.candidates, 2);
    }

    #[tokio::test]
    async fn redraw_reports_existing_winner() {
        let s = setup().await;
        let alice = s.account("Alice", 20).await;
        let lot = s.lot("Bicycle").await;
        let engine = s.engine(&EngineConfig::default());
        engine.buy_tickets(alice, s.kermesse, 1).await.unwrap();

        let outcome = engine.draw_winner(s.kermesse, lot).await.unwrap();
        let err = engine.draw_winner(s.kermesse, lot).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::LotAlreadyDrawn { winner, .. }) if winner == outcome.winner
        ));
    }

    #[tokio::test]
    async fn lot_of_another_kermesse_is_unknown() {
        let s = setup().await;
        let alice = s.account("Alice", 20).await;
        let engine = s.engine(&EngineConfig::default());
        engine.buy_tickets(alice, s.kermesse, 1).await.unwrap();

        let other = Kermesse::new(KermesseId::new(), "Autumn fair");
        let other_id = other.id();
        s.store.register_kermesse(other).await.unwrap();
        let foreign = Lot::new(LotId::new(), other_id, "Hamper");
        let foreign_id = foreign.id();
        s.store.register_lot(foreign).await.unwrap();

        let err = engine.draw_winner(s.kermesse, foreign_id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::UnknownEntity { .. })
        ));
    }

    #[tokio::test]
    async fn accounts_may_win_several_lots_by_default() {
        let s = setup().await;
        let alice = s.account("Alice", 20).await;
        let first = s.lot("Bicycle").await;
        let second = s.lot("Hamper").await;
        let engine = s.engine(&EngineConfig::default());
        engine.buy_tickets(alice, s.kermesse, 1).await.unwrap();

        assert_eq!(engine.draw_winner(s.kermesse, first).await.unwrap().winner, alice);
        assert_eq!(engine.draw_winner(s.kermesse, second).await.unwrap().winner, alice);
    }

    #[tokio::test]
    async fn excluded_winners_leave_the_candidate_set() {
        let s = setup().await;
        let alice = s.account("Alice", 20).await;
        let bob = s.account("Bob", 20).await;
        let lots = [s.lot("A").await, s.lot("B").await, s.lot("C").await];
        let config = EngineConfig {
            exclude_previous_winners: true,
            ..EngineConfig::default()
        };
        let engine = s.engine(&config);
        engine.buy_tickets(alice, s.kermesse, 3).await.unwrap();
        engine.buy_tickets(bob, s.kermesse, 1).await.unwrap();

        let first = engine.draw_winner(s.kermesse, lots[0]).await.unwrap();
        let second = engine.draw_winner(s.kermesse, lots[1]).await.unwrap();
        assert_ne!(first.winner, second.winner);

        let err = engine.draw_winner(s.kermesse, lots[2]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::NoTicketsAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn lots_lists_draw_state() {
        let s = setup().await;
        let alice = s.account("Alice", 20).await;
        let drawn = s.lot("Bicycle").await;
        s.lot("Hamper").await;
        let engine = s.engine(&EngineConfig::default());
        engine.buy_tickets(alice, s.kermesse, 1).await.unwrap();
        engine.draw_winner(s.kermesse, drawn).await.unwrap();

        let lots = engine.lots(s.kermesse).await.unwrap();
        assert_eq!(lots.len(), 2);
        assert_eq!(lots[0].winner(), Some(alice));
        assert!(!lots[1].is_drawn());
    }
}
