use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{AccountId, KermesseId, LotId, StandId, Tokens};
use domain::{
    Account, CreditEvent, CreditOutcome, EntityKind, EntryKind, ExternalCredit, Kermesse,
    LedgerEntry, LedgerError, Lot, PurchaseReceipt, Stand, Ticket, TicketBatch, TransferReceipt,
    settle_purchase, settle_ticket_purchase, settle_transfer,
};

use crate::{
    Result, StoreError,
    locks::EntityTable,
    store::{Award, LedgerStore},
};

/// An account and its own journal, locked together.
#[derive(Debug)]
struct AccountRow {
    account: Account,
    journal: Vec<LedgerEntry>,
}

/// A kermesse with the tickets sold for it and the accounts that already won.
struct KermesseRow {
    kermesse: Kermesse,
    tickets: Vec<Ticket>,
    winners: HashSet<AccountId>,
}

struct Tables {
    accounts: EntityTable<AccountId, AccountRow>,
    stands: EntityTable<StandId, Stand>,
    kermesses: EntityTable<KermesseId, KermesseRow>,
    lots: EntityTable<LotId, Lot>,
    // One slot per event id; an empty slot is an event seen but never applied.
    credit_events: EntityTable<String, Option<CreditEvent>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            accounts: EntityTable::new(EntityKind::Account),
            stands: EntityTable::new(EntityKind::Stand),
            kermesses: EntityTable::new(EntityKind::Kermesse),
            lots: EntityTable::new(EntityKind::Lot),
            credit_events: EntityTable::new(EntityKind::CreditEvent),
        }
    }
}

/// In-memory ledger store.
///
/// Each account, stand, kermesse, lot and credit event id sits behind its own
/// async mutex; journals live with their account and tickets with their
/// kermesse, so operations on unrelated entities never wait on each other.
/// Operations take every lock they need before changing anything, so a
/// dropped future never leaves a half-applied operation behind.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<Tables>,
    lock_timeout: Option<Duration>,
}

impl InMemoryLedgerStore {
    /// Creates a new empty in-memory ledger store whose lock waits are unbounded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds every lock wait; a longer wait fails with a transient conflict.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Returns the total number of journal entries across all accounts.
    pub async fn entry_count(&self) -> usize {
        self.inner
            .accounts
            .filter_map(|row| Some(row.journal.len()))
            .await
            .into_iter()
            .sum()
    }

    /// Returns the number of tickets issued for a kermesse.
    pub async fn ticket_count(&self, kermesse: KermesseId) -> usize {
        self.inner
            .kermesses
            .view(&kermesse, |row| row.tickets.len())
            .await
            .unwrap_or(0)
    }

    async fn ensure_kermesse(&self, id: KermesseId) -> Result<()> {
        if self.inner.kermesses.contains(&id).await {
            Ok(())
        } else {
            Err(LedgerError::unknown(EntityKind::Kermesse, id).into())
        }
    }

    async fn recorded_credit(&self, event_id: &str) -> Result<Option<CreditEvent>> {
        let slot = self
            .inner
            .credit_events
            .lock(event_id.to_string(), self.lock_timeout)
            .await;
        match slot {
            Ok(slot) => Ok(slot.clone()),
            Err(StoreError::Rejected(LedgerError::UnknownEntity { .. })) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn already_exists(kind: EntityKind, id: impl std::fmt::Display) -> StoreError {
    StoreError::AlreadyExists {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn open_account(&self, account: Account) -> Result<()> {
        let id = account.id();
        let row = AccountRow {
            account,
            journal: Vec::new(),
        };
        if !self.inner.accounts.insert(id, row).await {
            return Err(already_exists(EntityKind::Account, id));
        }
        Ok(())
    }

    async fn register_kermesse(&self, kermesse: Kermesse) -> Result<()> {
        let id = kermesse.id();
        let row = KermesseRow {
            kermesse,
            tickets: Vec::new(),
            winners: HashSet::new(),
        };
        if !self.inner.kermesses.insert(id, row).await {
            return Err(already_exists(EntityKind::Kermesse, id));
        }
        Ok(())
    }

    async fn register_stand(&self, stand: Stand) -> Result<()> {
        self.ensure_kermesse(stand.kermesse()).await?;
        let id = stand.id();
        if !self.inner.stands.insert(id, stand).await {
            return Err(already_exists(EntityKind::Stand, id));
        }
        Ok(())
    }

    async fn register_lot(&self, lot: Lot) -> Result<()> {
        self.ensure_kermesse(lot.kermesse()).await?;
        let id = lot.id();
        if !self.inner.lots.insert(id, lot).await {
            return Err(already_exists(EntityKind::Lot, id));
        }
        Ok(())
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self
            .inner
            .accounts
            .view(&id, |row| row.account.clone())
            .await)
    }

    async fn get_stand(&self, id: StandId) -> Result<Option<Stand>> {
        Ok(self.inner.stands.get(&id).await)
    }

    async fn get_kermesse(&self, id: KermesseId) -> Result<Option<Kermesse>> {
        Ok(self
            .inner
            .kermesses
            .view(&id, |row| row.kermesse.clone())
            .await)
    }

    async fn get_lot(&self, id: LotId) -> Result<Option<Lot>> {
        Ok(self.inner.lots.get(&id).await)
    }

    async fn lots_for_kermesse(&self, kermesse: KermesseId) -> Result<Vec<Lot>> {
        let mut lots = self
            .inner
            .lots
            .filter_map(|lot| (lot.kermesse() == kermesse).then(|| lot.clone()))
            .await;
        lots.sort_by(|a, b| a.name().cmp(b.name()).then(a.id().cmp(&b.id())));
        Ok(lots)
    }

    async fn tickets_for_kermesse(&self, kermesse: KermesseId) -> Result<Vec<Ticket>> {
        Ok(self
            .inner
            .kermesses
            .view(&kermesse, |row| row.tickets.clone())
            .await
            .unwrap_or_default())
    }

    async fn get_credit_event(&self, event_id: &str) -> Result<Option<CreditEvent>> {
        self.recorded_credit(event_id).await
    }

    async fn entries_for_account(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .inner
            .accounts
            .view(&account, |row| row.journal.clone())
            .await
            .unwrap_or_default())
    }

    async fn credit(&self, account: AccountId, amount: Tokens, kind: EntryKind) -> Result<Tokens> {
        let mut row = self.inner.accounts.lock(account, self.lock_timeout).await?;

        let balance = row.account.credit(amount)?;
        row.journal
            .push(LedgerEntry::credit(account, amount, kind, balance, Utc::now()));
        Ok(balance)
    }

    async fn debit(&self, account: AccountId, amount: Tokens, kind: EntryKind) -> Result<Tokens> {
        let mut row = self.inner.accounts.lock(account, self.lock_timeout).await?;

        let balance = row.account.debit(amount)?;
        row.journal
            .push(LedgerEntry::debit(account, amount, kind, balance, Utc::now()));
        Ok(balance)
    }

    async fn reserve_stock(&self, stand: StandId, quantity: u32) -> Result<u32> {
        let mut stand = self.inner.stands.lock(stand, self.lock_timeout).await?;
        Ok(stand.reserve(quantity)?)
    }

    async fn purchase(
        &self,
        account: AccountId,
        stand: StandId,
        quantity: u32,
    ) -> Result<PurchaseReceipt> {
        let mut row = self.inner.accounts.lock(account, self.lock_timeout).await?;
        let mut stand_row = self.inner.stands.lock(stand, self.lock_timeout).await?;

        let receipt = settle_purchase(&mut row.account, &mut stand_row, quantity)?;
        if !receipt.total_cost.is_zero() {
            row.journal.push(LedgerEntry::debit(
                account,
                receipt.total_cost,
                EntryKind::Purchase { stand, quantity },
                receipt.new_balance,
                Utc::now(),
            ));
        }
        Ok(receipt)
    }

    async fn issue_tickets(
        &self,
        account: AccountId,
        kermesse: KermesseId,
        quantity: u32,
        ticket_price: Tokens,
    ) -> Result<TicketBatch> {
        self.ensure_kermesse(kermesse).await?;

        let mut row = self.inner.accounts.lock(account, self.lock_timeout).await?;
        let mut fair = self
            .inner
            .kermesses
            .lock(kermesse, self.lock_timeout)
            .await?;

        let now = Utc::now();
        let batch = settle_ticket_purchase(&mut row.account, kermesse, quantity, ticket_price, now)?;
        if !batch.total_cost.is_zero() {
            row.journal.push(LedgerEntry::debit(
                account,
                batch.total_cost,
                EntryKind::TicketPurchase { kermesse, quantity },
                batch.new_balance,
                now,
            ));
        }
        fair.tickets.extend(batch.tickets.iter().cloned());
        Ok(batch)
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Tokens,
    ) -> Result<TransferReceipt> {
        if from == to {
            return Err(LedgerError::InvalidTransfer { account: from }.into());
        }

        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let mut first = self.inner.accounts.lock(first, self.lock_timeout).await?;
        let mut second = self.inner.accounts.lock(second, self.lock_timeout).await?;

        let (sender, recipient) = if first.account.id() == from {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };
        let receipt = settle_transfer(&mut sender.account, &mut recipient.account, amount)?;

        let now = Utc::now();
        sender.journal.push(LedgerEntry::debit(
            from,
            amount,
            EntryKind::TransferOut { to },
            receipt.from_balance,
            now,
        ));
        recipient.journal.push(LedgerEntry::credit(
            to,
            amount,
            EntryKind::TransferIn { from },
            receipt.to_balance,
            now,
        ));
        Ok(receipt)
    }

    async fn award_lot(&self, award: Award) -> Result<Lot> {
        award.ensure_ticket_matches()?;

        // The kermesse row carries the winner set, so awards serialize per
        // kermesse and two exclusive lots cannot both go to the same account.
        let mut fair = self
            .inner
            .kermesses
            .lock(award.kermesse, self.lock_timeout)
            .await?;
        let mut lot = self.inner.lots.lock(award.lot, self.lock_timeout).await?;

        if lot.kermesse() != award.kermesse {
            return Err(LedgerError::unknown(EntityKind::Lot, award.lot).into());
        }
        lot.ensure_undrawn()?;

        let winner = award.ticket.account;
        if award.exclusive && fair.winners.contains(&winner) {
            return Err(StoreError::conflict(
                format!("kermesse {}", award.kermesse),
                format!("account {winner} already won a lot"),
            ));
        }

        lot.award(&award.ticket, Utc::now())?;
        fair.winners.insert(winner);
        Ok(lot.clone())
    }

    async fn apply_external_credit(&self, credit: ExternalCredit) -> Result<CreditOutcome> {
        credit.validate()?;
        if let Some(event) = self.recorded_credit(&credit.event_id).await? {
            return Ok(CreditOutcome::replayed(event));
        }

        let mut row = self
            .inner
            .accounts
            .lock(credit.account, self.lock_timeout)
            .await?;
        let mut slot = self
            .inner
            .credit_events
            .lock_or_insert_with(credit.event_id.clone(), || None, self.lock_timeout)
            .await?;

        // A concurrent delivery may have been recorded while we waited.
        if let Some(event) = slot.as_ref() {
            return Ok(CreditOutcome::replayed(event.clone()));
        }

        let now = Utc::now();
        let balance = row.account.credit(credit.amount)?;
        let event = CreditEvent::record(&credit, balance, now);
        *slot = Some(event.clone());
        row.journal.push(LedgerEntry::credit(
            credit.account,
            credit.amount,
            EntryKind::ExternalCredit {
                event_id: credit.event_id.clone(),
            },
            balance,
            now,
        ));
        Ok(CreditOutcome::applied(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LedgerStoreExt;
    use domain::StandKind;

    struct Fixture {
        store: InMemoryLedgerStore,
        account: AccountId,
        kermesse: KermesseId,
        stand: StandId,
    }

    async fn fixture(balance: u64, stock: u32, price: u64) -> Fixture {
        let store = InMemoryLedgerStore::new();
        let kermesse = Kermesse::new(KermesseId::new(), "Spring fair");
        let account = Account::new(AccountId::new(), "Alice", Tokens::new(balance));
        let stand = Stand::new(
            StandId::new(),
            kermesse.id(),
            "Crêpes",
            StandKind::Food,
            stock,
            Tokens::new(price),
        );

        let fixture = Fixture {
            store: store.clone(),
            account: account.id(),
            kermesse: kermesse.id(),
            stand: stand.id(),
        };
        store.register_kermesse(kermesse).await.unwrap();
        store.open_account(account).await.unwrap();
        store.register_stand(stand).await.unwrap();
        fixture
    }

    #[tokio::test]
    async fn open_account_twice_fails() {
        let store = InMemoryLedgerStore::new();
        let account = Account::open("Alice");
        store.open_account(account.clone()).await.unwrap();

        let err = store.open_account(account).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::AlreadyExists {
                kind: EntityKind::Account,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stand_requires_known_kermesse() {
        let store = InMemoryLedgerStore::new();
        let stand = Stand::new(
            StandId::new(),
            KermesseId::new(),
            "Darts",
            StandKind::Activity,
            1,
            Tokens::new(2),
        );

        let err = store.register_stand(stand).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::UnknownEntity {
                kind: EntityKind::Kermesse,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn credit_and_debit_are_journaled() {
        let f = fixture(0, 0, 0).await;

        let balance = f
            .store
            .credit(f.account, Tokens::new(30), EntryKind::TopUp)
            .await
            .unwrap();
        assert_eq!(balance, Tokens::new(30));

        let balance = f
            .store
            .debit(
                f.account,
                Tokens::new(10),
                EntryKind::Purchase {
                    stand: f.stand,
                    quantity: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(balance, Tokens::new(20));

        let entries = f.store.entries_for_account(f.account).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].balance_after, Tokens::new(20));
    }

    #[tokio::test]
    async fn reserve_stock_never_goes_negative() {
        let f = fixture(0, 3, 2).await;

        assert_eq!(f.store.reserve_stock(f.stand, 2).await.unwrap(), 1);
        let err = f.store.reserve_stock(f.stand, 2).await.unwrap_err();

        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::InsufficientStock { .. })
        ));
        assert_eq!(f.store.get_stand(f.stand).await.unwrap().unwrap().stock(), 1);
    }

    #[tokio::test]
    async fn failed_debit_leaves_no_trace() {
        let f = fixture(5, 0, 0).await;

        let err = f
            .store
            .debit(
                f.account,
                Tokens::new(6),
                EntryKind::Purchase {
                    stand: f.stand,
                    quantity: 1,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::InsufficientFunds { .. })
        ));
        assert_eq!(f.store.balance_of(f.account).await.unwrap(), Tokens::new(5));
        assert_eq!(f.store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn purchase_then_out_of_stock() {
        let f = fixture(20, 3, 5).await;

        let receipt = f.store.purchase(f.account, f.stand, 3).await.unwrap();
        assert_eq!(receipt.new_balance, Tokens::new(5));
        assert_eq!(receipt.new_stock, 0);

        let err = f.store.purchase(f.account, f.stand, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::InsufficientStock { .. })
        ));
        assert_eq!(f.store.balance_of(f.account).await.unwrap(), Tokens::new(5));
        assert_eq!(f.store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn purchase_at_unknown_stand_is_rejected() {
        let f = fixture(20, 3, 5).await;

        let err = f
            .store
            .purchase(f.account, StandId::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::UnknownEntity {
                kind: EntityKind::Stand,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn tickets_require_funds() {
        let f = fixture(7, 0, 0).await;

        let batch = f
            .store
            .issue_tickets(f.account, f.kermesse, 1, Tokens::new(5))
            .await
            .unwrap();
        assert_eq!(batch.tickets.len(), 1);

        let err = f
            .store
            .issue_tickets(f.account, f.kermesse, 1, Tokens::new(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::InsufficientFunds { .. })
        ));
        assert_eq!(f.store.ticket_count(f.kermesse).await, 1);
    }

    #[tokio::test]
    async fn transfer_to_self_is_rejected_before_locking() {
        let f = fixture(10, 0, 0).await;
        let err = f
            .store
            .transfer(f.account, f.account, Tokens::new(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::InvalidTransfer { .. })
        ));
    }

    #[tokio::test]
    async fn transfer_journals_both_sides() {
        let f = fixture(10, 0, 0).await;
        let child = Account::open("Child");
        let child_id = child.id();
        f.store.open_account(child).await.unwrap();

        let receipt = f
            .store
            .transfer(f.account, child_id, Tokens::new(4))
            .await
            .unwrap();

        assert_eq!(receipt.from_balance, Tokens::new(6));
        assert_eq!(receipt.to_balance, Tokens::new(4));
        let child_entries = f.store.entries_for_account(child_id).await.unwrap();
        assert_eq!(
            child_entries[0].kind,
            EntryKind::TransferIn { from: f.account }
        );
    }

    #[tokio::test]
    async fn award_is_one_way() {
        let f = fixture(10, 0, 0).await;
        let lot = Lot::new(LotId::new(), f.kermesse, "Bicycle");
        let lot_id = lot.id();
        f.store.register_lot(lot).await.unwrap();
        let batch = f
            .store
            .issue_tickets(f.account, f.kermesse, 2, Tokens::new(5))
            .await
            .unwrap();

        let drawn = f
            .store
            .award_lot(Award::new(lot_id, f.kermesse, batch.tickets[0].clone()))
            .await
            .unwrap();
        assert_eq!(drawn.winner(), Some(f.account));

        let err = f
            .store
            .award_lot(Award::new(lot_id, f.kermesse, batch.tickets[1].clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::LotAlreadyDrawn { .. })
        ));
        let lot = f.store.get_lot(lot_id).await.unwrap().unwrap();
        assert_eq!(lot.winning_ticket(), Some(batch.tickets[0].id));
    }

    #[tokio::test]
    async fn exclusive_award_conflicts_on_repeat_winner() {
        let f = fixture(10, 0, 0).await;
        let first = Lot::new(LotId::new(), f.kermesse, "Bicycle");
        let second = Lot::new(LotId::new(), f.kermesse, "Teddy bear");
        let (first_id, second_id) = (first.id(), second.id());
        f.store.register_lot(first).await.unwrap();
        f.store.register_lot(second).await.unwrap();
        let batch = f
            .store
            .issue_tickets(f.account, f.kermesse, 2, Tokens::new(5))
            .await
            .unwrap();

        f.store
            .award_lot(Award::new(first_id, f.kermesse, batch.tickets[0].clone()).exclusive(true))
            .await
            .unwrap();
        let err = f
            .store
            .award_lot(Award::new(second_id, f.kermesse, batch.tickets[1].clone()).exclusive(true))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(!f.store.get_lot(second_id).await.unwrap().unwrap().is_drawn());
    }

    #[tokio::test]
    async fn lot_of_another_kermesse_is_unknown() {
        let f = fixture(10, 0, 0).await;
        let other = Kermesse::new(KermesseId::new(), "Autumn fair");
        let other_id = other.id();
        f.store.register_kermesse(other).await.unwrap();
        let lot = Lot::new(LotId::new(), other_id, "Hamper");
        let lot_id = lot.id();
        f.store.register_lot(lot).await.unwrap();
        let batch = f
            .store
            .issue_tickets(f.account, f.kermesse, 1, Tokens::new(5))
            .await
            .unwrap();

        let err = f
            .store
            .award_lot(Award::new(lot_id, f.kermesse, batch.tickets[0].clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::UnknownEntity {
                kind: EntityKind::Lot,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn external_credit_is_applied_once() {
        let f = fixture(0, 0, 0).await;
        let credit = ExternalCredit::new("e1", f.account, Tokens::new(50));

        let first = f.store.apply_external_credit(credit.clone()).await.unwrap();
        let second = f.store.apply_external_credit(credit).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.event, first.event);
        assert_eq!(f.store.balance_of(f.account).await.unwrap(), Tokens::new(50));
        assert_eq!(f.store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn lock_timeout_surfaces_as_conflict() {
        let f = fixture(10, 0, 0).await;
        let store = f.store.clone().with_lock_timeout(Duration::from_millis(20));

        let _held = f
            .store
            .inner
            .accounts
            .lock(f.account, None)
            .await
            .unwrap();
        let err = store
            .credit(f.account, Tokens::new(1), EntryKind::TopUp)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    async fn second_customer(f: &Fixture) -> (AccountId, StandId) {
        let account = Account::new(AccountId::new(), "Bob", Tokens::new(10));
        let stand = Stand::new(
            StandId::new(),
            f.kermesse,
            "Lemonade",
            StandKind::Drink,
            5,
            Tokens::new(1),
        );
        let ids = (account.id(), stand.id());
        f.store.open_account(account).await.unwrap();
        f.store.register_stand(stand).await.unwrap();
        ids
    }

    #[tokio::test]
    async fn unrelated_purchase_proceeds_while_another_is_blocked() {
        let f = fixture(20, 3, 5).await;
        let (bob, lemonade) = second_customer(&f).await;
        let store = f.store.clone().with_lock_timeout(Duration::from_millis(50));

        let held = f.store.inner.stands.lock(f.stand, None).await.unwrap();
        let blocked = tokio::spawn({
            let store = f.store.clone();
            let (account, stand) = (f.account, f.stand);
            async move { store.purchase(account, stand, 1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let receipt = tokio::time::timeout(
            Duration::from_millis(500),
            store.purchase(bob, lemonade, 2),
        )
        .await
        .expect("purchase on other entities must not wait")
        .unwrap();
        assert_eq!(receipt.new_balance, Tokens::new(8));
        let batch = tokio::time::timeout(
            Duration::from_millis(500),
            store.issue_tickets(bob, f.kermesse, 1, Tokens::new(1)),
        )
        .await
        .expect("ticket sale must not wait on an unrelated purchase")
        .unwrap();
        assert_eq!(batch.new_balance, Tokens::new(7));

        drop(held);
        let receipt = blocked.await.unwrap().unwrap();
        assert_eq!(receipt.new_balance, Tokens::new(15));
        assert_eq!(f.store.entries_for_account(bob).await.unwrap().len(), 2);
        assert_eq!(f.store.entry_count().await, 3);
    }

    #[tokio::test]
    async fn cancelled_purchase_leaves_no_partial_effect() {
        let f = fixture(20, 3, 5).await;

        let held = f.store.inner.stands.lock(f.stand, None).await.unwrap();
        let pending = tokio::spawn({
            let store = f.store.clone();
            let (account, stand) = (f.account, f.stand);
            async move { store.purchase(account, stand, 1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The purchase holds the account and waits on the stand.
        let err = f
            .store
            .inner
            .accounts
            .lock(f.account, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        drop(held);

        let row = f
            .store
            .inner
            .accounts
            .lock(f.account, Some(Duration::from_millis(10)))
            .await;
        assert!(row.is_ok());
        drop(row);
        assert_eq!(f.store.balance_of(f.account).await.unwrap(), Tokens::new(20));
        assert_eq!(f.store.get_stand(f.stand).await.unwrap().unwrap().stock(), 3);
        assert_eq!(f.store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_credit_deliveries_contend_only_on_their_event() {
        let f = fixture(0, 0, 0).await;
        let store = f.store.clone().with_lock_timeout(Duration::from_millis(20));

        let held = f
            .store
            .inner
            .credit_events
            .lock_or_insert_with("e1".to_string(), || None, None)
            .await
            .unwrap();

        let other = store
            .apply_external_credit(ExternalCredit::new("e2", f.account, Tokens::new(5)))
            .await
            .unwrap();
        assert!(!other.duplicate);

        let err = store
            .apply_external_credit(ExternalCredit::new("e1", f.account, Tokens::new(5)))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        drop(held);
        let applied = store
            .apply_external_credit(ExternalCredit::new("e1", f.account, Tokens::new(5)))
            .await
            .unwrap();
        assert_eq!(applied.event.balance_after, Tokens::new(10));
    }
}
