use async_trait::async_trait;
use common::{AccountId, KermesseId, LotId, StandId, Tokens};
use domain::{
    Account, CreditEvent, CreditOutcome, EntityKind, EntryKind, ExternalCredit, Kermesse,
    LedgerEntry, LedgerError, Lot, PurchaseReceipt, Stand, Ticket, TicketBatch, TransferReceipt,
};

use crate::Result;

/// A request to assign a winning ticket to a lot.
#[derive(Debug, Clone)]
pub struct Award {
    pub lot: LotId,
    pub kermesse: KermesseId,
    pub ticket: Ticket,
    /// When set, the award is refused with a transient conflict if the
    /// ticket's owner already won another lot of the same kermesse.
    pub exclusive: bool,
}

impl Award {
    /// Creates an award that allows an account to win several lots.
    pub fn new(lot: LotId, kermesse: KermesseId, ticket: Ticket) -> Self {
        Self {
            lot,
            kermesse,
            ticket,
            exclusive: false,
        }
    }

    /// Refuses the award if the winner already holds a lot in the kermesse.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub(crate) fn ensure_ticket_matches(&self) -> std::result::Result<(), LedgerError> {
        if self.ticket.kermesse != self.kermesse {
            return Err(LedgerError::unknown(EntityKind::Kermesse, self.kermesse));
        }
        Ok(())
    }
}

/// Core trait for ledger store implementations.
///
/// Every mutating method is one unit of work: it either commits all of its
/// effects (balance, stock, tickets, winner, credit log, journal) or none of
/// them. Implementations must be thread-safe (Send + Sync) and must acquire
/// entity locks in the order accounts (ascending id), stand, kermesse, lot.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates an account. Fails with `AlreadyExists` if the id is taken.
    async fn open_account(&self, account: Account) -> Result<()>;

    /// Creates a kermesse.
    async fn register_kermesse(&self, kermesse: Kermesse) -> Result<()>;

    /// Creates a stand. The stand's kermesse must exist.
    async fn register_stand(&self, stand: Stand) -> Result<()>;

    /// Creates an undrawn lot. The lot's kermesse must exist.
    async fn register_lot(&self, lot: Lot) -> Result<()>;

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;

    async fn get_stand(&self, id: StandId) -> Result<Option<Stand>>;

    async fn get_kermesse(&self, id: KermesseId) -> Result<Option<Kermesse>>;

    async fn get_lot(&self, id: LotId) -> Result<Option<Lot>>;

    /// Lists the lots of a kermesse.
    async fn lots_for_kermesse(&self, kermesse: KermesseId) -> Result<Vec<Lot>>;

    /// Lists every ticket issued for a kermesse, in issue order.
    async fn tickets_for_kermesse(&self, kermesse: KermesseId) -> Result<Vec<Ticket>>;

    /// Looks up a processed external credit by its event id.
    async fn get_credit_event(&self, event_id: &str) -> Result<Option<CreditEvent>>;

    /// Returns the journal of an account, oldest first.
    async fn entries_for_account(&self, account: AccountId) -> Result<Vec<LedgerEntry>>;

    /// Increases a balance and journals the movement. Returns the new balance.
    async fn credit(&self, account: AccountId, amount: Tokens, kind: EntryKind) -> Result<Tokens>;

    /// Decreases a balance only if it covers `amount`. Returns the new balance.
    async fn debit(&self, account: AccountId, amount: Tokens, kind: EntryKind) -> Result<Tokens>;

    /// Decreases stock only if it covers `quantity`. Returns the remaining stock.
    async fn reserve_stock(&self, stand: StandId, quantity: u32) -> Result<u32>;

    /// Debits the account and reserves the stand's stock in one unit of work.
    async fn purchase(
        &self,
        account: AccountId,
        stand: StandId,
        quantity: u32,
    ) -> Result<PurchaseReceipt>;

    /// Debits the account and appends `quantity` tickets in one unit of work.
    async fn issue_tickets(
        &self,
        account: AccountId,
        kermesse: KermesseId,
        quantity: u32,
        ticket_price: Tokens,
    ) -> Result<TicketBatch>;

    /// Moves tokens between two accounts in one unit of work.
    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Tokens,
    ) -> Result<TransferReceipt>;

    /// Sets the winner of an undrawn lot. Returns the drawn lot.
    async fn award_lot(&self, award: Award) -> Result<Lot>;

    /// Credits the account for an external payment exactly once per event id.
    ///
    /// A replayed event id returns the recorded outcome flagged as duplicate
    /// and changes nothing.
    async fn apply_external_credit(&self, credit: ExternalCredit) -> Result<CreditOutcome>;
}

/// Extension trait providing convenience methods for ledger stores.
#[async_trait]
pub trait LedgerStoreExt: LedgerStore {
    /// Loads an account or reports it as unknown.
    async fn require_account(&self, id: AccountId) -> Result<Account> {
        self.get_account(id)
            .await?
            .ok_or_else(|| LedgerError::unknown(EntityKind::Account, id).into())
    }

    /// Loads a kermesse or reports it as unknown.
    async fn require_kermesse(&self, id: KermesseId) -> Result<Kermesse> {
        self.get_kermesse(id)
            .await?
            .ok_or_else(|| LedgerError::unknown(EntityKind::Kermesse, id).into())
    }

    /// Loads a lot of the given kermesse. A lot that exists but belongs to
    /// another kermesse is reported as unknown.
    async fn require_lot(&self, kermesse: KermesseId, id: LotId) -> Result<Lot> {
        match self.get_lot(id).await? {
            Some(lot) if lot.kermesse() == kermesse => Ok(lot),
            _ => Err(LedgerError::unknown(EntityKind::Lot, id).into()),
        }
    }

    /// Returns the current balance of an account.
    async fn balance_of(&self, id: AccountId) -> Result<Tokens> {
        Ok(self.require_account(id).await?.balance())
    }
}

impl<T: LedgerStore + ?Sized> LedgerStoreExt for T {}
