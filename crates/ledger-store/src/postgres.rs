use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AccountId, EntryId, KermesseId, LotId, StandId, TicketId, Tokens};
use domain::{
    Account, CreditEvent, CreditOutcome, Direction, EntityKind, EntryKind, ExternalCredit,
    Kermesse, LedgerEntry, LedgerError, Lot, PurchaseReceipt, Stand, StandKind, Ticket,
    TicketBatch, TransferReceipt, settle_purchase, settle_ticket_purchase, settle_transfer,
};
use sqlx::{
    PgConnection, PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{Award, LedgerStore},
};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL-backed ledger store.
///
/// Each operation runs in one transaction and locks the rows it changes
/// with `SELECT ... FOR NO KEY UPDATE`, so concurrent writers on the same
/// account, stand or lot queue up instead of overwriting each other. A
/// future dropped before commit rolls its transaction back.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PostgresLedgerStore {
    /// Creates a new PostgreSQL ledger store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Connects a pool with at most `max_connections` connections.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Bounds row lock waits; a longer wait fails with a transient conflict.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        if let Some(timeout) = self.lock_timeout {
            sqlx::query(&format!(
                "SET LOCAL lock_timeout = '{}ms'",
                timeout.as_millis()
            ))
            .execute(&mut *tx)
            .await?;
        }
        Ok(tx)
    }

    async fn lock_account(conn: &mut PgConnection, id: AccountId) -> Result<Account> {
        let row = sqlx::query(
            "SELECT id, name, balance FROM accounts WHERE id = $1 FOR NO KEY UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| LedgerError::unknown(EntityKind::Account, id))?;
        row_to_account(&row)
    }

    async fn lock_stand(conn: &mut PgConnection, id: StandId) -> Result<Stand> {
        let row = sqlx::query(
            r#"
            SELECT id, kermesse_id, name, kind, stock, unit_price
            FROM stands
            WHERE id = $1
            FOR NO KEY UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| LedgerError::unknown(EntityKind::Stand, id))?;
        row_to_stand(&row)
    }

    async fn lock_lot(conn: &mut PgConnection, id: LotId) -> Result<Lot> {
        let row = sqlx::query(
            r#"
            SELECT id, kermesse_id, name, winner_id, winning_ticket_id, drawn_at
            FROM lots
            WHERE id = $1
            FOR NO KEY UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| LedgerError::unknown(EntityKind::Lot, id))?;
        row_to_lot(&row)
    }

    async fn ensure_kermesse(conn: &mut PgConnection, id: KermesseId, lock: bool) -> Result<()> {
        let sql = if lock {
            "SELECT id FROM kermesses WHERE id = $1 FOR NO KEY UPDATE"
        } else {
            "SELECT id FROM kermesses WHERE id = $1"
        };
        sqlx::query(sql)
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| LedgerError::unknown(EntityKind::Kermesse, id))?;
        Ok(())
    }

    async fn write_balance(conn: &mut PgConnection, id: AccountId, balance: Tokens) -> Result<()> {
        sqlx::query("UPDATE accounts SET balance = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(to_db(balance)?)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn write_stock(conn: &mut PgConnection, id: StandId, stock: u32) -> Result<()> {
        sqlx::query("UPDATE stands SET stock = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(i64::from(stock))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn append_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<()> {
        let details = serde_json::to_value(&entry.kind)?;
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, account_id, direction, amount, kind, details, balance_after, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.account.as_uuid())
        .bind(entry.direction.as_str())
        .bind(to_db(entry.amount)?)
        .bind(entry.kind.label())
        .bind(details)
        .bind(to_db(entry.balance_after)?)
        .bind(entry.recorded_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn apply_balance_change(
        &self,
        id: AccountId,
        amount: Tokens,
        kind: EntryKind,
        direction: Direction,
    ) -> Result<Tokens> {
        let mut tx = self.begin().await?;
        let mut account = Self::lock_account(&mut tx, id).await?;

        let now = Utc::now();
        let entry = match direction {
            Direction::Credit => {
                let balance = account.credit(amount)?;
                LedgerEntry::credit(id, amount, kind, balance, now)
            }
            Direction::Debit => {
                let balance = account.debit(amount)?;
                LedgerEntry::debit(id, amount, kind, balance, now)
            }
        };
        Self::write_balance(&mut tx, id, account.balance()).await?;
        Self::append_entry(&mut tx, &entry).await?;

        tx.commit().await?;
        Ok(account.balance())
    }

    async fn insert_seed(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        kind: EntityKind,
        id: impl std::fmt::Display,
        parent: Option<KermesseId>,
    ) -> Result<()> {
        query.execute(&self.pool).await.map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                match (db_err.code().as_deref(), parent) {
                    (Some(UNIQUE_VIOLATION), _) => {
                        return StoreError::AlreadyExists {
                            kind,
                            id: id.to_string(),
                        };
                    }
                    (Some(FOREIGN_KEY_VIOLATION), Some(kermesse)) => {
                        return LedgerError::unknown(EntityKind::Kermesse, kermesse).into();
                    }
                    _ => {}
                }
            }
            StoreError::from(e)
        })?;
        Ok(())
    }
}

fn tokens(value: i64, table: &'static str) -> Result<Tokens> {
    Tokens::from_i64(value).ok_or_else(|| StoreError::Corrupt {
        table,
        reason: format!("negative amount {value}"),
    })
}

fn to_db(amount: Tokens) -> Result<i64> {
    amount
        .to_i64()
        .ok_or_else(|| LedgerError::AmountOverflow.into())
}

fn row_to_account(row: &PgRow) -> Result<Account> {
    Ok(Account::new(
        AccountId::from_uuid(row.try_get::<Uuid, _>("id")?),
        row.try_get::<String, _>("name")?,
        tokens(row.try_get("balance")?, "accounts")?,
    ))
}

fn row_to_stand(row: &PgRow) -> Result<Stand> {
    let kind: String = row.try_get("kind")?;
    let kind = StandKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
        table: "stands",
        reason: format!("unknown stand kind {kind:?}"),
    })?;
    let stock: i64 = row.try_get("stock")?;
    let stock = u32::try_from(stock).map_err(|_| StoreError::Corrupt {
        table: "stands",
        reason: format!("stock {stock} out of range"),
    })?;

    Ok(Stand::new(
        StandId::from_uuid(row.try_get::<Uuid, _>("id")?),
        KermesseId::from_uuid(row.try_get::<Uuid, _>("kermesse_id")?),
        row.try_get::<String, _>("name")?,
        kind,
        stock,
        tokens(row.try_get("unit_price")?, "stands")?,
    ))
}

fn row_to_lot(row: &PgRow) -> Result<Lot> {
    Ok(Lot::restore(
        LotId::from_uuid(row.try_get::<Uuid, _>("id")?),
        KermesseId::from_uuid(row.try_get::<Uuid, _>("kermesse_id")?),
        row.try_get::<String, _>("name")?,
        row.try_get::<Option<Uuid>, _>("winner_id")?
            .map(AccountId::from_uuid),
        row.try_get::<Option<Uuid>, _>("winning_ticket_id")?
            .map(TicketId::from_uuid),
        row.try_get::<Option<DateTime<Utc>>, _>("drawn_at")?,
    ))
}

fn row_to_ticket(row: &PgRow) -> Result<Ticket> {
    Ok(Ticket {
        id: TicketId::from_uuid(row.try_get::<Uuid, _>("id")?),
        account: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
        kermesse: KermesseId::from_uuid(row.try_get::<Uuid, _>("kermesse_id")?),
        issued_at: row.try_get("issued_at")?,
    })
}

fn row_to_credit_event(row: &PgRow) -> Result<CreditEvent> {
    Ok(CreditEvent {
        event_id: row.try_get("event_id")?,
        account: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
        amount: tokens(row.try_get("amount")?, "credit_events")?,
        balance_after: tokens(row.try_get("balance_after")?, "credit_events")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry> {
    let direction: String = row.try_get("direction")?;
    let direction = Direction::parse(&direction).ok_or_else(|| StoreError::Corrupt {
        table: "ledger_entries",
        reason: format!("unknown direction {direction:?}"),
    })?;
    let details: serde_json::Value = row.try_get("details")?;

    Ok(LedgerEntry {
        id: EntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
        account: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
        direction,
        amount: tokens(row.try_get("amount")?, "ledger_entries")?,
        kind: serde_json::from_value(details)?,
        balance_after: tokens(row.try_get("balance_after")?, "ledger_entries")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

const SELECT_CREDIT_EVENT: &str =
    "SELECT event_id, account_id, amount, balance_after, processed_at FROM credit_events WHERE event_id = $1";

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn open_account(&self, account: Account) -> Result<()> {
        let query = sqlx::query("INSERT INTO accounts (id, name, balance) VALUES ($1, $2, $3)")
            .bind(account.id().as_uuid())
            .bind(account.name().to_string())
            .bind(to_db(account.balance())?);
        self.insert_seed(query, EntityKind::Account, account.id(), None)
            .await
    }

    async fn register_kermesse(&self, kermesse: Kermesse) -> Result<()> {
        let query = sqlx::query("INSERT INTO kermesses (id, name) VALUES ($1, $2)")
            .bind(kermesse.id().as_uuid())
            .bind(kermesse.name().to_string());
        self.insert_seed(query, EntityKind::Kermesse, kermesse.id(), None)
            .await
    }

    async fn register_stand(&self, stand: Stand) -> Result<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO stands (id, kermesse_id, name, kind, stock, unit_price)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(stand.id().as_uuid())
        .bind(stand.kermesse().as_uuid())
        .bind(stand.name().to_string())
        .bind(stand.kind().as_str())
        .bind(i64::from(stand.stock()))
        .bind(to_db(stand.unit_price())?);
        self.insert_seed(query, EntityKind::Stand, stand.id(), Some(stand.kermesse()))
            .await
    }

    async fn register_lot(&self, lot: Lot) -> Result<()> {
        let query = sqlx::query("INSERT INTO lots (id, kermesse_id, name) VALUES ($1, $2, $3)")
            .bind(lot.id().as_uuid())
            .bind(lot.kermesse().as_uuid())
            .bind(lot.name().to_string());
        self.insert_seed(query, EntityKind::Lot, lot.id(), Some(lot.kermesse()))
            .await
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        sqlx::query("SELECT id, name, balance FROM accounts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_account(&row))
            .transpose()
    }

    async fn get_stand(&self, id: StandId) -> Result<Option<Stand>> {
        sqlx::query(
            "SELECT id, kermesse_id, name, kind, stock, unit_price FROM stands WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_stand(&row))
        .transpose()
    }

    async fn get_kermesse(&self, id: KermesseId) -> Result<Option<Kermesse>> {
        let row = sqlx::query("SELECT id, name FROM kermesses WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Kermesse::new(
                KermesseId::from_uuid(row.try_get::<Uuid, _>("id")?),
                row.try_get::<String, _>("name")?,
            ))),
            None => Ok(None),
        }
    }

    async fn get_lot(&self, id: LotId) -> Result<Option<Lot>> {
        sqlx::query(
            r#"
            SELECT id, kermesse_id, name, winner_id, winning_ticket_id, drawn_at
            FROM lots
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_lot(&row))
        .transpose()
    }

    async fn lots_for_kermesse(&self, kermesse: KermesseId) -> Result<Vec<Lot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kermesse_id, name, winner_id, winning_ticket_id, drawn_at
            FROM lots
            WHERE kermesse_id = $1
            ORDER BY name ASC, id ASC
            "#,
        )
        .bind(kermesse.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_lot).collect()
    }

    async fn tickets_for_kermesse(&self, kermesse: KermesseId) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, kermesse_id, issued_at
            FROM tickets
            WHERE kermesse_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(kermesse.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_ticket).collect()
    }

    async fn get_credit_event(&self, event_id: &str) -> Result<Option<CreditEvent>> {
        sqlx::query(SELECT_CREDIT_EVENT)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_credit_event(&row))
            .transpose()
    }

    async fn entries_for_account(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, direction, amount, details, balance_after, recorded_at
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(account.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn credit(&self, account: AccountId, amount: Tokens, kind: EntryKind) -> Result<Tokens> {
        self.apply_balance_change(account, amount, kind, Direction::Credit)
            .await
    }

    async fn debit(&self, account: AccountId, amount: Tokens, kind: EntryKind) -> Result<Tokens> {
        self.apply_balance_change(account, amount, kind, Direction::Debit)
            .await
    }

    async fn reserve_stock(&self, stand: StandId, quantity: u32) -> Result<u32> {
        let mut tx = self.begin().await?;
        let mut row = Self::lock_stand(&mut tx, stand).await?;

        let remaining = row.reserve(quantity)?;
        Self::write_stock(&mut tx, stand, remaining).await?;

        tx.commit().await?;
        Ok(remaining)
    }

    async fn purchase(
        &self,
        account: AccountId,
        stand: StandId,
        quantity: u32,
    ) -> Result<PurchaseReceipt> {
        let mut tx = self.begin().await?;
        let mut acct = Self::lock_account(&mut tx, account).await?;
        let mut stand_row = Self::lock_stand(&mut tx, stand).await?;

        let receipt = settle_purchase(&mut acct, &mut stand_row, quantity)?;
        if !receipt.total_cost.is_zero() {
            Self::write_balance(&mut tx, account, receipt.new_balance).await?;
            let entry = LedgerEntry::debit(
                account,
                receipt.total_cost,
                EntryKind::Purchase { stand, quantity },
                receipt.new_balance,
                Utc::now(),
            );
            Self::append_entry(&mut tx, &entry).await?;
        }
        Self::write_stock(&mut tx, stand, receipt.new_stock).await?;

        tx.commit().await?;
        Ok(receipt)
    }

    async fn issue_tickets(
        &self,
        account: AccountId,
        kermesse: KermesseId,
        quantity: u32,
        ticket_price: Tokens,
    ) -> Result<TicketBatch> {
        let mut tx = self.begin().await?;
        Self::ensure_kermesse(&mut tx, kermesse, false).await?;
        let mut acct = Self::lock_account(&mut tx, account).await?;

        let now = Utc::now();
        let batch = settle_ticket_purchase(&mut acct, kermesse, quantity, ticket_price, now)?;
        if !batch.total_cost.is_zero() {
            Self::write_balance(&mut tx, account, batch.new_balance).await?;
            let entry = LedgerEntry::debit(
                account,
                batch.total_cost,
                EntryKind::TicketPurchase { kermesse, quantity },
                batch.new_balance,
                now,
            );
            Self::append_entry(&mut tx, &entry).await?;
        }
        for ticket in &batch.tickets {
            sqlx::query(
                "INSERT INTO tickets (id, account_id, kermesse_id, issued_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(ticket.id.as_uuid())
            .bind(ticket.account.as_uuid())
            .bind(ticket.kermesse.as_uuid())
            .bind(ticket.issued_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
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

        let mut tx = self.begin().await?;
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let first = Self::lock_account(&mut tx, first).await?;
        let second = Self::lock_account(&mut tx, second).await?;
        let (mut sender, mut recipient) = if first.id() == from {
            (first, second)
        } else {
            (second, first)
        };

        let receipt = settle_transfer(&mut sender, &mut recipient, amount)?;
        Self::write_balance(&mut tx, from, receipt.from_balance).await?;
        Self::write_balance(&mut tx, to, receipt.to_balance).await?;

        let now = Utc::now();
        let out = LedgerEntry::debit(
            from,
            amount,
            EntryKind::TransferOut { to },
            receipt.from_balance,
            now,
        );
        let incoming = LedgerEntry::credit(
            to,
            amount,
            EntryKind::TransferIn { from },
            receipt.to_balance,
            now,
        );
        Self::append_entry(&mut tx, &out).await?;
        Self::append_entry(&mut tx, &incoming).await?;

        tx.commit().await?;
        Ok(receipt)
    }

    async fn award_lot(&self, award: Award) -> Result<Lot> {
        award.ensure_ticket_matches()?;

        let mut tx = self.begin().await?;
        if award.exclusive {
            Self::ensure_kermesse(&mut tx, award.kermesse, true).await?;
        }
        let mut lot = Self::lock_lot(&mut tx, award.lot).await?;
        if lot.kermesse() != award.kermesse {
            return Err(LedgerError::unknown(EntityKind::Lot, award.lot).into());
        }
        lot.ensure_undrawn()?;

        let winner = award.ticket.account;
        if award.exclusive {
            let already_won: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM lots WHERE kermesse_id = $1 AND winner_id = $2)",
            )
            .bind(award.kermesse.as_uuid())
            .bind(winner.as_uuid())
            .fetch_one(&mut *tx)
            .await?;
            if already_won {
                return Err(StoreError::conflict(
                    format!("kermesse {}", award.kermesse),
                    format!("account {winner} already won a lot"),
                ));
            }
        }

        lot.award(&award.ticket, Utc::now())?;
        sqlx::query(
            "UPDATE lots SET winner_id = $2, winning_ticket_id = $3, drawn_at = $4 WHERE id = $1",
        )
        .bind(award.lot.as_uuid())
        .bind(winner.as_uuid())
        .bind(award.ticket.id.as_uuid())
        .bind(lot.drawn_at())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(lot)
    }

    async fn apply_external_credit(&self, credit: ExternalCredit) -> Result<CreditOutcome> {
        credit.validate()?;
        if let Some(event) = self.get_credit_event(&credit.event_id).await? {
            return Ok(CreditOutcome::replayed(event));
        }

        let mut tx = self.begin().await?;
        let mut account = Self::lock_account(&mut tx, credit.account).await?;

        let now = Utc::now();
        let balance = account.credit(credit.amount)?;
        let event = CreditEvent::record(&credit, balance, now);

        // Concurrent deliveries of one event id block on the primary key;
        // only the first insert reports a row.
        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_events (event_id, account_id, amount, balance_after, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(event.account.as_uuid())
        .bind(to_db(event.amount)?)
        .bind(to_db(event.balance_after)?)
        .bind(event.processed_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            tracing::debug!(event_id = %credit.event_id, "external credit replayed");
            let recorded = self
                .get_credit_event(&credit.event_id)
                .await?
                .ok_or_else(|| StoreError::Corrupt {
                    table: "credit_events",
                    reason: format!("event {} vanished after conflict", credit.event_id),
                })?;
            return Ok(CreditOutcome::replayed(recorded));
        }

        Self::write_balance(&mut tx, credit.account, balance).await?;
        let entry = LedgerEntry::credit(
            credit.account,
            credit.amount,
            EntryKind::ExternalCredit {
                event_id: credit.event_id.clone(),
            },
            balance,
            now,
        );
        Self::append_entry(&mut tx, &entry).await?;

        tx.commit().await?;
        Ok(CreditOutcome::applied(event))
    }
}
