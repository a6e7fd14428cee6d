use domain::LedgerError;
use ledger_store::StoreError;
use thiserror::Error;

/// Errors returned by the engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request broke a ledger rule. Nothing was changed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The request kept losing races for the same entities and gave up.
    /// Nothing was changed; the caller may try again later.
    #[error("Operation abandoned after {attempts} conflicting attempts")]
    Conflict { attempts: usize },

    /// The underlying store failed.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    /// Returns true if the caller can reasonably resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// Short, stable label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::Ledger(err) => match err {
                LedgerError::InsufficientFunds { .. } => "insufficient_funds",
                LedgerError::InsufficientStock { .. } => "insufficient_stock",
                LedgerError::NoTicketsAvailable { .. } => "no_tickets_available",
                LedgerError::LotAlreadyDrawn { .. } => "lot_already_drawn",
                LedgerError::UnknownEntity { .. } => "unknown_entity",
                LedgerError::InvalidAmount { .. } => "invalid_amount",
                LedgerError::AmountOverflow => "amount_overflow",
                LedgerError::InvalidQuantity { .. } => "invalid_quantity",
                LedgerError::InvalidTransfer { .. } => "invalid_transfer",
                LedgerError::InvalidEventId => "invalid_event_id",
            },
            EngineError::Conflict { .. } => "conflict",
            EngineError::Store(_) => "store",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(rule) => EngineError::Ledger(rule),
            StoreError::Conflict { .. } => EngineError::Conflict { attempts: 1 },
            other => EngineError::Store(other),
        }
    }
}
