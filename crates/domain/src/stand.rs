//! Stands and their stock.

use common::{KermesseId, StandId, Tokens};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// What a stand offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StandKind {
    #[default]
    Food,
    Drink,
    Activity,
}

impl StandKind {
    /// Returns the kind as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StandKind::Food => "food",
            StandKind::Drink => "drink",
            StandKind::Activity => "activity",
        }
    }

    /// Parses a kind from its lowercase string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "food" => Some(StandKind::Food),
            "drink" => Some(StandKind::Drink),
            "activity" => Some(StandKind::Activity),
            _ => None,
        }
    }
}

impl std::fmt::Display for StandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A kermesse sales point with priced, finite-stock goods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stand {
    id: StandId,
    kermesse: KermesseId,
    name: String,
    kind: StandKind,
    stock: u32,
    unit_price: Tokens,
}

impl Stand {
    pub fn new(
        id: StandId,
        kermesse: KermesseId,
        name: impl Into<String>,
        kind: StandKind,
        stock: u32,
        unit_price: Tokens,
    ) -> Self {
        Self {
            id,
            kermesse,
            name: name.into(),
            kind,
            stock,
            unit_price,
        }
    }

    pub fn id(&self) -> StandId {
        self.id
    }

    pub fn kermesse(&self) -> KermesseId {
        self.kermesse
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StandKind {
        self.kind
    }

    pub fn stock(&self) -> u32 {
        self.stock
    }

    pub fn unit_price(&self) -> Tokens {
        self.unit_price
    }

    /// Returns the total cost of `quantity` units.
    pub fn quote(&self, quantity: u32) -> Result<Tokens, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity { quantity });
        }
        self.unit_price
            .checked_mul(quantity)
            .ok_or(LedgerError::AmountOverflow)
    }

    /// Checks that `quantity` units are in stock, without taking them.
    pub fn ensure_in_stock(&self, quantity: u32) -> Result<(), LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity { quantity });
        }
        if self.stock < quantity {
            return Err(LedgerError::InsufficientStock {
                stand: self.id,
                available: self.stock,
                requested: quantity,
            });
        }
        Ok(())
    }

    /// Takes `quantity` units out of stock and returns the remaining stock.
    ///
    /// On failure the stock is left untouched.
    pub fn reserve(&mut self, quantity: u32) -> Result<u32, LedgerError> {
        self.ensure_in_stock(quantity)?;
        self.stock -= quantity;
        Ok(self.stock)
    }
}
